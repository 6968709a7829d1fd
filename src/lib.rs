pub mod config;
pub mod core;
pub mod dataset;
pub mod error;
pub mod extract;
pub mod grid;
pub mod manifest;
pub mod progress;
pub mod qc;
pub mod roi;
pub mod runner;
pub mod sampler;
pub mod slide;
pub mod split;

// Re-exports for easy access
pub use config::ExtractionConfig;
pub use dataset::{Annotations, Dataset};
pub use error::{Severity, TileError};
pub use extract::{extract_slide, ExtractOptions, SlideReport};
pub use runner::{run_extraction, Isolation, RunnerOptions};
pub use sampler::{SampledTile, SamplerOptions, TileSampler};
pub use slide::Slide;
pub use split::{split, SplitRequest, SplitResult, SplitStrategy};
