use std::path::PathBuf;

use thiserror::Error;

/// How far a failure propagates through a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Aborts the whole operation.
    Fatal,
    /// Logged; the slide is skipped and the batch continues.
    SlideRecoverable,
    /// The tile is dropped silently.
    TileRecoverable,
    /// Retried with backoff.
    ResourceContention,
}

#[derive(Debug, Error)]
pub enum TileError {
    #[error("slide {slide} has no microns-per-pixel metadata")]
    MissingResolution { slide: String },

    #[error("slide {slide}: ROI method '{method}' requires ROIs but none were found")]
    MissingRoi { slide: String, method: String },

    #[error("failed to load slide {path}: {reason}")]
    SlideLoad { path: PathBuf, reason: String },

    #[error("cannot tile slide: {0}")]
    Geometry(String),

    #[error("quality control failed for slide {slide}: {reason}")]
    Qc { slide: String, reason: String },

    #[error("tile at ({x}, {y}) is unusable: {reason}")]
    TileCorruption { x: i64, y: i64, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("slide {slide} is assigned to multiple patients ({first}, {second})")]
    DuplicatePatient {
        slide: String,
        first: String,
        second: String,
    },

    #[error("patient {patient} has multiple outcome labels ({labels})")]
    MultipleLabels { patient: String, labels: String },

    #[error("patient {patient} has slides from multiple sites ({sites})")]
    MultipleSites { patient: String, sites: String },

    #[error("insufficient data for split: {0}")]
    InsufficientDataForSplit(String),

    #[error("dataset split error: {0}")]
    DatasetSplit(String),

    #[error("site-preserved splitting requires a site solver, none is available")]
    SolverUnavailable,

    #[error("record container {path} is corrupt: {reason}")]
    RecordCorruption { path: PathBuf, reason: String },

    #[error("no record containers found")]
    NoContainers,

    #[error("staging buffer is full")]
    BufferFull,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TileError {
    pub fn severity(&self) -> Severity {
        match self {
            TileError::MissingResolution { .. }
            | TileError::MissingRoi { .. }
            | TileError::SlideLoad { .. }
            | TileError::Geometry(_)
            | TileError::Qc { .. }
            | TileError::RecordCorruption { .. } => Severity::SlideRecoverable,
            TileError::TileCorruption { .. } => Severity::TileRecoverable,
            TileError::BufferFull => Severity::ResourceContention,
            TileError::InvalidConfig(_)
            | TileError::DuplicatePatient { .. }
            | TileError::MultipleLabels { .. }
            | TileError::MultipleSites { .. }
            | TileError::InsufficientDataForSplit(_)
            | TileError::DatasetSplit(_)
            | TileError::SolverUnavailable
            | TileError::NoContainers
            | TileError::Io(_) => Severity::Fatal,
        }
    }
}

/// Classify an `anyhow` error raised while processing one slide.
///
/// Untyped errors (decoder failures, I/O on the slide file) count as
/// slide-recoverable: they are local to the slide being read.
pub fn slide_severity(err: &anyhow::Error) -> Severity {
    match err.downcast_ref::<TileError>() {
        Some(TileError::Io(_)) => Severity::SlideRecoverable,
        Some(e) => e.severity(),
        None => Severity::SlideRecoverable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classes() {
        assert_eq!(
            TileError::MissingRoi { slide: "s".into(), method: "inside".into() }.severity(),
            Severity::SlideRecoverable
        );
        assert_eq!(TileError::DatasetSplit("leak".into()).severity(), Severity::Fatal);
        assert_eq!(TileError::BufferFull.severity(), Severity::ResourceContention);
        assert_eq!(
            TileError::TileCorruption { x: 0, y: 0, reason: "solid".into() }.severity(),
            Severity::TileRecoverable
        );
    }

    #[test]
    fn test_slide_severity_through_anyhow() {
        let err: anyhow::Error = TileError::InvalidConfig("tile_px".into()).into();
        assert_eq!(slide_severity(&err), Severity::Fatal);

        let err = anyhow::anyhow!("decoder exploded");
        assert_eq!(slide_severity(&err), Severity::SlideRecoverable);

        let err: anyhow::Error = TileError::MissingResolution { slide: "a".into() }.into();
        let err = err.context("opening a");
        assert_eq!(slide_severity(&err), Severity::SlideRecoverable);
    }
}
