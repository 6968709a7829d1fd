use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

/// Cross-worker extraction progress. Shared by reference into every slide task;
/// the counters are the only state workers mutate concurrently.
pub struct ExtractionProgress {
    total_slides: usize,
    slides_done: AtomicUsize,
    slides_failed: AtomicUsize,
    slides_skipped: AtomicUsize,
    tiles_written: AtomicU64,
    slide_latency_sum_us: AtomicU64,
    slide_latency_max_us: AtomicU64,
    /// Serializes progress lines and remembers the last slide finished.
    last_slide: Mutex<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub total_slides: usize,
    pub slides_done: usize,
    pub slides_failed: usize,
    pub slides_skipped: usize,
    pub tiles_written: u64,
    pub slide_latency_avg_ms: f64,
    pub slide_latency_max_ms: f64,
    pub last_slide: Option<String>,
}

impl ExtractionProgress {
    pub fn new(total_slides: usize) -> Arc<Self> {
        Arc::new(Self {
            total_slides,
            slides_done: AtomicUsize::new(0),
            slides_failed: AtomicUsize::new(0),
            slides_skipped: AtomicUsize::new(0),
            tiles_written: AtomicU64::new(0),
            slide_latency_sum_us: AtomicU64::new(0),
            slide_latency_max_us: AtomicU64::new(0),
            last_slide: Mutex::new(None),
        })
    }

    /// Count one finished slide. Returns how many slides have finished.
    pub fn record_slide(&self, slide: &str, tiles: usize, elapsed: Duration) -> usize {
        self.tiles_written.fetch_add(tiles as u64, Ordering::Relaxed);
        let latency_us = elapsed.as_micros() as u64;
        self.slide_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let mut current = self.slide_latency_max_us.load(Ordering::Relaxed);
        while latency_us > current {
            match self.slide_latency_max_us.compare_exchange_weak(
                current,
                latency_us,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current = x,
            }
        }
        self.finish(slide)
    }

    pub fn record_failure(&self, slide: &str) -> usize {
        self.slides_failed.fetch_add(1, Ordering::Relaxed);
        self.finish(slide)
    }

    pub fn record_skip(&self, slide: &str) -> usize {
        self.slides_skipped.fetch_add(1, Ordering::Relaxed);
        self.finish(slide)
    }

    fn finish(&self, slide: &str) -> usize {
        let mut last = self.last_slide.lock();
        let done = self.slides_done.fetch_add(1, Ordering::Relaxed) + 1;
        *last = Some(slide.to_string());
        info!("[{}/{}] slides processed ({})", done, self.total_slides, slide);
        done
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let done = self.slides_done.load(Ordering::Relaxed);
        let timed = done
            .saturating_sub(self.slides_failed.load(Ordering::Relaxed))
            .saturating_sub(self.slides_skipped.load(Ordering::Relaxed));
        let sum_us = self.slide_latency_sum_us.load(Ordering::Relaxed);
        ProgressSnapshot {
            total_slides: self.total_slides,
            slides_done: done,
            slides_failed: self.slides_failed.load(Ordering::Relaxed),
            slides_skipped: self.slides_skipped.load(Ordering::Relaxed),
            tiles_written: self.tiles_written.load(Ordering::Relaxed),
            slide_latency_avg_ms: if timed > 0 { sum_us as f64 / timed as f64 / 1000.0 } else { 0.0 },
            slide_latency_max_ms: self.slide_latency_max_us.load(Ordering::Relaxed) as f64 / 1000.0,
            last_slide: self.last_slide.lock().clone(),
        }
    }
}
