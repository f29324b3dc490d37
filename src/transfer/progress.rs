//! Transfer progress reporting

use std::fmt;
use std::sync::Arc;

/// Receives progress as a percentage in `0.0..=100.0`
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, percent: f64);
}

impl<F> ProgressObserver for F
where
    F: Fn(f64) + Send + Sync,
{
    fn on_progress(&self, percent: f64) {
        self(percent)
    }
}

/// Normalizes raw (done, total) counts into a percentage that never exceeds
/// 100 and never moves backwards within one meter's lifetime.
pub struct ProgressMeter {
    observer: Option<Arc<dyn ProgressObserver>>,
    last: f64,
}

impl ProgressMeter {
    pub fn new(observer: Arc<dyn ProgressObserver>) -> Self {
        Self {
            observer: Some(observer),
            last: 0.0,
        }
    }

    /// A meter nobody listens to
    pub fn silent() -> Self {
        Self {
            observer: None,
            last: 0.0,
        }
    }

    pub fn from_option(observer: Option<Arc<dyn ProgressObserver>>) -> Self {
        match observer {
            Some(o) => Self::new(o),
            None => Self::silent(),
        }
    }

    /// Record `done` of `total` units (bytes or items)
    pub fn update(&mut self, done: u64, total: u64) {
        let percent = if total == 0 {
            100.0
        } else {
            (done as f64 / total as f64 * 100.0).min(100.0)
        };

        if percent < self.last {
            return;
        }
        self.last = percent;

        if let Some(observer) = &self.observer {
            observer.on_progress(percent);
        }
    }

    /// Mark the unit of work complete
    pub fn complete(&mut self) {
        self.update(1, 1);
    }

    /// Last reported percentage
    pub fn percent(&self) -> f64 {
        self.last
    }
}

impl fmt::Debug for ProgressMeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressMeter")
            .field("last", &self.last)
            .field("observed", &self.observer.is_some())
            .finish()
    }
}
