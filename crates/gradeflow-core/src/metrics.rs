//! Global atomic counters for gradeflow.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit all values as one `tracing::info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lock-free counters.
pub struct Metrics {
    submissions_received: AtomicU64,
    criteria_dispatched: AtomicU64,
    criteria_failed: AtomicU64,
    bundles_packed: AtomicU64,
    files_downloaded: AtomicU64,
    sandbox_callbacks: AtomicU64,
    events_published: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn bump(counter: &AtomicU64, by: u64, name: &'static str) {
    counter.fetch_add(by, Ordering::Relaxed);
    tracing::trace!(metric = name, by, "counter incremented");
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            submissions_received: AtomicU64::new(0),
            criteria_dispatched: AtomicU64::new(0),
            criteria_failed: AtomicU64::new(0),
            bundles_packed: AtomicU64::new(0),
            files_downloaded: AtomicU64::new(0),
            sandbox_callbacks: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
        }
    }

    pub fn inc_submissions_received(&self) {
        bump(&self.submissions_received, 1, "submissions_received");
    }

    pub fn add_criteria_dispatched(&self, n: u64) {
        bump(&self.criteria_dispatched, n, "criteria_dispatched");
    }

    pub fn add_criteria_failed(&self, n: u64) {
        bump(&self.criteria_failed, n, "criteria_failed");
    }

    pub fn inc_bundles_packed(&self) {
        bump(&self.bundles_packed, 1, "bundles_packed");
    }

    pub fn add_files_downloaded(&self, n: u64) {
        bump(&self.files_downloaded, n, "files_downloaded");
    }

    pub fn inc_sandbox_callbacks(&self) {
        bump(&self.sandbox_callbacks, 1, "sandbox_callbacks");
    }

    pub fn inc_events_published(&self) {
        bump(&self.events_published, 1, "events_published");
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call at natural boundaries (end of a request, shutdown) rather than on
    /// every increment.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            submissions_received = self.submissions_received(),
            criteria_dispatched = self.criteria_dispatched(),
            criteria_failed = self.criteria_failed(),
            bundles_packed = self.bundles_packed(),
            files_downloaded = self.files_downloaded(),
            sandbox_callbacks = self.sandbox_callbacks(),
            events_published = self.events_published(),
        );
    }

    pub fn submissions_received(&self) -> u64 {
        self.submissions_received.load(Ordering::Relaxed)
    }

    pub fn criteria_dispatched(&self) -> u64 {
        self.criteria_dispatched.load(Ordering::Relaxed)
    }

    pub fn criteria_failed(&self) -> u64 {
        self.criteria_failed.load(Ordering::Relaxed)
    }

    pub fn bundles_packed(&self) -> u64 {
        self.bundles_packed.load(Ordering::Relaxed)
    }

    pub fn files_downloaded(&self) -> u64 {
        self.files_downloaded.load(Ordering::Relaxed)
    }

    pub fn sandbox_callbacks(&self) -> u64 {
        self.sandbox_callbacks.load(Ordering::Relaxed)
    }

    pub fn events_published(&self) -> u64 {
        self.events_published.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.submissions_received,
            &self.criteria_dispatched,
            &self.criteria_failed,
            &self.bundles_packed,
            &self.files_downloaded,
            &self.sandbox_callbacks,
            &self.events_published,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_submissions_received();
        m.add_criteria_dispatched(3);
        m.add_criteria_failed(1);
        m.add_files_downloaded(2);
        m.add_files_downloaded(1);
        assert_eq!(m.submissions_received(), 1);
        assert_eq!(m.criteria_dispatched(), 3);
        assert_eq!(m.criteria_failed(), 1);
        assert_eq!(m.files_downloaded(), 3);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_bundles_packed();
        m.inc_sandbox_callbacks();
        m.inc_events_published();
        m.reset();
        assert_eq!(m.bundles_packed(), 0);
        assert_eq!(m.sandbox_callbacks(), 0);
        assert_eq!(m.events_published(), 0);
    }
}
