//! The health sentinel: a background probe with a mutex-protected sample.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::warn;

/// The latest probe result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthSample {
    pub ok: bool,
    pub at: DateTime<Utc>,
}

/// A long-lived sentinel thread that re-runs a probe on a fixed interval.
///
/// The first probe runs synchronously in [`HealthMonitor::start`], so a
/// sample is always available. Health freshness is bounded by one interval.
pub struct HealthMonitor {
    cell: Arc<Mutex<HealthSample>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

    /// Start the sentinel with a probe that reports database liveness.
    pub fn start<F>(probe: F, interval: Duration) -> Self
    where
        F: Fn() -> bool + Send + 'static,
    {
        let first = HealthSample {
            ok: probe(),
            at: Utc::now(),
        };
        if !first.ok {
            warn!("storage is in failed health at startup");
        }
        let cell = Arc::new(Mutex::new(first));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_cell = Arc::clone(&cell);
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("settra-health".to_string())
            .spawn(move || {
                loop {
                    let deadline = std::time::Instant::now() + interval;
                    while std::time::Instant::now() < deadline {
                        if thread_stop.load(Ordering::Relaxed) {
                            return;
                        }
                        thread::sleep(Duration::from_millis(50).min(interval));
                    }
                    let ok = probe();
                    if !ok {
                        warn!("storage is in failed health");
                    }
                    let mut sample = lock_cell(&thread_cell);
                    *sample = HealthSample { ok, at: Utc::now() };
                }
            })
            .ok();

        Self { cell, stop, handle }
    }

    /// The most recent sample.
    pub fn sample(&self) -> HealthSample {
        *lock_cell(&self.cell)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn lock_cell(cell: &Mutex<HealthSample>) -> std::sync::MutexGuard<'_, HealthSample> {
    match cell.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn first_sample_is_taken_synchronously() {
        let monitor = HealthMonitor::start(|| true, Duration::from_secs(60));
        assert!(monitor.sample().ok);

        let monitor = HealthMonitor::start(|| false, Duration::from_secs(60));
        assert!(!monitor.sample().ok);
    }

    #[test]
    fn the_probe_reruns_on_the_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let probe_calls = Arc::clone(&calls);
        let monitor = HealthMonitor::start(
            move || {
                probe_calls.fetch_add(1, Ordering::Relaxed);
                true
            },
            Duration::from_millis(30),
        );
        thread::sleep(Duration::from_millis(120));
        drop(monitor);
        assert!(calls.load(Ordering::Relaxed) >= 2);
    }

    #[test]
    fn dropping_the_monitor_stops_the_thread_promptly() {
        let monitor = HealthMonitor::start(|| true, Duration::from_secs(3600));
        let started = std::time::Instant::now();
        drop(monitor);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
