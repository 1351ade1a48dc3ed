//! Garbage collection of stale kernel map entries.
//!
//! A probe deletes its map entry when the response to a request arrives.
//! Responses that never arrive (dropped UDP replies, killed clients) would
//! leave entries behind forever; the collector periodically removes entries
//! older than a cutoff.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use gadget_common::config::GcConfig;
use gadget_core::clock::Clock;

use crate::map::{KernelMap, MapError};

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries read from the map.
    pub scanned: usize,
    /// Entries deleted by this sweep.
    pub deleted: usize,
    /// Stale entries already removed by the probe before we got to them.
    pub already_gone: usize,
    /// Deletions that failed for another reason.
    pub failed: usize,
    /// Whether the scan visited the whole map.
    pub complete: bool,
}

/// One pass over a kernel map.
///
/// Object-safe so the collector's worker does not depend on the key layout.
pub trait MapSweeper: Send + Sync {
    /// Removes stale entries and reports what happened. Never fails.
    fn sweep(&self) -> SweepReport;
}

/// Deletes entries of `M` whose creation timestamp is at least `cutoff` old.
pub struct StaleEntrySweep<M> {
    map: Arc<M>,
    clock: Arc<dyn Clock>,
    cutoff: Duration,
}

impl<M: KernelMap> StaleEntrySweep<M> {
    /// Creates a sweep over `map`, ageing entries against `clock`.
    pub fn new(map: Arc<M>, clock: Arc<dyn Clock>, cutoff: Duration) -> Self {
        Self { map, clock, cutoff }
    }
}

impl<M: KernelMap> MapSweeper for StaleEntrySweep<M> {
    fn sweep(&self) -> SweepReport {
        let name = self.map.name();
        let now_ns = self.clock.boot_time_ns();
        let scan = self.map.scan();

        let mut report = SweepReport {
            scanned: scan.entries.len(),
            complete: scan.error.is_none(),
            ..SweepReport::default()
        };

        let keys_to_delete: Vec<M::Key> = scan
            .entries
            .into_iter()
            .filter(|(_, created_ns)| Duration::from_nanos(now_ns.saturating_sub(*created_ns)) >= self.cutoff)
            .map(|(key, _)| key)
            .collect();

        match scan.error {
            None => {}
            Some(MapError::IterationAborted(reason)) => tracing::warn!(
                map = name,
                %reason,
                "iteration aborted, possibly by concurrent deletes; some entries are left for the next cycle"
            ),
            Some(e) => tracing::error!(map = name, error = %e, "iterating kernel map failed"),
        }

        for key in &keys_to_delete {
            match self.map.delete(key) {
                Ok(()) => {
                    report.deleted += 1;
                    tracing::debug!(map = name, ?key, "deleted stale entry");
                }
                Err(MapError::KeyNotFound) => {
                    // Deleted by the probe meanwhile, or seen twice during a racing scan.
                    report.already_gone += 1;
                    tracing::debug!(map = name, ?key, "stale entry already gone");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!(map = name, ?key, error = %e, "could not delete stale entry");
                }
            }
        }

        report
    }
}

struct Worker {
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

/// Background worker sweeping one kernel map on a fixed interval.
pub struct GarbageCollector {
    sweeper: Arc<dyn MapSweeper>,
    interval: Duration,
    worker: Option<Worker>,
}

impl GarbageCollector {
    /// Creates a stopped collector.
    pub fn new(sweeper: Arc<dyn MapSweeper>, interval: Duration) -> Self {
        Self {
            sweeper,
            interval,
            worker: None,
        }
    }

    /// Creates a stopped collector deleting entries of `map` older than
    /// `config.cutoff` every `config.interval`.
    pub fn for_map<M: KernelMap + 'static>(map: Arc<M>, clock: Arc<dyn Clock>, config: GcConfig) -> Self {
        let sweep = StaleEntrySweep::new(map, clock, config.cutoff);
        Self::new(Arc::new(sweep), config.interval)
    }

    /// Runs one sweep on the calling thread.
    pub fn sweep_once(&self) -> SweepReport {
        self.sweeper.sweep()
    }

    /// Whether the background worker is running.
    pub const fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Starts the background worker. Does nothing if it already runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker thread cannot be spawned.
    pub fn start(&mut self) -> std::io::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        tracing::info!(interval = ?self.interval, "starting kernel map garbage collection");
        let (cancel, cancelled) = mpsc::channel::<()>();
        let sweeper = Arc::clone(&self.sweeper);
        let interval = self.interval;

        let handle = std::thread::Builder::new()
            .name("gadget-map-gc".into())
            .spawn(move || {
                loop {
                    let report = sweeper.sweep();
                    tracing::debug!(?report, "kernel map garbage collection cycle");
                    match cancelled.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        self.worker = Some(Worker { cancel, handle });
        Ok(())
    }

    /// Stops the background worker and waits for it to exit. Does nothing
    /// if it is not running.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        tracing::info!("stopping kernel map garbage collection");
        let _ = worker.cancel.send(());
        if worker.handle.join().is_err() {
            tracing::error!("garbage collection worker panicked");
        }
    }
}

impl Drop for GarbageCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use gadget_core::clock::ManualClock;

    use super::*;

    const SEC: u64 = 1_000_000_000;

    /// In-memory map with failure injection.
    #[derive(Default)]
    struct FakeMap {
        entries: Mutex<BTreeMap<u32, u64>>,
        abort_after: Option<usize>,
        vanish_on_delete: Vec<u32>,
        broken_keys: Vec<u32>,
        scans: AtomicUsize,
    }

    impl FakeMap {
        fn with_entries(entries: &[(u32, u64)]) -> Self {
            Self {
                entries: Mutex::new(entries.iter().copied().collect()),
                ..Self::default()
            }
        }

        fn keys(&self) -> Vec<u32> {
            self.entries.lock().unwrap().keys().copied().collect()
        }
    }

    impl KernelMap for FakeMap {
        type Key = u32;

        fn scan(&self) -> crate::map::MapScan<u32> {
            let _ = self.scans.fetch_add(1, Ordering::SeqCst);
            let entries: Vec<_> = self
                .entries
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| (*k, *v))
                .collect();
            match self.abort_after {
                Some(n) if n < entries.len() => crate::map::MapScan::partial(
                    entries.into_iter().take(n).collect(),
                    MapError::IterationAborted("concurrent delete".into()),
                ),
                _ => crate::map::MapScan::complete(entries),
            }
        }

        fn delete(&self, key: &u32) -> Result<(), MapError> {
            if self.broken_keys.contains(key) {
                return Err(MapError::Other("permission denied".into()));
            }
            let mut entries = self.entries.lock().unwrap();
            if self.vanish_on_delete.contains(key) {
                let _ = entries.remove(key);
                return Err(MapError::KeyNotFound);
            }
            entries.remove(key).map(|_| ()).ok_or(MapError::KeyNotFound)
        }

        fn name(&self) -> &str {
            "fake_query_map"
        }
    }

    fn sweep(map: &Arc<FakeMap>, now_ns: u64) -> SweepReport {
        let clock = Arc::new(ManualClock::new(now_ns));
        StaleEntrySweep::new(Arc::clone(map), clock, Duration::from_secs(10)).sweep()
    }

    #[test]
    fn deletes_only_entries_past_cutoff() {
        let now = 100 * SEC;
        let map = Arc::new(FakeMap::with_entries(&[
            (1, now - 2 * SEC),
            (2, now - 12 * SEC),
            (3, now - 20 * SEC),
        ]));

        let report = sweep(&map, now);

        assert_eq!(map.keys(), vec![1]);
        assert_eq!(report.scanned, 3);
        assert_eq!(report.deleted, 2);
        assert!(report.complete);
    }

    #[test]
    fn entry_exactly_at_cutoff_is_deleted() {
        let now = 50 * SEC;
        let map = Arc::new(FakeMap::with_entries(&[(1, now - 10 * SEC)]));
        let report = sweep(&map, now);
        assert_eq!(report.deleted, 1);
        assert!(map.keys().is_empty());
    }

    #[test]
    fn future_timestamps_are_kept() {
        let now = 50 * SEC;
        let map = Arc::new(FakeMap::with_entries(&[(1, now + SEC)]));
        let report = sweep(&map, now);
        assert_eq!(report.deleted, 0);
        assert_eq!(map.keys(), vec![1]);
    }

    #[test]
    fn aborted_iteration_is_tolerated() {
        let now = 100 * SEC;
        let map = Arc::new(FakeMap {
            abort_after: Some(1),
            ..FakeMap::with_entries(&[(1, now - 20 * SEC), (2, now - 30 * SEC)])
        });

        let report = sweep(&map, now);
        assert!(!report.complete);
        assert_eq!(report.deleted, 1);
        assert_eq!(map.keys(), vec![2]);

        let report = sweep(&map, now);
        assert!(report.complete);
        assert_eq!(report.deleted, 1);
        assert!(map.keys().is_empty());
    }

    #[test]
    fn already_deleted_key_counts_as_success() {
        let now = 100 * SEC;
        let map = Arc::new(FakeMap {
            vanish_on_delete: vec![2],
            ..FakeMap::with_entries(&[(1, now - 20 * SEC), (2, now - 20 * SEC)])
        });
        let report = sweep(&map, now);
        assert_eq!(report.deleted, 1);
        assert_eq!(report.already_gone, 1);
        assert_eq!(report.failed, 0);
        assert!(map.keys().is_empty());
    }

    #[test]
    fn failed_delete_does_not_stop_sweep() {
        let now = 100 * SEC;
        let map = Arc::new(FakeMap {
            broken_keys: vec![1],
            ..FakeMap::with_entries(&[(1, now - 20 * SEC), (2, now - 20 * SEC), (3, now - 20 * SEC)])
        });
        let report = sweep(&map, now);
        assert_eq!(report.failed, 1);
        assert_eq!(report.deleted, 2);
        assert_eq!(map.keys(), vec![1]);
    }

    #[test]
    fn start_and_stop_are_idempotent() {
        let map = Arc::new(FakeMap::default());
        let clock = Arc::new(ManualClock::new(0));
        let config = GcConfig {
            interval: Duration::from_millis(5),
            cutoff: Duration::from_secs(10),
        };
        let mut gc = GarbageCollector::for_map(Arc::clone(&map), clock, config);

        gc.stop();
        assert!(!gc.is_running());

        gc.start().unwrap();
        gc.start().unwrap();
        assert!(gc.is_running());

        std::thread::sleep(Duration::from_millis(30));
        gc.stop();
        gc.stop();
        assert!(!gc.is_running());

        let scans = map.scans.load(Ordering::SeqCst);
        assert!(scans >= 1);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(map.scans.load(Ordering::SeqCst), scans, "worker kept running after stop");
    }

    #[test]
    fn worker_collects_entries_that_age_out() {
        let map = Arc::new(FakeMap::with_entries(&[(7, SEC)]));
        let clock = Arc::new(ManualClock::new(SEC));
        let config = GcConfig {
            interval: Duration::from_millis(2),
            cutoff: Duration::from_secs(10),
        };
        let mut gc = GarbageCollector::for_map(Arc::clone(&map), Arc::clone(&clock) as Arc<dyn Clock>, config);
        gc.start().unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(map.keys(), vec![7]);

        clock.advance(Duration::from_secs(11));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !map.keys().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        gc.stop();
        assert!(map.keys().is_empty());
    }

    #[test]
    fn sweep_once_delegates_to_sweeper() {
        let now = 100 * SEC;
        let map = Arc::new(FakeMap::with_entries(&[(1, now - 20 * SEC)]));
        let gc = GarbageCollector::for_map(
            Arc::clone(&map),
            Arc::new(ManualClock::new(now)),
            GcConfig::default(),
        );
        assert_eq!(gc.sweep_once().deleted, 1);
        assert!(!gc.is_running());
    }
}
