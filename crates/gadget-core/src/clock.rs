//! Boot-relative time.
//!
//! Kernel probes stamp events with `bpf_ktime_get_boot_ns()`, which counts
//! from boot and keeps running across suspend. Userspace compares against
//! the same clock and converts to wall-clock time only for display.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Source of boot-relative timestamps.
pub trait Clock: Send + Sync {
    /// Nanoseconds elapsed since boot, including time spent suspended.
    fn boot_time_ns(&self) -> u64;
}

/// The host's `CLOCK_BOOTTIME`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn boot_time_ns(&self) -> u64 {
        use nix::time::{ClockId, clock_gettime};

        #[cfg(any(target_os = "linux", target_os = "android"))]
        let id = ClockId::CLOCK_BOOTTIME;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let id = ClockId::CLOCK_MONOTONIC;

        match clock_gettime(id) {
            Ok(ts) => timespec_ns(i64::from(ts.tv_sec()), i64::from(ts.tv_nsec())),
            Err(e) => {
                tracing::error!(error = %e, "reading boot clock failed");
                0
            }
        }
    }
}

#[allow(clippy::cast_sign_loss)]
fn timespec_ns(secs: i64, nanos: i64) -> u64 {
    (secs.max(0) as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(nanos.max(0) as u64)
}

/// A clock that only moves when told to.
///
/// Used to drive sweeps deterministically.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    /// Creates a clock reading `now_ns`.
    #[must_use]
    pub const fn new(now_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(now_ns),
        }
    }

    /// Moves the clock forward by `by`.
    #[allow(clippy::cast_possible_truncation)]
    pub fn advance(&self, by: Duration) {
        let _ = self.now_ns.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Sets the current reading.
    pub fn set(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn boot_time_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }
}

/// Converts a boot-relative kernel timestamp into wall-clock time.
#[must_use]
pub fn wall_time_from_boot_time(boot_ns: u64) -> DateTime<Utc> {
    wall_time_at(boot_ns, SystemClock.boot_time_ns(), Utc::now())
}

#[allow(clippy::cast_possible_wrap)]
fn wall_time_at(boot_ns: u64, boot_now_ns: u64, wall_now: DateTime<Utc>) -> DateTime<Utc> {
    let delta = boot_now_ns.abs_diff(boot_ns).min(i64::MAX as u64) as i64;
    let offset = chrono::Duration::nanoseconds(delta);
    if boot_ns <= boot_now_ns {
        wall_now - offset
    } else {
        wall_now + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotonic() {
        let a = SystemClock.boot_time_ns();
        let b = SystemClock.boot_time_ns();
        assert!(a > 0);
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_micros(1));
        assert_eq!(clock.boot_time_ns(), 2_000);
        clock.set(5);
        assert_eq!(clock.boot_time_ns(), 5);
    }

    #[test]
    fn past_boot_time_maps_to_past_wall_time() {
        let wall_now = DateTime::parse_from_rfc3339("2024-01-01T00:00:10Z")
            .unwrap()
            .with_timezone(&Utc);
        let converted = wall_time_at(3_000_000_000, 10_000_000_000, wall_now);
        assert_eq!(converted.to_rfc3339(), "2024-01-01T00:00:03+00:00");
    }

    #[test]
    fn timespec_conversion() {
        assert_eq!(timespec_ns(2, 5), 2_000_000_005);
        assert_eq!(timespec_ns(-1, 0), 0);
    }
}
