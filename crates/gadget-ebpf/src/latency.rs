//! Request/response latency correlation.
//!
//! Requests are remembered in two bounded generations. When the current
//! generation fills up it replaces the previous one, which is discarded
//! wholesale. Memory therefore never exceeds twice the per-generation
//! capacity and no timer is needed, at the price of forgetting requests once
//! enough newer ones have arrived.

use std::collections::HashMap;
use std::mem;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use gadget_common::config::CorrelatorConfig;

/// Identifies one outstanding request.
///
/// The address is the request's source (the response's destination). IPv4
/// addresses occupy the first four bytes, matching the kernel event layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    /// IPv4 or IPv6 address bytes.
    pub addr: [u8; 16],
    /// Transaction identifier, e.g. the DNS header ID.
    pub id: u16,
}

impl CorrelationKey {
    /// Creates a key from raw address bytes.
    #[must_use]
    pub const fn new(addr: [u8; 16], id: u16) -> Self {
        Self { addr, id }
    }

    /// Creates a key from an IP address.
    #[must_use]
    pub fn from_ip(ip: IpAddr, id: u16) -> Self {
        let mut addr = [0u8; 16];
        match ip {
            IpAddr::V4(v4) => addr[..4].copy_from_slice(&v4.octets()),
            IpAddr::V6(v6) => addr = v6.octets(),
        }
        Self { addr, id }
    }
}

#[derive(Debug, Default)]
struct Generations {
    current: HashMap<CorrelationKey, u64>,
    previous: HashMap<CorrelationKey, u64>,
}

/// Matches responses to their requests and reports the elapsed time.
///
/// All operations take a single internal lock and are safe to call from
/// any number of threads.
#[derive(Debug)]
pub struct LatencyCorrelator {
    capacity: usize,
    generations: Mutex<Generations>,
}

impl LatencyCorrelator {
    /// Creates a correlator tracking up to `2 * config.capacity` requests.
    #[must_use]
    pub fn new(config: CorrelatorConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            capacity,
            generations: Mutex::new(Generations {
                current: HashMap::with_capacity(capacity),
                previous: HashMap::new(),
            }),
        }
    }

    /// Per-generation capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remembers the timestamp (nanoseconds) of a request.
    ///
    /// A full current generation is rotated out first, even when `key` is
    /// already present. Recording the same key again overwrites the stored
    /// timestamp.
    pub fn record_request(&self, key: CorrelationKey, timestamp_ns: u64) {
        let mut generations = self.lock();
        if generations.current.len() >= self.capacity {
            let full = mem::replace(&mut generations.current, HashMap::with_capacity(self.capacity));
            let dropped = mem::replace(&mut generations.previous, full);
            if !dropped.is_empty() {
                tracing::trace!(dropped = dropped.len(), "rotated out unanswered requests");
            }
        }
        let _ = generations.current.insert(key, timestamp_ns);
    }

    /// Resolves a response and returns its latency.
    ///
    /// The matching request is forgotten. Returns [`Duration::ZERO`] when no
    /// request is known for `key` (never seen, or already rotated out) and
    /// when the request timestamp is not strictly earlier than
    /// `timestamp_ns`.
    pub fn resolve_response(&self, key: CorrelationKey, timestamp_ns: u64) -> Duration {
        let request_ns = {
            let mut generations = self.lock();
            match generations.current.remove(&key) {
                Some(ts) => ts,
                None => match generations.previous.remove(&key) {
                    Some(ts) => ts,
                    None => return Duration::ZERO,
                },
            }
        };

        if request_ns >= timestamp_ns {
            return Duration::ZERO;
        }
        Duration::from_nanos(timestamp_ns - request_ns)
    }

    /// Number of requests still waiting for a response.
    #[must_use]
    pub fn outstanding_count(&self) -> usize {
        let generations = self.lock();
        generations.current.len() + generations.previous.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Generations> {
        self.generations.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LatencyCorrelator {
    fn default() -> Self {
        Self::new(CorrelatorConfig::default())
    }
}
