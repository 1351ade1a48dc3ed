//! # gadget-ebpf
//!
//! Userspace companions of the kernel probes used by gadgets.
//!
//! - [`latency`]: matches responses to requests and reports the elapsed time.
//! - [`map`]: the view of a kernel hash map this crate works against.
//! - [`gc`]: periodic removal of map entries whose response never came.
//!
//! With the `ebpf` feature on Linux, [`bpf`] opens pinned kernel maps
//! through `aya`.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

#[cfg(all(feature = "ebpf", target_os = "linux"))]
pub mod bpf;
pub mod gc;
pub mod latency;
pub mod map;
