//! # gadget-core
//!
//! Low-level Linux primitives shared by every gadget.
//!
//! This crate provides safe abstractions over:
//! - **Network namespaces**: running a closure inside the namespace of a
//!   container process via `setns(2)`.
//! - **Packet filter**: appending and deleting `iptables` rules.
//! - **Clock**: the boot-relative clock kernel probes timestamp events with.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod clock;
pub mod namespace;
pub mod netfilter;
