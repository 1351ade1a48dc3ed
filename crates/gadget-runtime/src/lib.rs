//! Trace lifecycle management for gadgets.
//!
//! [`rules::NetworkRuleManager`] places packet-trace rules in host and
//! container network namespaces, [`tracer::TracerLifecycle`] starts and
//! stops the pieces a trace needs, and [`registry::TraceManager`] drives
//! traces of any registered gadget kind.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod dns;
pub mod registry;
pub mod rules;
pub mod selector;
pub mod sink;
pub mod tracer;
