//! System-wide constants and defaults.

use std::time::Duration;

/// Per-generation capacity of the latency correlator.
pub const DEFAULT_CORRELATOR_CAPACITY: usize = 64;

/// Delay between two garbage-collection sweeps of a kernel map.
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(5);

/// Minimum age of a kernel map entry before it is considered stale.
pub const DEFAULT_GC_CUTOFF: Duration = Duration::from_secs(10);

/// Prefix of the comment attached to every packet-trace rule.
pub const DEFAULT_COMMENT_PREFIX: &str = "IG-Trace";

/// Maximum comment length accepted by the `comment` match of the packet filter.
pub const MAX_RULE_COMMENT_LEN: usize = 256;

/// Packet-filter table holding the trace rules.
pub const TRACE_TABLE: &str = "raw";

/// Chain matching packets leaving a container network namespace.
pub const CONTAINER_CHAIN: &str = "OUTPUT";

/// Chain matching packets entering the host namespace from a veth peer.
pub const HOST_CHAIN: &str = "PREROUTING";

/// Target that asks the kernel to trace matched packets.
pub const TRACE_TARGET: &str = "TRACE";

/// Name of the packet-filter binary looked up in `PATH`.
pub const IPTABLES_BIN: &str = "iptables";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "gadgetctl";
