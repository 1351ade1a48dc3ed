//! Configuration model for the tracing control plane.
//!
//! Every tunable that used to be a process-wide default is a named field
//! here, so each tracer instance (and each test) can carry its own values.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{GadgetError, Result};

/// Root configuration handed to every tracer at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GadgetConfig {
    /// Request/response latency correlation.
    pub correlator: CorrelatorConfig,
    /// Kernel map garbage collection.
    pub gc: GcConfig,
    /// Packet-trace rule installation.
    pub rules: RuleConfig,
}

impl GadgetConfig {
    /// Loads a configuration from a JSON file.
    ///
    /// Missing fields fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON, or
    /// holds values rejected by [`GadgetConfig::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| GadgetError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.correlator.capacity == 0 {
            return Err(config_error("correlator.capacity must be at least 1"));
        }
        if self.gc.interval.is_zero() {
            return Err(config_error("gc.interval must be greater than zero"));
        }
        if self.gc.cutoff.is_zero() {
            return Err(config_error("gc.cutoff must be greater than zero"));
        }
        if self.rules.comment_prefix.is_empty() {
            return Err(config_error("rules.comment_prefix must not be empty"));
        }
        if self.rules.protocols.is_empty() {
            return Err(config_error("rules.protocols must list at least one protocol"));
        }
        Ok(())
    }
}

fn config_error(message: &str) -> GadgetError {
    GadgetError::Config {
        message: message.to_owned(),
    }
}

/// Sizing of the two-generation latency correlator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Entries per generation; at most twice this many requests are tracked.
    pub capacity: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            capacity: constants::DEFAULT_CORRELATOR_CAPACITY,
        }
    }
}

/// Timing of the kernel map garbage collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Delay between two sweeps, in milliseconds on the wire.
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    /// Minimum entry age before deletion, in milliseconds on the wire.
    #[serde(with = "duration_ms")]
    pub cutoff: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: constants::DEFAULT_GC_INTERVAL,
            cutoff: constants::DEFAULT_GC_CUTOFF,
        }
    }
}

/// Packets a trace rule matches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TraceProtocol {
    /// TCP connection attempts (`-p tcp --syn`).
    TcpSyn,
    /// Any ICMP packet (`-p icmp`).
    Icmp,
}

impl TraceProtocol {
    /// Returns the packet-filter match arguments for this protocol.
    #[must_use]
    pub fn match_args(self) -> &'static [&'static str] {
        match self {
            Self::TcpSyn => &["-p", "tcp", "--syn"],
            Self::Icmp => &["-p", "icmp"],
        }
    }
}

/// Shape of the packet-trace rules installed per container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Prefix of the provenance comment, followed by `=<namespace>/<name>`.
    pub comment_prefix: String,
    /// Protocols traced; each one yields a container rule and a host rule.
    pub protocols: Vec<TraceProtocol>,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            comment_prefix: constants::DEFAULT_COMMENT_PREFIX.to_owned(),
            protocols: vec![TraceProtocol::TcpSyn],
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_constants() {
        let cfg = GadgetConfig::default();
        assert_eq!(cfg.correlator.capacity, 64);
        assert_eq!(cfg.gc.interval, Duration::from_secs(5));
        assert_eq!(cfg.gc.cutoff, Duration::from_secs(10));
        assert_eq!(cfg.rules.comment_prefix, "IG-Trace");
        assert_eq!(cfg.rules.protocols, vec![TraceProtocol::TcpSyn]);
        cfg.validate().expect("defaults should be valid");
    }

    #[test]
    fn validate_rejects_zero_capacity() {
        let mut cfg = GadgetConfig::default();
        cfg.correlator.capacity = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("correlator.capacity"));
    }

    #[test]
    fn validate_rejects_zero_interval() {
        let mut cfg = GadgetConfig::default();
        cfg.gc.interval = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_protocols() {
        let mut cfg = GadgetConfig::default();
        cfg.rules.protocols.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn load_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"gc": {{"interval": 250, "cutoff": 1000}}, "rules": {{"protocols": ["tcp-syn", "icmp"]}}}}"#
        )
        .unwrap();

        let cfg = GadgetConfig::load(file.path()).expect("config should load");
        assert_eq!(cfg.gc.interval, Duration::from_millis(250));
        assert_eq!(cfg.gc.cutoff, Duration::from_secs(1));
        assert_eq!(cfg.correlator.capacity, 64);
        assert_eq!(cfg.rules.comment_prefix, "IG-Trace");
        assert_eq!(
            cfg.rules.protocols,
            vec![TraceProtocol::TcpSyn, TraceProtocol::Icmp]
        );
    }

    #[test]
    fn load_missing_file_reports_path() {
        let err = GadgetConfig::load(Path::new("/nonexistent/gadget.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/gadget.json"));
    }

    #[test]
    fn load_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"correlator": {{"capacity": 0}}}}"#).unwrap();
        assert!(GadgetConfig::load(file.path()).is_err());
    }

    #[test]
    fn protocol_match_args() {
        assert_eq!(TraceProtocol::TcpSyn.match_args(), ["-p", "tcp", "--syn"]);
        assert_eq!(TraceProtocol::Icmp.match_args(), ["-p", "icmp"]);
    }
}
