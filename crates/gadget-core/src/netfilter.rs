//! Packet-filter rule mutation.
//!
//! Rules are addressed by `(table, chain, spec)` exactly as on the
//! `iptables` command line. The engine acts on whatever network namespace
//! the calling thread is in, so callers wrap calls in a
//! [`NamespaceEntry`](crate::namespace::NamespaceEntry) to reach a container.

use std::path::{Path, PathBuf};
use std::process::Command;

use gadget_common::constants::IPTABLES_BIN;
use gadget_common::error::{GadgetError, Result};

/// Mutation primitives of a kernel packet-filter engine.
pub trait PacketFilter: Send + Sync {
    /// Returns whether an identical rule is present in `table`/`chain`.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine cannot be queried.
    fn exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool>;

    /// Appends a rule at the end of `chain`.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the rule.
    fn append(&self, table: &str, chain: &str, spec: &[String]) -> Result<()>;

    /// Deletes the first rule matching `spec`.
    ///
    /// # Errors
    ///
    /// Returns an error if the rule is absent or the engine fails.
    fn delete(&self, table: &str, chain: &str, spec: &[String]) -> Result<()>;

    /// Appends a rule unless an identical one is already present.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup or the append fails.
    fn append_unique(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        if self.exists(table, chain, spec)? {
            return Ok(());
        }
        self.append(table, chain, spec)
    }

    /// Deletes a rule if it is present; absent rules are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup or the deletion fails.
    fn delete_if_exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        if !self.exists(table, chain, spec)? {
            return Ok(());
        }
        self.delete(table, chain, spec)
    }
}

/// Rule command understood by the `iptables` binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleCommand {
    Check,
    Append,
    Delete,
}

impl RuleCommand {
    const fn flag(self) -> &'static str {
        match self {
            Self::Check => "-C",
            Self::Append => "-A",
            Self::Delete => "-D",
        }
    }
}

/// Builds the argument vector for one rule command.
fn rule_args(command: RuleCommand, table: &str, chain: &str, spec: &[String]) -> Vec<String> {
    let mut args = Vec::with_capacity(spec.len() + 5);
    args.push("--wait".to_owned());
    args.push("-t".to_owned());
    args.push(table.to_owned());
    args.push(command.flag().to_owned());
    args.push(chain.to_owned());
    args.extend(spec.iter().cloned());
    args
}

/// Packet filter driven through the `iptables` executable.
///
/// Each call forks the binary from the current thread, so the child
/// inherits the thread's network namespace.
#[derive(Debug, Clone)]
pub struct Iptables {
    binary: PathBuf,
}

impl Iptables {
    /// Locates `iptables` in `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::NotFound`] if the binary is not installed.
    pub fn new() -> Result<Self> {
        let binary = which::which(IPTABLES_BIN).map_err(|e| GadgetError::NotFound {
            kind: "packet filter binary",
            id: format!("{IPTABLES_BIN} ({e})"),
        })?;
        tracing::debug!(binary = %binary.display(), "packet filter initialized");
        Ok(Self { binary })
    }

    /// Uses an explicit binary path.
    #[must_use]
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Returns the binary this engine invokes.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn run(&self, command: RuleCommand, table: &str, chain: &str, spec: &[String]) -> Result<std::process::Output> {
        let args = rule_args(command, table, chain, spec);
        Command::new(&self.binary)
            .args(&args)
            .output()
            .map_err(|e| GadgetError::Io {
                path: self.binary.clone(),
                source: e,
            })
    }
}

fn describe(table: &str, chain: &str, spec: &[String]) -> String {
    format!("table={table}, chain={chain}, spec={:?}", spec.join(" "))
}

fn failure(table: &str, chain: &str, spec: &[String], output: &std::process::Output) -> GadgetError {
    GadgetError::PacketFilter {
        rule: describe(table, chain, spec),
        message: format!(
            "{}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    }
}

impl PacketFilter for Iptables {
    fn exists(&self, table: &str, chain: &str, spec: &[String]) -> Result<bool> {
        let output = self.run(RuleCommand::Check, table, chain, spec)?;
        match output.status.code() {
            Some(0) => Ok(true),
            // Exit status 1 is "no matching rule"; anything else is a real failure.
            Some(1) => Ok(false),
            _ => Err(failure(table, chain, spec, &output)),
        }
    }

    fn append(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        let output = self.run(RuleCommand::Append, table, chain, spec)?;
        if !output.status.success() {
            return Err(failure(table, chain, spec, &output));
        }
        tracing::debug!(table, chain, spec = %spec.join(" "), "rule appended");
        Ok(())
    }

    fn delete(&self, table: &str, chain: &str, spec: &[String]) -> Result<()> {
        let output = self.run(RuleCommand::Delete, table, chain, spec)?;
        if !output.status.success() {
            return Err(failure(table, chain, spec, &output));
        }
        tracing::debug!(table, chain, spec = %spec.join(" "), "rule deleted");
        Ok(())
    }
}
