//! Packet-trace rules across host and container network namespaces.
//!
//! For every selected container, the manager installs rules in the host
//! namespace matching ingress from the container's veth peer, then rules
//! inside the container namespace matching its egress. Installation is
//! all-or-nothing per container and independent across containers.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use gadget_common::config::RuleConfig;
use gadget_common::constants::{
    CONTAINER_CHAIN, HOST_CHAIN, MAX_RULE_COMMENT_LEN, TRACE_TABLE, TRACE_TARGET,
};
use gadget_common::error::GadgetError;
use gadget_common::types::{ContainerFilter, ContainerInfo, TraceName};
use gadget_core::namespace::NamespaceEntry;
use gadget_core::netfilter::PacketFilter;

use crate::selector::ContainerSelector;

/// One packet-filter rule placed in the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstalledRule {
    /// Process whose network namespace holds the rule; `0` for the host.
    pub container_pid: u32,
    /// Packet-filter table.
    pub table: String,
    /// Chain within the table.
    pub chain: String,
    /// Match and target arguments.
    pub spec: Vec<String>,
}

impl InstalledRule {
    /// Whether the rule lives in the host network namespace.
    #[must_use]
    pub const fn is_host(&self) -> bool {
        self.container_pid == 0
    }
}

impl fmt::Display for InstalledRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "containerPid={}, table={}, chain={}, spec={:?}",
            self.container_pid,
            self.table,
            self.chain,
            self.spec.join(" ")
        )
    }
}

/// A rule that could not be applied.
#[derive(Debug)]
pub struct RuleFailure {
    /// The rule concerned.
    pub rule: InstalledRule,
    /// Why it failed.
    pub error: GadgetError,
}

impl fmt::Display for RuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.rule, self.error)
    }
}

/// A container whose rule set could not be installed.
#[derive(Debug)]
pub struct ContainerFailure {
    /// Container identifier.
    pub container_id: String,
    /// The rule whose installation failed.
    pub failed: RuleFailure,
    /// Rules of this container that were removed again.
    pub rolled_back: Vec<InstalledRule>,
    /// Rollback deletions that failed; these rules may remain in the kernel.
    pub rollback_failures: Vec<RuleFailure>,
}

impl fmt::Display for ContainerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "container {}: {}", self.container_id, self.failed)?;
        if !self.rollback_failures.is_empty() {
            write!(f, " (rollback left {})", join(&self.rollback_failures))?;
        }
        Ok(())
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors returned by [`NetworkRuleManager`].
#[derive(Debug, Error)]
pub enum RuleError {
    /// The selected containers could not be listed.
    #[error("resolving containers: {0}")]
    Resolve(#[source] GadgetError),

    /// Some containers could not be set up. Containers not listed in
    /// `failures` had their whole rule set installed.
    #[error("installing trace rules failed for {} container(s): {}", .failures.len(), join(.failures))]
    PartialInstall {
        /// Rules that are in place despite the failure.
        installed: Vec<InstalledRule>,
        /// Per-container failures, each already rolled back.
        failures: Vec<ContainerFailure>,
    },

    /// Some rules could not be removed and may remain in the kernel.
    #[error("removing trace rules failed: {}", join(.failures))]
    Remove {
        /// Rules left behind.
        failures: Vec<RuleFailure>,
    },
}

/// Provenance comment attached to every rule of `trace`.
///
/// Truncated to the packet filter's comment length limit.
#[must_use]
pub fn trace_comment(prefix: &str, trace: &TraceName) -> String {
    let mut comment = format!("{prefix}={trace}");
    if comment.len() > MAX_RULE_COMMENT_LEN {
        let mut end = MAX_RULE_COMMENT_LEN;
        while !comment.is_char_boundary(end) {
            end -= 1;
        }
        comment.truncate(end);
    }
    comment
}

/// Installs and removes packet-trace rules for selected containers.
pub struct NetworkRuleManager {
    filter: Arc<dyn PacketFilter>,
    netns: Arc<dyn NamespaceEntry>,
    config: RuleConfig,
}

impl NetworkRuleManager {
    /// Creates a manager driving `filter` inside namespaces entered by
    /// `netns`.
    pub fn new(filter: Arc<dyn PacketFilter>, netns: Arc<dyn NamespaceEntry>, config: RuleConfig) -> Self {
        Self {
            filter,
            netns,
            config,
        }
    }

    /// Provenance comment for the rules of `trace`.
    #[must_use]
    pub fn trace_comment(&self, trace: &TraceName) -> String {
        trace_comment(&self.config.comment_prefix, trace)
    }

    /// Builds the rule set of one container, in installation order: host
    /// rules first, then container rules.
    ///
    /// Returns `None` if the container has no known veth peer.
    #[must_use]
    pub fn rules_for_container(&self, container: &ContainerInfo, comment: &str) -> Option<Vec<InstalledRule>> {
        let veth = container.veth_peer.as_deref().filter(|v| !v.is_empty())?;

        let tail = ["-m", "comment", "--comment", comment, "-j", TRACE_TARGET];
        let build = |pid: u32, chain: &str, head: &[&str], matches: &[&str]| InstalledRule {
            container_pid: pid,
            table: TRACE_TABLE.to_owned(),
            chain: chain.to_owned(),
            spec: head
                .iter()
                .chain(matches)
                .chain(&tail)
                .map(|s| (*s).to_owned())
                .collect(),
        };

        let protocols = &self.config.protocols;
        let host = protocols
            .iter()
            .map(|p| build(0, HOST_CHAIN, &["-i", veth], p.match_args()));
        let inside = protocols
            .iter()
            .map(|p| build(container.pid, CONTAINER_CHAIN, &[], p.match_args()));
        Some(host.chain(inside).collect())
    }

    /// Installs the rule sets of every container `selector` returns for
    /// `filter`.
    ///
    /// Containers without a veth peer are skipped. If a rule of a container
    /// fails, the rules already installed for that container are removed
    /// again in reverse order and the remaining containers are still
    /// processed.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::Resolve`] if the containers cannot be listed and
    /// [`RuleError::PartialInstall`] if any container failed; the latter
    /// carries the rules that are nevertheless installed.
    pub fn install(
        &self,
        selector: &dyn ContainerSelector,
        filter: &ContainerFilter,
        trace: &TraceName,
    ) -> Result<Vec<InstalledRule>, RuleError> {
        let containers = selector.resolve(filter).map_err(RuleError::Resolve)?;
        let comment = self.trace_comment(trace);

        let mut installed = Vec::new();
        let mut failures = Vec::new();

        for container in &containers {
            let Some(rules) = self.rules_for_container(container, &comment) else {
                tracing::warn!(
                    trace = %trace,
                    container = %container.id,
                    "skipping container without a veth peer"
                );
                continue;
            };

            match self.install_container(container, rules) {
                Ok(rules) => installed.extend(rules),
                Err(failure) => {
                    tracing::error!(trace = %trace, %failure, "installing container trace rules failed");
                    failures.push(failure);
                }
            }
        }

        if failures.is_empty() {
            tracing::info!(trace = %trace, rules = installed.len(), "trace rules installed");
            Ok(installed)
        } else {
            Err(RuleError::PartialInstall { installed, failures })
        }
    }

    fn install_container(
        &self,
        container: &ContainerInfo,
        rules: Vec<InstalledRule>,
    ) -> Result<Vec<InstalledRule>, ContainerFailure> {
        let mut done: Vec<InstalledRule> = Vec::with_capacity(rules.len());

        for rule in rules {
            if let Err(error) = self.append(&rule) {
                let mut rollback_failures = Vec::new();
                for previous in done.iter().rev() {
                    match self.delete(previous) {
                        Ok(()) => tracing::debug!(rule = %previous, "removed trace rule (rollback)"),
                        Err(e) => rollback_failures.push(RuleFailure {
                            rule: previous.clone(),
                            error: e,
                        }),
                    }
                }
                return Err(ContainerFailure {
                    container_id: container.id.clone(),
                    failed: RuleFailure { rule, error },
                    rolled_back: done,
                    rollback_failures,
                });
            }
            tracing::debug!(rule = %rule, "installed trace rule");
            done.push(rule);
        }

        Ok(done)
    }

    /// Removes `rules`. Rules that are already gone are not an error, and
    /// calling this twice with the same rules is harmless.
    ///
    /// A container rule whose namespace has disappeared together with its
    /// container is logged and considered removed.
    ///
    /// # Errors
    ///
    /// Returns [`RuleError::Remove`] listing every rule that could not be
    /// deleted; the other rules are removed regardless.
    pub fn remove(&self, rules: &[InstalledRule]) -> Result<(), RuleError> {
        let mut failures = Vec::new();

        for rule in rules {
            match self.delete(rule) {
                Ok(()) => tracing::debug!(rule = %rule, "removed trace rule"),
                Err(e) if !rule.is_host() && e.is_not_found() => {
                    tracing::warn!(rule = %rule, error = %e, "container namespace is gone, rule went with it");
                }
                Err(error) => failures.push(RuleFailure {
                    rule: rule.clone(),
                    error,
                }),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RuleError::Remove { failures })
        }
    }

    fn append(&self, rule: &InstalledRule) -> gadget_common::error::Result<()> {
        self.netns.run(rule.container_pid, &|| {
            self.filter.append_unique(&rule.table, &rule.chain, &rule.spec)
        })
    }

    fn delete(&self, rule: &InstalledRule) -> gadget_common::error::Result<()> {
        self.netns.run(rule.container_pid, &|| {
            self.filter.delete_if_exists(&rule.table, &rule.chain, &rule.spec)
        })
    }
}
