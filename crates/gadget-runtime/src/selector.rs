//! Container discovery.
//!
//! Finding containers is the job of the surrounding orchestration layer; a
//! gadget only asks which containers currently match its filter.

use gadget_common::error::Result;
use gadget_common::types::{ContainerFilter, ContainerInfo};

/// Resolves a container filter to the containers currently matching it.
pub trait ContainerSelector: Send + Sync {
    /// Returns every known container matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the container inventory cannot be read.
    fn resolve(&self, filter: &ContainerFilter) -> Result<Vec<ContainerInfo>>;
}

/// Selector over a fixed list of containers.
///
/// Used by the CLI, where containers are given on the command line, and by
/// tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSelector {
    containers: Vec<ContainerInfo>,
}

impl StaticSelector {
    /// Creates a selector over `containers`.
    #[must_use]
    pub const fn new(containers: Vec<ContainerInfo>) -> Self {
        Self { containers }
    }

    /// Adds a container to the inventory.
    pub fn push(&mut self, container: ContainerInfo) {
        self.containers.push(container);
    }
}

impl ContainerSelector for StaticSelector {
    fn resolve(&self, filter: &ContainerFilter) -> Result<Vec<ContainerInfo>> {
        Ok(self
            .containers
            .iter()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect())
    }
}
