//! Linux namespace handling for gadgets.
//!
//! Gadgets never create namespaces; they only step into the network
//! namespace of an existing container to mutate its packet filter.

pub mod network;

use gadget_common::error::Result;

pub use network::NetnsEnter;

/// Runs work inside the network namespace of a process.
///
/// A `pid` of zero means the host namespace: the closure runs on the
/// caller's thread without any switch.
pub trait NamespaceEntry: Send + Sync {
    /// Executes `f` inside the network namespace of `pid`.
    ///
    /// # Errors
    ///
    /// Returns [`GadgetError::NotFound`](gadget_common::error::GadgetError::NotFound)
    /// if the process (and thus its namespace) no longer exists, a namespace
    /// error if the switch itself fails, or whatever `f` returns.
    fn run(&self, pid: u32, f: &(dyn Fn() -> Result<()> + Sync)) -> Result<()>;
}
