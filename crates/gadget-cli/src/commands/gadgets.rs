//! `gadgetctl gadgets`: List the available gadgets.

use gadget_runtime::registry::GadgetRegistry;

use crate::output::{BOLD, RESET};

/// Executes the `gadgets` command.
///
/// # Errors
///
/// Never fails; the signature matches the other commands.
#[allow(clippy::unnecessary_wraps)]
pub fn execute() -> anyhow::Result<()> {
    let registry = GadgetRegistry::with_defaults();
    for (name, description) in registry.descriptions() {
        eprintln!("  {BOLD}{name:<10}{RESET} {description}");
    }
    Ok(())
}
