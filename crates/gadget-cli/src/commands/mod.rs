//! CLI command definitions and dispatch.

pub mod gadgets;
pub mod trace;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use gadget_common::config::GadgetConfig;

/// gadgetctl: Trace containers with kernel-assisted gadgets.
#[derive(Parser, Debug)]
#[command(name = "gadgetctl", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// JSON configuration file (correlator, garbage collection, rules).
    #[arg(long, global = true, env = "GADGET_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a trace until Ctrl+C.
    Trace(trace::TraceArgs),
    /// List the available gadgets.
    Gadgets,
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the command fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Trace(args) => trace::execute(args, config),
        Command::Gadgets => gadgets::execute(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<GadgetConfig> {
    let Some(path) = path else {
        return Ok(GadgetConfig::default());
    };
    let config = GadgetConfig::load(path).map_err(|e| anyhow::anyhow!("{e}"))?;
    tracing::debug!(path = %path.display(), ?config, "configuration loaded");
    Ok(config)
}
