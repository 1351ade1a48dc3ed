//! Formatted output helpers for CLI commands.
//!
//! Human-oriented messages go to stderr so stdout carries only events.

use gadget_common::types::{Operation, Trace, TraceState};

pub const BOLD: &str = "\x1b[1m";
pub const DIM: &str = "\x1b[2m";
pub const GREEN: &str = "\x1b[32m";
pub const YELLOW: &str = "\x1b[33m";
pub const RED: &str = "\x1b[31m";
pub const RESET: &str = "\x1b[0m";

pub fn print_header() {
    eprintln!();
    eprintln!(
        "  {BOLD}{}{RESET} {DIM}v{}{RESET}",
        gadget_common::constants::BIN_NAME,
        env!("CARGO_PKG_VERSION")
    );
    eprintln!();
}

/// One-line summary of a trace after `operation`.
#[must_use]
pub fn status_line(trace: &Trace, operation: Operation) -> String {
    let color = match (&trace.status.operation_error, trace.status.state) {
        (Some(_), _) => RED,
        (None, TraceState::Started) => GREEN,
        (None, _) => DIM,
    };
    let mut line = format!(
        "{color}●{RESET} {BOLD}{}{RESET} [{}] {operation}: {}",
        trace.name, trace.spec.gadget, trace.status.state
    );
    if let Some(error) = &trace.status.operation_error {
        line.push_str(&format!(" {RED}error:{RESET} {error}"));
    }
    if let Some(warning) = &trace.status.operation_warning {
        line.push_str(&format!(" {YELLOW}warning:{RESET} {warning}"));
    }
    line
}

pub fn print_status(trace: &Trace, operation: Operation) {
    eprintln!("  {}", status_line(trace, operation));
}
