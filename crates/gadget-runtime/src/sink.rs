//! Outbound event delivery.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use gadget_common::types::TraceName;

/// Receives serialized events produced by a trace.
pub trait EventSink: Send + Sync {
    /// Delivers one event, already serialized as JSON.
    fn publish(&self, trace: &TraceName, event: &str);
}

/// Serializes `event` and hands it to `sink`.
///
/// Events that fail to serialize are dropped with a warning.
pub fn publish_json<T: Serialize>(sink: &dyn EventSink, trace: &TraceName, event: &T) {
    match serde_json::to_string(event) {
        Ok(json) => sink.publish(trace, &json),
        Err(e) => tracing::warn!(trace = %trace, error = %e, "dropping event that failed to serialize"),
    }
}

/// Sink that emits every event as a log record.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, trace: &TraceName, event: &str) {
        tracing::info!(trace = %trace, event, "trace event");
    }
}

/// Sink that writes one JSON document per line.
pub struct WriterSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    /// Creates a sink writing to `writer`.
    pub const fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> EventSink for WriterSink<W> {
    fn publish(&self, trace: &TraceName, event: &str) {
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(writer, "{event}").and_then(|()| writer.flush()) {
            tracing::warn!(trace = %trace, error = %e, "could not write event");
        }
    }
}
