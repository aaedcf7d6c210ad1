//! Trigger-output sinks.
//!
//! The scheduler hands each fired cue's action and payload to a
//! [`TriggerSink`]. Sinks interpret the action; the scheduler does not.

use std::io::Write;
use std::sync::Mutex;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("unsupported action '{0}'")]
    UnsupportedAction(String),

    #[error("bad payload for {action}: {reason}")]
    Payload { action: String, reason: String },

    #[error("output write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub trait TriggerSink: Send + Sync {
    fn apply(&self, action: &str, payload: &Map<String, Value>) -> Result<(), SinkError>;
}

/// Logs every trigger at info.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TriggerSink for TracingSink {
    fn apply(&self, action: &str, payload: &Map<String, Value>) -> Result<(), SinkError> {
        let description = payload.get("description").and_then(Value::as_str).unwrap_or("");
        let fields = serde_json::Value::Object(payload.clone());
        info!(action, description, payload = %fields, "trigger");
        Ok(())
    }
}

/// Integer payload field with a default; fails on a present but invalid value.
fn param(action: &str, payload: &Map<String, Value>, key: &str, default: u8) -> Result<u8, SinkError> {
    match payload.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_u64()
            .and_then(|n| u8::try_from(n).ok())
            .ok_or_else(|| SinkError::Payload {
                action: action.to_string(),
                reason: format!("{} = {} is not a byte", key, v),
            }),
    }
}

/// One line of the microcontroller text protocol for a cue, e.g.
/// `noteon 1 60 127`.
pub fn line_for(action: &str, payload: &Map<String, Value>) -> Result<String, SinkError> {
    match action {
        "note_on" => Ok(format!(
            "noteon {} {} {}",
            param(action, payload, "channel", 1)?,
            param(action, payload, "note", 60)?,
            param(action, payload, "velocity", 64)?
        )),
        "note_off" => Ok(format!(
            "noteoff {} {} 0",
            param(action, payload, "channel", 1)?,
            param(action, payload, "note", 60)?
        )),
        "control_change" => Ok(format!(
            "cc {} {} {}",
            param(action, payload, "channel", 1)?,
            param(action, payload, "control", 0)?,
            param(action, payload, "value", 0)?
        )),
        other => Err(SinkError::UnsupportedAction(other.to_string())),
    }
}

/// Writes the line protocol to any writer, typically a serial device opened
/// as a file.
pub struct LineProtocolSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> LineProtocolSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> Result<W, SinkError> {
        self.writer
            .into_inner()
            .map_err(|_| SinkError::Other("writer lock poisoned".to_string()))
    }
}

impl<W: Write + Send> TriggerSink for LineProtocolSink<W> {
    fn apply(&self, action: &str, payload: &Map<String, Value>) -> Result<(), SinkError> {
        let line = line_for(action, payload)?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| SinkError::Other("writer lock poisoned".to_string()))?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// A trigger as recorded by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedTrigger {
    pub action: String,
    pub payload: Map<String, Value>,
}

/// Records triggers in memory. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemorySink {
    applied: Mutex<Vec<AppliedTrigger>>,
    fail_action: Option<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every trigger with this action fails (and is not recorded).
    pub fn failing_on(action: impl Into<String>) -> Self {
        Self {
            applied: Mutex::new(Vec::new()),
            fail_action: Some(action.into()),
        }
    }

    pub fn applied(&self) -> Vec<AppliedTrigger> {
        self.applied.lock().map(|a| a.clone()).unwrap_or_default()
    }

    /// Recorded `description` fields, falling back to the action name.
    pub fn descriptions(&self) -> Vec<String> {
        self.applied()
            .into_iter()
            .map(|t| {
                t.payload
                    .get("description")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or(t.action)
            })
            .collect()
    }
}

impl TriggerSink for MemorySink {
    fn apply(&self, action: &str, payload: &Map<String, Value>) -> Result<(), SinkError> {
        if self.fail_action.as_deref() == Some(action) {
            return Err(SinkError::Other(format!("configured to fail on {}", action)));
        }
        self.applied
            .lock()
            .map_err(|_| SinkError::Other("record lock poisoned".to_string()))?
            .push(AppliedTrigger {
                action: action.to_string(),
                payload: payload.clone(),
            });
        Ok(())
    }
}
