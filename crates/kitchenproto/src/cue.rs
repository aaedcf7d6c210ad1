//! Cue records as they appear in schedule files and `start` commands.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single time-indexed action.
///
/// On the wire `trigger_time_seconds` is `"time"` and `action` is `"type"`;
/// every other field is carried through untouched as the payload:
///
/// ```json
/// {"time": 12.5, "type": "note_on", "channel": 1, "note": 60, "velocity": 127}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cue {
    #[serde(rename = "time")]
    pub trigger_time_seconds: f64,

    #[serde(rename = "type")]
    pub action: String,

    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Cue {
    pub fn new(trigger_time_seconds: f64, action: impl Into<String>) -> Self {
        Self {
            trigger_time_seconds,
            action: action.into(),
            payload: Map::new(),
        }
    }

    /// Builder-style payload field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    pub fn description(&self) -> Option<&str> {
        self.payload.get("description").and_then(Value::as_str)
    }
}
