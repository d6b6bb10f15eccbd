//! Line parser for `claude --output-format stream-json`.

use serde_json::Value;
use tracing::{debug, trace};

use warden_core::{EngineError, EngineEvent};

/// Stateful parser fed one stdout line at a time.
#[derive(Debug, Default)]
pub struct StreamJsonParser {
    init_session_id: Option<String>,
    finished: bool,
}

impl StreamJsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session id announced by the `system/init` line, if seen.
    pub fn init_session_id(&self) -> Option<&str> {
        self.init_session_id.as_deref()
    }

    /// True once a `result` line has been consumed.
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Parse one line. Blank, non-JSON and unrecognised lines yield no events.
    pub fn feed(&mut self, line: &str) -> Result<Vec<EngineEvent>, EngineError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Vec::new());
        }
        let json: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "skipping non-JSON line");
                return Ok(Vec::new());
            }
        };

        match json.get("type").and_then(Value::as_str) {
            Some("system") => {
                if json.get("subtype").and_then(Value::as_str) == Some("init") {
                    if let Some(id) = session_id_of(&json) {
                        debug!(session_id = id, "engine session initialised");
                        self.init_session_id = Some(id.to_string());
                    }
                }
                Ok(Vec::new())
            }
            Some("assistant") => Ok(assistant_events(&json)),
            Some("result") => self.result(&json).map(|e| vec![e]),
            other => {
                trace!(kind = ?other, "ignoring stream-json line");
                Ok(Vec::new())
            }
        }
    }

    fn result(&mut self, json: &Value) -> Result<EngineEvent, EngineError> {
        self.finished = true;
        let is_error = json.get("is_error").and_then(Value::as_bool).unwrap_or(false);
        if is_error {
            let message = json
                .get("error")
                .and_then(Value::as_str)
                .or_else(|| json.get("result").and_then(Value::as_str))
                .or_else(|| json.get("subtype").and_then(Value::as_str))
                .unwrap_or("Unknown error");
            return Err(EngineError::Failed(message.to_string()));
        }
        let session_id = session_id_of(json).or(self.init_session_id.as_deref());
        Ok(EngineEvent::completed(session_id))
    }
}

/// Non-empty `session_id` field. An empty id means the engine issued none.
fn session_id_of(json: &Value) -> Option<&str> {
    json.get("session_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

fn assistant_events(json: &Value) -> Vec<EngineEvent> {
    let Some(content) = json
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
    else {
        return Vec::new();
    };

    let mut events = Vec::new();
    for block in content {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        events.push(EngineEvent::text(text));
                    }
                }
            }
            Some("tool_use") => {
                let name = block.get("name").and_then(Value::as_str).unwrap_or("unknown");
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                debug!(tool = name, "tool use detected");
                events.push(EngineEvent::tool_use(name, input));
            }
            _ => {}
        }
    }
    events
}
