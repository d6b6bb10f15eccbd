//! Contracts for the two external collaborators: the query engine and the
//! tool-server configuration loader.

use std::path::{Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::EngineError;

/// Tool-server name → launch spec (command, args, env, …), as found in a
/// workspace's configuration file.
pub type ToolServers = Map<String, Value>;

/// Tool permission policy handed to the engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    Plan,
    /// The caller is the trust boundary; the engine asks nothing.
    #[default]
    BypassPermissions,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
        }
    }
}

/// Options for one engine invocation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryOptions {
    pub tool_servers: ToolServers,
    pub cwd: PathBuf,
    pub permission_mode: PermissionMode,
    /// Resumption token of the conversation to continue, if any.
    pub resume: Option<String>,
}

/// Events produced by an engine, in emission order.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    Text { content: String },
    ToolUse { tool: String, input: Map<String, Value> },
    /// Final status. Carries the resumption token when the engine reports one.
    Completed { session_id: Option<String> },
}

impl EngineEvent {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn tool_use(tool: impl Into<String>, input: Value) -> Self {
        let input = match input {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::ToolUse {
            tool: tool.into(),
            input,
        }
    }

    pub fn completed(session_id: Option<&str>) -> Self {
        Self::Completed {
            session_id: session_id.map(str::to_string),
        }
    }
}

/// Ordered, finite stream of engine events. The first `Err` ends the query.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EngineEvent, EngineError>> + Send>>;

/// A long-running capability that answers prompts with an event stream.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn submit(&self, prompt: &str, options: &QueryOptions) -> Result<EventStream, EngineError>;

    /// Release engine-side resources held for a channel. Called when a
    /// session is closed, evicted or drained at shutdown.
    async fn release(&self, _channel_id: &str) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Loads the tool-server configuration of a workspace. Must never fail:
/// problems are logged and yield an empty mapping.
pub trait ToolServerSource: Send + Sync {
    fn load(&self, workspace: &Path) -> ToolServers;
}

/// A source with no tool servers at all.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoToolServers;

impl ToolServerSource for NoToolServers {
    fn load(&self, _workspace: &Path) -> ToolServers {
        ToolServers::new()
    }
}
