//! Query engine adapters and the tool-server loader.
//!
//! - [`ClaudeCliEngine`] drives the `claude` CLI in stream-json mode.
//! - [`McpConfigLoader`] reads a workspace's `.mcp.json`.
//! - [`mock::ScriptedEngine`] answers with pre-programmed event streams.

pub mod claude_cli;
pub mod mock;
pub mod stream_json;
pub mod tool_servers;

pub use claude_cli::ClaudeCliEngine;
pub use mock::{ScriptedEngine, ScriptedResponse};
pub use stream_json::StreamJsonParser;
pub use tool_servers::{expand_env_vars, expand_str, expand_value, McpConfigLoader};
