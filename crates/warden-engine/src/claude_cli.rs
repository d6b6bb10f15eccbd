//! Query engine backed by the `claude` CLI, one subprocess per query.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use warden_core::{EngineError, EngineEvent, EventStream, QueryEngine, QueryOptions};

use crate::stream_json::StreamJsonParser;

/// Bytes of stderr kept for the `Exited` error.
const STDERR_LIMIT: usize = 4096;

#[derive(Clone, Debug)]
pub struct ClaudeCliEngine {
    binary: String,
    extra_args: Vec<String>,
}

impl ClaudeCliEngine {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Command-line arguments for one invocation, prompt last.
    pub fn build_args(&self, prompt: &str, options: &QueryOptions) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--print".into(),
            "--output-format".into(),
            "stream-json".into(),
            "--verbose".into(),
            "--permission-mode".into(),
            options.permission_mode.as_str().into(),
        ];
        if !options.tool_servers.is_empty() {
            let config = json!({ "mcpServers": Value::Object(options.tool_servers.clone()) });
            args.push("--mcp-config".into());
            args.push(config.to_string());
        }
        if let Some(token) = &options.resume {
            args.push("--resume".into());
            args.push(token.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(prompt.to_string());
        args
    }
}

impl Default for ClaudeCliEngine {
    fn default() -> Self {
        Self::new("claude")
    }
}

#[async_trait]
impl QueryEngine for ClaudeCliEngine {
    fn name(&self) -> &str {
        "claude-cli"
    }

    async fn submit(&self, prompt: &str, options: &QueryOptions) -> Result<EventStream, EngineError> {
        let mut cmd = Command::new(&self.binary);
        let _ = cmd
            .args(self.build_args(prompt, options))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !options.cwd.as_os_str().is_empty() {
            let _ = cmd.current_dir(&options.cwd);
        }

        debug!(
            binary = %self.binary,
            cwd = %options.cwd.display(),
            resume = options.resume.is_some(),
            tool_servers = options.tool_servers.len(),
            "spawning engine process"
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| EngineError::Unavailable(format!("failed to spawn {}: {e}", self.binary)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Unavailable("engine stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| EngineError::Unavailable("engine stderr not captured".into()))?;
        let stderr_task = tokio::spawn(collect_stderr(stderr));

        let stream = async_stream::stream! {
            let mut lines = BufReader::new(stdout).lines();
            let mut parser = StreamJsonParser::new();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match parser.feed(&line) {
                        Ok(events) => {
                            for event in events {
                                yield Ok(event);
                            }
                            if parser.finished() {
                                break;
                            }
                        }
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    },
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(EngineError::Stream(format!("failed to read engine output: {e}")));
                        return;
                    }
                }
            }

            if parser.finished() {
                return;
            }

            let status = child.wait().await;
            let stderr = stderr_task.await.unwrap_or_default();
            match status {
                Ok(status) if status.success() => {
                    yield Ok(EngineEvent::completed(parser.init_session_id()));
                }
                Ok(status) => {
                    yield Err(EngineError::Exited { code: status.code(), stderr });
                }
                Err(e) => {
                    yield Err(EngineError::Stream(format!("failed to wait for engine: {e}")));
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Log every stderr line and keep the tail for error reporting.
async fn collect_stderr<R>(stderr: R) -> String
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    let mut collected = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        warn!(stderr = %line, "engine stderr");
        if !collected.is_empty() {
            collected.push('\n');
        }
        collected.push_str(&line);
        if collected.len() > STDERR_LIMIT {
            let mut cut = collected.len() - STDERR_LIMIT;
            while !collected.is_char_boundary(cut) {
                cut += 1;
            }
            collected.replace_range(..cut, "");
        }
    }
    collected
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use warden_core::PermissionMode;

    fn options() -> QueryOptions {
        QueryOptions::default()
    }

    #[test]
    fn args_for_fresh_query() {
        let engine = ClaudeCliEngine::default();
        let args = engine.build_args("hello", &options());
        assert_eq!(
            args,
            vec![
                "--print",
                "--output-format",
                "stream-json",
                "--verbose",
                "--permission-mode",
                "bypassPermissions",
                "hello",
            ]
        );
    }

    #[test]
    fn args_with_resume_tools_and_extras() {
        let engine = ClaudeCliEngine::new("/opt/claude")
            .with_extra_args(vec!["--model".into(), "opus".into()]);
        let mut tools = Map::new();
        tools.insert("fs".into(), json!({"command": "mcp-fs"}));
        let opts = QueryOptions {
            tool_servers: tools,
            permission_mode: PermissionMode::Plan,
            resume: Some("sess-1".into()),
            ..QueryOptions::default()
        };
        let args = engine.build_args("do it", &opts);

        let mcp_idx = args.iter().position(|a| a == "--mcp-config").unwrap();
        let config: Value = serde_json::from_str(&args[mcp_idx + 1]).unwrap();
        assert_eq!(config["mcpServers"]["fs"]["command"], "mcp-fs");

        let resume_idx = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume_idx + 1], "sess-1");
        assert!(args.contains(&"plan".to_string()));
        assert_eq!(&args[args.len() - 3..], &["--model", "opus", "do it"]);
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let engine = ClaudeCliEngine::new("/nonexistent/warden-test-claude");
        let err = engine.submit("hi", &options()).await.err().unwrap();
        assert_eq!(err.error_kind(), "unavailable");
    }

    #[cfg(unix)]
    mod process {
        use std::os::unix::fs::PermissionsExt;
        use std::path::{Path, PathBuf};

        use tokio_stream::StreamExt;

        use super::*;

        fn fake_cli(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-claude");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        async fn run(body: &str) -> Vec<Result<EngineEvent, EngineError>> {
            let dir = tempfile::tempdir().unwrap();
            let bin = fake_cli(dir.path(), body);
            let engine = ClaudeCliEngine::new(bin.to_string_lossy());
            let opts = QueryOptions {
                cwd: dir.path().to_path_buf(),
                ..QueryOptions::default()
            };
            let stream = engine.submit("hi", &opts).await.unwrap();
            stream.collect().await
        }

        #[tokio::test]
        async fn full_exchange() {
            let events = run(r#"
echo '{"type":"system","subtype":"init","session_id":"s-1"}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"hello"}]}}'
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"ls"}}]}}'
echo '{"type":"result","is_error":false,"session_id":"s-2"}'
"#)
            .await;
            assert_eq!(
                events,
                vec![
                    Ok(EngineEvent::text("hello")),
                    Ok(EngineEvent::tool_use("Bash", json!({"command": "ls"}))),
                    Ok(EngineEvent::completed(Some("s-2"))),
                ]
            );
        }

        #[tokio::test]
        async fn nonzero_exit_without_result() {
            let events = run("echo 'bad flag' >&2\nexit 3").await;
            assert_eq!(events.len(), 1);
            match &events[0] {
                Err(EngineError::Exited { code, stderr }) => {
                    assert_eq!(*code, Some(3));
                    assert!(stderr.contains("bad flag"));
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        #[tokio::test]
        async fn clean_exit_without_result_completes_with_init_id() {
            let events = run(r#"echo '{"type":"system","subtype":"init","session_id":"s-9"}'"#).await;
            assert_eq!(events, vec![Ok(EngineEvent::completed(Some("s-9")))]);
        }

        #[tokio::test]
        async fn error_result_ends_stream() {
            let events = run(r#"
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"partial"}]}}'
echo '{"type":"result","is_error":true,"error":"overloaded"}'
"#)
            .await;
            assert_eq!(
                events,
                vec![
                    Ok(EngineEvent::text("partial")),
                    Err(EngineError::Failed("overloaded".into())),
                ]
            );
        }
    }
}
