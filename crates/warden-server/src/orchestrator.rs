//! Query orchestration: session resolution, engine invocation and
//! translation of engine events into correlated outbound messages.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use warden_core::ids::RunId;
use warden_core::{
    Correlation, EngineEvent, OrchestrationError, OutboundMessage, PermissionMode, QueryEngine,
    QueryOptions, QueryRequest, SessionCloseError, ToolServerSource,
};
use warden_telemetry::MetricsRecorder;

use crate::registry::{ChannelSession, SessionRegistry};

/// Why a session left the registry. Used as a metric label.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    Explicit,
    Idle,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Idle => "idle",
            Self::Shutdown => "shutdown",
        }
    }
}

pub struct QueryOrchestrator {
    registry: Arc<SessionRegistry>,
    engine: Arc<dyn QueryEngine>,
    tool_servers: Arc<dyn ToolServerSource>,
    metrics: Arc<MetricsRecorder>,
    permission_mode: PermissionMode,
}

impl QueryOrchestrator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        engine: Arc<dyn QueryEngine>,
        tool_servers: Arc<dyn ToolServerSource>,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self {
            registry,
            engine,
            tool_servers,
            metrics,
            permission_mode: PermissionMode::BypassPermissions,
        }
    }

    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Run one query and stream its responses.
    ///
    /// Always ends with exactly one `done` or `error`. Queries on the same
    /// channel run one at a time; later ones wait for the earlier turn.
    pub fn process_query(self: &Arc<Self>, request: QueryRequest) -> BoxStream<'static, OutboundMessage> {
        let this = Arc::clone(self);
        Box::pin(async_stream::stream! {
            let corr = Correlation::from(&request);
            let run_id = RunId::new();
            let started = Instant::now();
            this.metrics.counter_inc("queries_total", &[], 1);
            debug!(%run_id, query_id = %corr.query_id, channel_id = %corr.channel_id, "query started");

            if request.workspace.trim().is_empty() {
                let err = OrchestrationError::Session("workspace must not be empty".into());
                yield this.fail(&corr, &err, started);
                return;
            }

            let (session, _turn) = this.acquire_session(&request).await;
            session.touch();

            let cwd = PathBuf::from(session.workspace());
            let options = QueryOptions {
                tool_servers: this.tool_servers.load(&cwd),
                cwd,
                permission_mode: this.permission_mode,
                resume: session.resumption_id(),
            };

            let mut events = match this.engine.submit(&request.prompt, &options).await {
                Ok(events) => events,
                Err(e) => {
                    yield this.fail(&corr, &OrchestrationError::from(e), started);
                    return;
                }
            };

            let mut observed: Option<String> = None;
            while let Some(item) = events.next().await {
                session.touch();
                match item {
                    Ok(EngineEvent::Text { content }) => yield corr.text(content),
                    Ok(EngineEvent::ToolUse { tool, input }) => yield corr.tool_use(tool, input),
                    Ok(EngineEvent::Completed { session_id }) => {
                        // An empty token means none was issued; keep the current one.
                        if let Some(id) = session_id.filter(|id| !id.is_empty()) {
                            session.set_resumption_id(id.clone());
                            observed = Some(id);
                        }
                    }
                    Err(e) => {
                        yield this.fail(&corr, &OrchestrationError::from(e), started);
                        return;
                    }
                }
            }

            let session_id = observed.or_else(|| session.resumption_id()).unwrap_or_default();
            let elapsed = started.elapsed();
            this.metrics.histogram_observe("query_duration_ms", &[], millis(elapsed));
            info!(
                %run_id,
                query_id = %corr.query_id,
                channel_id = %corr.channel_id,
                duration_ms = elapsed.as_millis() as u64,
                "query completed"
            );
            yield corr.done(session_id);
        })
    }

    /// Resolve the channel's session and wait for its turn. If the session
    /// was closed while waiting, start over with a fresh one.
    async fn acquire_session(
        &self,
        request: &QueryRequest,
    ) -> (Arc<ChannelSession>, tokio::sync::OwnedMutexGuard<()>) {
        loop {
            let resolved = self.registry.resolve(
                &request.channel_id,
                &request.workspace,
                request.session_id.as_deref(),
            );
            if resolved.created {
                self.metrics.counter_inc("sessions_created_total", &[], 1);
                info!(channel_id = %request.channel_id, workspace = %request.workspace, "session created");
            }
            let turn = resolved.session.begin_turn().await;
            if self.registry.is_current(&resolved.session) {
                return (resolved.session, turn);
            }
            debug!(channel_id = %request.channel_id, "session closed while queued, re-resolving");
        }
    }

    fn fail(&self, corr: &Correlation, err: &OrchestrationError, started: Instant) -> OutboundMessage {
        let kind = match err {
            OrchestrationError::Engine(e) => e.error_kind(),
            OrchestrationError::Session(_) => "session",
        };
        self.metrics.counter_inc("query_errors_total", &[("kind", kind)], 1);
        self.metrics
            .histogram_observe("query_duration_ms", &[], millis(started.elapsed()));
        warn!(
            query_id = %corr.query_id,
            channel_id = %corr.channel_id,
            error = %err,
            kind,
            "query failed"
        );
        corr.error(err.to_string())
    }

    /// Remove the channel's session and release its engine resources.
    /// A query already running on it finishes undisturbed.
    pub async fn close_session(&self, channel_id: &str) -> bool {
        match self.registry.remove(channel_id) {
            Some(session) => {
                info!(channel_id, "session closed");
                self.release_session(&session, CloseReason::Explicit).await;
                true
            }
            None => {
                debug!(channel_id, "close requested for unknown channel");
                false
            }
        }
    }

    /// Release hook for a session that has left the registry. Failures are
    /// logged and swallowed.
    pub async fn release_session(&self, session: &ChannelSession, reason: CloseReason) {
        self.metrics
            .counter_inc("sessions_closed_total", &[("reason", reason.as_str())], 1);
        if let Err(source) = self.engine.release(session.channel_id()).await {
            let err = SessionCloseError {
                channel_id: session.channel_id().to_string(),
                source,
            };
            warn!(error = %err, reason = reason.as_str(), "session release failed");
        }
    }

    /// Evict sessions idle longer than `timeout` at `now`.
    pub async fn evict_idle(&self, now: Instant, timeout: Duration) -> usize {
        let evicted = self.registry.sweep_idle(now, timeout);
        for session in &evicted {
            info!(
                channel_id = session.channel_id(),
                idle_secs = session.idle_for(now).as_secs(),
                "evicting idle session"
            );
            self.release_session(session, CloseReason::Idle).await;
        }
        evicted.len()
    }

    /// Drain the registry, releasing every session.
    pub async fn shutdown(&self) -> usize {
        let drained = self.registry.drain();
        for session in &drained {
            self.release_session(session, CloseReason::Shutdown).await;
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "released sessions at shutdown");
        }
        drained.len()
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
