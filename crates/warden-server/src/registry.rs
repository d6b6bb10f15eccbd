//! Channel → session mapping with idle eviction.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as TurnLock, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

/// One logical conversation bound to a channel.
pub struct ChannelSession {
    channel_id: String,
    workspace: String,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    turn: Arc<TurnLock<()>>,
}

struct SessionState {
    last_activity: Instant,
    resumption_id: Option<String>,
}

impl ChannelSession {
    fn new(channel_id: &str, workspace: &str, resumption_id: Option<&str>) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            workspace: workspace.to_string(),
            created_at: Utc::now(),
            state: Mutex::new(SessionState {
                last_activity: Instant::now(),
                resumption_id: resumption_id.filter(|id| !id.is_empty()).map(str::to_string),
            }),
            turn: Arc::new(TurnLock::new(())),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Workspace fixed at creation; later requests cannot change it.
    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        self.state.lock().last_activity
    }

    pub fn touch(&self) {
        self.state.lock().last_activity = Instant::now();
    }

    /// Time since last activity. Zero if touched after `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    pub fn resumption_id(&self) -> Option<String> {
        self.state.lock().resumption_id.clone()
    }

    pub fn set_resumption_id(&self, id: impl Into<String>) {
        self.state.lock().resumption_id = Some(id.into());
    }

    /// Wait for exclusive use of the conversation. Held for a whole query.
    pub async fn begin_turn(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.turn).lock_owned().await
    }

    pub fn info(&self, now: Instant) -> SessionInfo {
        let state = self.state.lock();
        SessionInfo {
            channel_id: self.channel_id.clone(),
            workspace: self.workspace.clone(),
            created_at: self.created_at,
            idle_secs: now.saturating_duration_since(state.last_activity).as_secs(),
            has_resumption_id: state.resumption_id.is_some(),
        }
    }
}

impl std::fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ChannelSession")
            .field("channel_id", &self.channel_id)
            .field("workspace", &self.workspace)
            .field("resumption_id", &state.resumption_id)
            .finish_non_exhaustive()
    }
}

/// Read-only view of a session.
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub channel_id: String,
    pub workspace: String,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub has_resumption_id: bool,
}

/// Result of [`SessionRegistry::resolve`].
pub struct Resolved {
    pub session: Arc<ChannelSession>,
    pub created: bool,
}

/// All live sessions, keyed by channel id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<ChannelSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing session for `channel_id` (touched), or a new one seeded with
    /// `resume_id`. `workspace` and `resume_id` are ignored on reuse.
    pub fn get_or_create(
        &self,
        channel_id: &str,
        workspace: &str,
        resume_id: Option<&str>,
    ) -> Arc<ChannelSession> {
        self.resolve(channel_id, workspace, resume_id).session
    }

    /// [`get_or_create`](Self::get_or_create), also reporting whether the
    /// session is new.
    pub fn resolve(&self, channel_id: &str, workspace: &str, resume_id: Option<&str>) -> Resolved {
        match self.sessions.entry(channel_id.to_string()) {
            Entry::Occupied(entry) => {
                let session = Arc::clone(entry.get());
                session.touch();
                Resolved {
                    session,
                    created: false,
                }
            }
            Entry::Vacant(entry) => {
                let session = Arc::new(ChannelSession::new(channel_id, workspace, resume_id));
                let _ = entry.insert(Arc::clone(&session));
                debug!(channel_id, workspace, resumed = resume_id.is_some(), "session created");
                Resolved {
                    session,
                    created: true,
                }
            }
        }
    }

    pub fn get(&self, channel_id: &str) -> Option<Arc<ChannelSession>> {
        self.sessions.get(channel_id).map(|e| Arc::clone(e.value()))
    }

    /// Whether `session` is still the registered session for its channel.
    pub fn is_current(&self, session: &Arc<ChannelSession>) -> bool {
        self.sessions
            .get(session.channel_id())
            .is_some_and(|e| Arc::ptr_eq(e.value(), session))
    }

    pub fn touch(&self, channel_id: &str) {
        if let Some(session) = self.sessions.get(channel_id) {
            session.touch();
        }
    }

    pub fn remove(&self, channel_id: &str) -> Option<Arc<ChannelSession>> {
        self.sessions.remove(channel_id).map(|(_, s)| s)
    }

    /// Remove and return every session idle for longer than `timeout` at
    /// `now`. The idle check is repeated under the shard lock, so a session
    /// touched after the candidate scan stays.
    pub fn sweep_idle(&self, now: Instant, timeout: Duration) -> Vec<Arc<ChannelSession>> {
        let candidates: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.value().idle_for(now) > timeout)
            .map(|e| e.key().clone())
            .collect();

        candidates
            .into_iter()
            .filter_map(|key| {
                self.sessions
                    .remove_if(&key, |_, s| s.idle_for(now) > timeout)
                    .map(|(_, s)| s)
            })
            .collect()
    }

    /// Remove every session.
    pub fn drain(&self) -> Vec<Arc<ChannelSession>> {
        let keys: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        keys.into_iter().filter_map(|k| self.remove(&k)).collect()
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let mut infos: Vec<SessionInfo> = self.sessions.iter().map(|e| e.value().info(now)).collect();
        infos.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        infos
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
