/// Inbound frame could not be turned into an `InboundMessage`.
/// Recovered at the connection boundary: logged, never answered.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown message type: {}", .tag.as_deref().unwrap_or("<missing>"))]
    UnknownType { tag: Option<String> },
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl ProtocolError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::UnknownType { .. } => "unknown_type",
            Self::Malformed(_) => "malformed",
        }
    }
}

/// Failures reported by a query engine adapter.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("engine stream error: {0}")]
    Stream(String),

    #[error("{0}")]
    Failed(String),

    #[error("engine exited with status {}: {stderr}", .code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    Exited { code: Option<i32>, stderr: String },
}

impl EngineError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Stream(_) => "stream",
            Self::Failed(_) => "failed",
            Self::Exited { .. } => "exited",
        }
    }
}

/// Anything that aborts a query before its `done` message.
/// Surfaced to the caller as a single `error` message.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("session error: {0}")]
    Session(String),
}

/// Releasing a session's engine-side resources failed. Logged and swallowed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("failed to release session for channel {channel_id}: {source}")]
pub struct SessionCloseError {
    pub channel_id: String,
    #[source]
    pub source: EngineError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_display() {
        let err = ProtocolError::UnknownType {
            tag: Some("bogus".into()),
        };
        assert_eq!(err.to_string(), "unknown message type: bogus");

        let missing = ProtocolError::UnknownType { tag: None };
        assert_eq!(missing.to_string(), "unknown message type: <missing>");
    }

    #[test]
    fn protocol_error_kinds() {
        assert_eq!(ProtocolError::Malformed("x".into()).error_kind(), "malformed");
        assert_eq!(
            ProtocolError::UnknownType { tag: None }.error_kind(),
            "unknown_type"
        );
    }

    #[test]
    fn exited_display_with_and_without_code() {
        let err = EngineError::Exited {
            code: Some(2),
            stderr: "boom".into(),
        };
        assert_eq!(err.to_string(), "engine exited with status 2: boom");

        let killed = EngineError::Exited {
            code: None,
            stderr: String::new(),
        };
        assert!(killed.to_string().contains("signal"));
    }

    #[test]
    fn engine_failure_is_transparent_through_orchestration() {
        let err: OrchestrationError = EngineError::Failed("rate limit reached".into()).into();
        assert_eq!(err.to_string(), "rate limit reached");
    }

    #[test]
    fn session_close_error_names_channel() {
        let err = SessionCloseError {
            channel_id: "C1".into(),
            source: EngineError::Failed("busy".into()),
        };
        assert_eq!(
            err.to_string(),
            "failed to release session for channel C1: busy"
        );
    }
}
