pub mod engine;
pub mod errors;
pub mod ids;
pub mod protocol;

pub use engine::{
    EngineEvent, EventStream, NoToolServers, PermissionMode, QueryEngine, QueryOptions, ToolServerSource, ToolServers,
};
pub use errors::{EngineError, OrchestrationError, ProtocolError, SessionCloseError};
pub use protocol::{decode, encode, Correlation, InboundMessage, OutboundMessage, QueryRequest};
