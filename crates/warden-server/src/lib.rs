//! Session-addressable streaming proxy: the session registry, query
//! orchestration, the WebSocket connection loop and the idle reaper.

pub mod connection;
pub mod orchestrator;
pub mod reaper;
pub mod registry;
pub mod server;
pub mod shutdown;

pub use orchestrator::{CloseReason, QueryOrchestrator};
pub use reaper::IdleReaper;
pub use registry::{ChannelSession, SessionInfo, SessionRegistry};
pub use server::{build_router, AppState, HealthResponse, ServerConfig, ServerError, ServerHandle, WardenServer};
pub use shutdown::ShutdownCoordinator;
