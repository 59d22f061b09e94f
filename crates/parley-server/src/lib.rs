pub mod bridge;
pub mod handlers;
pub mod server;
pub mod wire;

pub use server::{build_router, start, start_with_telemetry, AppState, ServerConfig, ServerHandle};
