pub mod bridge;
pub mod client;
pub mod handlers;
pub mod rpc;
pub mod server;
pub mod windowing;

pub use client::{ClientId, WindowClientRegistry};
pub use handlers::HandlerState;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use windowing::HostWindowing;
