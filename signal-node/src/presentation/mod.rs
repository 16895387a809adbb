//! Presentation layer - HTTP status views and the client WebSocket.

pub mod http_api;
pub mod ws_session;

pub use http_api::{create_router, ApiState};
