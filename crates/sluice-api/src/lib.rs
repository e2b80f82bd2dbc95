//! HTTP/WebSocket API server for Sluice.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod ws;

pub use error::ApiError;
pub use routes::build_app;
pub use state::AppState;
