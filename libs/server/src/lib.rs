//! HTTP and WebSocket surface of the sandbox daemon.

pub mod error;
pub mod log_stream;
pub mod routes;
pub mod state;
pub mod types;

pub use routes::router;
pub use state::AppState;
