//! Control plane server: the watch relay behind an HTTP API

pub mod handlers;
pub mod state;

pub use handlers::create_router;
pub use state::AppState;
