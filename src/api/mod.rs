//! HTTP API surface: the external interface tenants and their sessions'
//! workers talk to.

pub mod error;
pub mod handlers;
pub mod http_server;
pub mod middleware;
pub mod state;
pub mod workspace_handlers;
pub mod ws;

pub use http_server::create_router;
pub use state::AppState;
