//! Router assembly: wires every handler onto its path, with the middleware
//! stack layered in the order recovery -> request logging -> CORS ->
//! (per-handler) identity extraction -> tenant access check. Recovery and
//! logging are `tower_http`'s; CORS and the correlation id are explicit
//! layers here, and identity/access run inside [`crate::api::middleware::authorize`]
//! itself since the tenant is a path segment, not a fixed prefix.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api::handlers;
use crate::api::middleware::correlation_id_middleware;
use crate::api::state::AppState;
use crate::api::workspace_handlers;
use crate::api::ws;

/// Recovery handler for an unwinding panic inside a handler: the panic
/// payload is logged server-side, never surfaced to the caller, who only
/// sees a generic 500.
fn recover_from_panic(payload: Box<dyn std::any::Any + Send>) -> Response {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned());
    tracing::error!(panic = %detail, "request handler panicked");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "internal error" })),
    )
        .into_response()
}

/// Build the full router. `state` is supplied by the caller via
/// `Router::with_state` so this function stays a pure `Router<AppState>`
/// builder, matching the same `create_router` shape used elsewhere.
#[must_use]
pub fn create_router() -> Router<AppState> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/api/projects/{tenant}/agentic-sessions",
            get(handlers::list_sessions).post(handlers::create_session),
        )
        .route(
            "/api/projects/{tenant}/agentic-sessions/{name}",
            get(handlers::get_session)
                .put(handlers::update_session)
                .patch(handlers::patch_session)
                .delete(handlers::delete_session),
        )
        .route(
            "/api/projects/{tenant}/agentic-sessions/{name}/start",
            post(handlers::start_session),
        )
        .route(
            "/api/projects/{tenant}/agentic-sessions/{name}/stop",
            post(handlers::stop_session),
        )
        .route(
            "/api/projects/{tenant}/agentic-sessions/{name}/clone",
            post(handlers::clone_session),
        )
        .route(
            "/api/projects/{tenant}/agentic-sessions/{name}/workspace",
            get(workspace_handlers::list_workspace_root),
        )
        .route(
            "/api/projects/{tenant}/agentic-sessions/{name}/workspace/{*path}",
            get(workspace_handlers::list_or_read_workspace).put(workspace_handlers::put_workspace_file),
        )
        .route(
            "/api/projects/{tenant}/agentic-sessions/{name}/github/push",
            post(workspace_handlers::push_repo),
        )
        .route(
            "/api/projects/{tenant}/agentic-sessions/{name}/github/abandon",
            post(workspace_handlers::abandon_repo),
        )
        .route(
            "/api/projects/{tenant}/agentic-sessions/{name}/github/diff",
            get(workspace_handlers::diff_repo),
        )
        .route(
            "/api/projects/{tenant}/sessions/{id}/ws",
            get(ws::ws_handler),
        )
        .route(
            "/api/projects/{tenant}/sessions/{id}/messages",
            get(ws::get_messages).post(ws::post_message),
        )
        .layer(axum::middleware::from_fn(correlation_id_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(recover_from_panic))
}
