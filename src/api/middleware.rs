//! Correlation-id middleware and the per-request authorization helper.
//!
//! Tenant access checks are not wired as global `axum` middleware because the
//! tenant is itself a path segment whose shape varies per route; instead
//! every handler that touches a tenant calls [`authorize`] as its first step,
//! which extracts the caller's token, mints a per-request client from it, and
//! runs the self-subject access review before anything else happens.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use kube::Client;
use uuid::Uuid;

use crate::access::{self, AccessCheck};
use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::identity;
use crate::observability::CorrelationId;

/// Header carrying (or receiving) a request's correlation id.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Attach a correlation id to every request: reuse the caller's if present
/// and valid, otherwise mint one. Recorded on the tracing span and echoed
/// back on the response.
pub async fn correlation_id_middleware(mut request: Request, next: Next) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .map_or_else(CorrelationId::new, CorrelationId::from);

    request.extensions_mut().insert(correlation_id);

    let span = tracing::info_span!(
        "http_request",
        correlation_id = %correlation_id,
        method = %request.method(),
        uri = %request.uri(),
    );

    let response = {
        let _enter = span.enter();
        next.run(request).await
    };

    let (mut parts, body) = response.into_parts();
    if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
        parts.headers.insert(CORRELATION_ID_HEADER, value);
    }
    Response::from_parts(parts, body)
}

/// Extract the caller's token, mint a per-request client acting as that
/// caller, and require that `check` passes for `tenant`. Returns the
/// per-request client so the handler can use the caller's own identity (not
/// the backend's) for whatever it does next.
///
/// # Errors
///
/// Returns [`ApiError::Auth`] if no token was presented, the token was
/// rejected, or the access review denied the check.
pub async fn authorize(
    state: &AppState,
    headers: &axum::http::HeaderMap,
    query_token: Option<&str>,
    allow_query_param: bool,
    tenant: &str,
    check: AccessCheck,
) -> Result<Client, ApiError> {
    let token = identity::extract_caller_token(headers, query_token, allow_query_param)?;
    let client = state.substrate.per_request_client(&token)?;
    access::require(&client, tenant, check).await?;
    Ok(client)
}
