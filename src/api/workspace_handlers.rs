//! Workspace file access and per-repo git operations (push/abandon/diff),
//! colocated with the shared workspace mount per component J.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use crate::access::AccessCheck;
use crate::api::error::ApiError;
use crate::api::middleware::authorize;
use crate::api::state::AppState;
use crate::content_staging::{self, DiffSummary, DirEntry, GitIdentity};
use crate::errors::CoreError;
use crate::forge;
use crate::workspace::SessionLayout;

/// `GET .../:name/workspace` and `GET .../:name/workspace/*path`: list a
/// directory, or read a file if `path` names one.
pub async fn list_or_read_workspace(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((tenant, name, path)): Path<(String, String, String)>,
) -> Result<Bytes, ApiError> {
    authorize(&state, &headers, None, false, &tenant, AccessCheck::LIST_SESSIONS).await?;
    let layout = SessionLayout::for_session(&state.workspace_root(), &name);

    let resolved = crate::paths::resolve_contained(&layout.workspace_dir, &path)?;
    if resolved.is_dir() {
        let entries = content_staging::list_dir(&layout.workspace_dir, &path).await.map_err(internal)?;
        let body = serde_json::to_vec(&entries).map_err(|e| internal(e.into()))?;
        return Ok(Bytes::from(body));
    }

    let bytes = content_staging::read_file(&layout.workspace_dir, &path).await.map_err(internal)?;
    Ok(Bytes::from(bytes))
}

/// `GET .../:name/workspace` with no further path: always a directory listing.
pub async fn list_workspace_root(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((tenant, name)): Path<(String, String)>,
) -> Result<Json<Vec<DirEntry>>, ApiError> {
    authorize(&state, &headers, None, false, &tenant, AccessCheck::LIST_SESSIONS).await?;
    let layout = SessionLayout::for_session(&state.workspace_root(), &name);
    let entries = content_staging::list_dir(&layout.workspace_dir, ".").await.map_err(internal)?;
    Ok(Json(entries))
}

/// `PUT .../:name/workspace/*path`
pub async fn put_workspace_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((tenant, name, path)): Path<(String, String, String)>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers, None, false, &tenant, AccessCheck::CREATE_SESSION).await?;
    let layout = SessionLayout::for_session(&state.workspace_root(), &name);
    content_staging::write_file(&layout.workspace_dir, &path, &body).await.map_err(internal)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Body for `POST .../:name/github/push`.
#[derive(Debug, Deserialize)]
pub struct PushRequest {
    repo: String,
    message: String,
    #[serde(default = "default_branch")]
    branch: String,
}

fn default_branch() -> String {
    "main".to_owned()
}

#[derive(Debug, Serialize)]
pub struct PushResponse {
    output: String,
}

/// `POST .../:name/github/push`
pub async fn push_repo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((tenant, name)): Path<(String, String)>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>, ApiError> {
    let client = authorize(&state, &headers, None, false, &tenant, AccessCheck::CREATE_SESSION).await?;
    let token = crate::identity::extract_caller_token(&headers, None, false)?;
    let layout = SessionLayout::for_session(&state.workspace_root(), &name);

    let session_uuid = session_uuid(&client, &tenant, &name).await?;
    let output_url = repo_output_url(&client, &tenant, &name, &request.repo).await?;
    let identity = resolve_identity(&output_url, &token).await;

    let output = content_staging::push(
        &layout.workspace_dir,
        session_uuid,
        &request.repo,
        &output_url,
        token_raw(&token),
        &request.message,
        &request.branch,
        &identity,
    )
    .await?;

    Ok(Json(PushResponse { output }))
}

/// `POST .../:name/github/abandon`
pub async fn abandon_repo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((tenant, name)): Path<(String, String)>,
    Json(request): Json<AbandonRequest>,
) -> Result<StatusCode, ApiError> {
    let client = authorize(&state, &headers, None, false, &tenant, AccessCheck::CREATE_SESSION).await?;
    let layout = SessionLayout::for_session(&state.workspace_root(), &name);
    let session_uuid = session_uuid(&client, &tenant, &name).await?;
    content_staging::abandon(&layout.workspace_dir, session_uuid, &request.repo).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AbandonRequest {
    repo: String,
}

#[derive(Debug, Deserialize)]
pub struct DiffQuery {
    repo: String,
}

/// `GET .../:name/github/diff`
pub async fn diff_repo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((tenant, name)): Path<(String, String)>,
    Query(query): Query<DiffQuery>,
) -> Result<Json<DiffSummary>, ApiError> {
    authorize(&state, &headers, None, false, &tenant, AccessCheck::LIST_SESSIONS).await?;
    let layout = SessionLayout::for_session(&state.workspace_root(), &name);
    let summary = content_staging::diff(&layout.workspace_dir, &query.repo).await.map_err(internal)?;
    Ok(Json(summary))
}

fn internal(e: anyhow::Error) -> ApiError {
    ApiError::Internal(e)
}

fn token_raw(token: &crate::kube_client::CallerToken) -> &str {
    // The caller token's raw value is only ever used here, to authenticate a
    // push on the caller's own behalf; it is never logged (see
    // `crate::kube_client::CallerToken`'s `Debug` impl).
    token.as_str()
}

async fn resolve_identity(output_url: &str, token: &crate::kube_client::CallerToken) -> GitIdentity {
    forge::resolve_identity(output_url, token.as_str()).await
}

/// Look up the session record's own uid, used only to tag git-operation
/// errors with a stable session identifier. Reads through the caller's own
/// per-request client, never the backend identity.
async fn session_uuid(client: &kube::Client, tenant: &str, name: &str) -> Result<uuid::Uuid, ApiError> {
    let api: kube::Api<crate::crd::AgenticSession> = kube::Api::namespaced(client.clone(), tenant);
    let session = api.get_opt(name).await?.ok_or(ApiError::NotFound)?;
    Ok(session
        .metadata
        .uid
        .and_then(|u| uuid::Uuid::parse_str(&u).ok())
        .unwrap_or_else(uuid::Uuid::nil))
}

/// Resolve the configured output URL for `repo` on the session record. Reads
/// through the caller's own per-request client, never the backend identity.
async fn repo_output_url(client: &kube::Client, tenant: &str, name: &str, repo: &str) -> Result<String, ApiError> {
    let api: kube::Api<crate::crd::AgenticSession> = kube::Api::namespaced(client.clone(), tenant);
    let session = api.get_opt(name).await?.ok_or(ApiError::NotFound)?;
    session
        .spec
        .repos
        .iter()
        .find(|r| crate::paths::canonicalize_repo_url(&r.input.url).is_ok_and(|r| r.workspace_folder() == repo))
        .and_then(|r| r.output.as_ref())
        .map(|o| o.url.clone())
        .ok_or_else(|| {
            ApiError::Core(CoreError::GitOperationFailed {
                session_id: uuid::Uuid::nil(),
                repo: repo.to_owned(),
                operation: "push".to_owned(),
                detail: "repo has no configured output location".to_owned(),
            })
        })
}
