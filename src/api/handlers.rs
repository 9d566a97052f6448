//! Session CRUD and lifecycle handlers: create/list/get/update/patch/delete,
//! start/stop, and clone.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use kube::api::{Api, Patch, PatchParams, PostParams};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::access::AccessCheck;
use crate::api::error::ApiError;
use crate::api::middleware::authorize;
use crate::api::state::AppState;
use crate::crd::{
    self, AgenticSession, AgenticSessionSpec, LlmSettings, RepoEntry, ResourceOverrides,
    SessionPhase,
};
use crate::errors::ValidationError;

/// Body accepted by `POST .../agentic-sessions`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    prompt: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    interactive: bool,
    #[serde(default)]
    timeout_seconds: Option<u64>,
    llm_settings: LlmSettings,
    #[serde(default)]
    repos: Vec<RepoEntry>,
    #[serde(default)]
    main_repo_index: usize,
    #[serde(default)]
    environment: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    resource_overrides: Option<ResourceOverrides>,
}

/// Body accepted by `POST .../:name/clone`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneSessionRequest {
    target_project: String,
    new_session_name: String,
}

fn session_name() -> String {
    format!("sess-{}", Uuid::new_v4())
}

fn validate_main_repo_index(repos: &[RepoEntry], main_repo_index: usize) -> Result<(), ValidationError> {
    if !repos.is_empty() && main_repo_index >= repos.len() {
        return Err(ValidationError::InvalidSpec {
            reason: format!(
                "mainRepoIndex {main_repo_index} does not index into repos (len {})",
                repos.len()
            ),
        });
    }
    Ok(())
}

fn caller_owner(headers: &HeaderMap) -> String {
    crate::identity::extract_forwarded_identity(headers)
        .preferred_username
        .or_else(|| crate::identity::extract_forwarded_identity(headers).user)
        .unwrap_or_else(|| "unknown".to_owned())
}

/// `GET .../agentic-sessions`
pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(tenant): Path<String>,
) -> Result<Json<Vec<AgenticSession>>, ApiError> {
    let client = authorize(&state, &headers, None, false, &tenant, AccessCheck::LIST_SESSIONS).await?;
    let api: Api<AgenticSession> = Api::namespaced(client, &tenant);
    let list = api.list(&kube::api::ListParams::default()).await?;
    Ok(Json(list.items))
}

/// `POST .../agentic-sessions`
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(tenant): Path<String>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<AgenticSession>), ApiError> {
    let client = authorize(&state, &headers, None, false, &tenant, AccessCheck::CREATE_SESSION).await?;

    if request.prompt.trim().is_empty() {
        return Err(ValidationError::InvalidSpec {
            reason: "prompt must not be empty".to_owned(),
        }
        .into());
    }
    for repo in &request.repos {
        crate::paths::canonicalize_repo_url(&repo.input.url)?;
    }
    validate_main_repo_index(&request.repos, request.main_repo_index)?;

    let name = session_name();
    let session = AgenticSession::new(
        &name,
        AgenticSessionSpec {
            prompt: request.prompt,
            display_name: request.display_name,
            interactive: request.interactive,
            timeout_seconds: request.timeout_seconds,
            llm_settings: request.llm_settings,
            repos: request.repos,
            main_repo_index: request.main_repo_index,
            environment: request.environment,
            resource_overrides: request.resource_overrides,
            owner: caller_owner(&headers),
        },
    );

    let api: Api<AgenticSession> = Api::namespaced(client, &tenant);
    let created = match api.create(&PostParams::default(), &session).await {
        Ok(s) => s,
        Err(kube::Error::Api(e)) if e.code == 409 => {
            return Err(crate::errors::CoreError::NameConflict { tenant, name }.into());
        }
        Err(e) => return Err(e.into()),
    };

    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET .../:name`
pub async fn get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((tenant, name)): Path<(String, String)>,
) -> Result<Json<AgenticSession>, ApiError> {
    let client = authorize(&state, &headers, None, false, &tenant, AccessCheck::LIST_SESSIONS).await?;
    let api: Api<AgenticSession> = Api::namespaced(client, &tenant);
    let session = api.get_opt(&name).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(session))
}

/// `PUT .../:name`: full spec replace. The record's status and annotations
/// are left untouched; only `spec` is overwritten.
pub async fn update_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((tenant, name)): Path<(String, String)>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<AgenticSession>, ApiError> {
    let client = authorize(&state, &headers, None, false, &tenant, AccessCheck::CREATE_SESSION).await?;
    let api: Api<AgenticSession> = Api::namespaced(client, &tenant);
    let existing = api.get_opt(&name).await?.ok_or(ApiError::NotFound)?;

    for repo in &request.repos {
        crate::paths::canonicalize_repo_url(&repo.input.url)?;
    }
    validate_main_repo_index(&request.repos, request.main_repo_index)?;

    let spec = AgenticSessionSpec {
        prompt: request.prompt,
        display_name: request.display_name,
        interactive: request.interactive,
        timeout_seconds: request.timeout_seconds,
        llm_settings: request.llm_settings,
        repos: request.repos,
        main_repo_index: request.main_repo_index,
        environment: request.environment,
        resource_overrides: request.resource_overrides,
        owner: existing.spec.owner,
    };

    let patch = serde_json::json!({ "spec": spec });
    let updated = api
        .patch(&name, &PatchParams::default(), &Patch::Merge(patch))
        .await?;
    Ok(Json(updated))
}

/// `PATCH .../:name`: arbitrary JSON merge patch applied to `spec`.
pub async fn patch_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((tenant, name)): Path<(String, String)>,
    Json(patch_body): Json<Value>,
) -> Result<Json<AgenticSession>, ApiError> {
    let client = authorize(&state, &headers, None, false, &tenant, AccessCheck::CREATE_SESSION).await?;
    let api: Api<AgenticSession> = Api::namespaced(client, &tenant);
    if api.get_opt(&name).await?.is_none() {
        return Err(ApiError::NotFound);
    }

    let patch = serde_json::json!({ "spec": patch_body });
    let updated = api
        .patch(&name, &PatchParams::default(), &Patch::Merge(patch))
        .await?;
    Ok(Json(updated))
}

/// `DELETE .../:name`
pub async fn delete_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((tenant, name)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let client = authorize(&state, &headers, None, false, &tenant, AccessCheck::DELETE_SESSION).await?;
    let api: Api<AgenticSession> = Api::namespaced(client, &tenant);
    match api.delete(&name, &kube::api::DeleteParams::default()).await {
        Ok(_) => Ok(StatusCode::NO_CONTENT),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err(e.into()),
    }
}

/// `POST .../:name/start`.
///
/// There is no separate "not yet started" state in this system: creation
/// already enters `Pending`, which the reconciler picks up immediately. So
/// `start` is: a no-op returning the current record from `Pending` onward
/// through `Running`, an illegal-state 409 while already `Creating`/`Running`
/// would be redundant is instead treated the same as a no-op (idempotent
/// restart intent), and for a terminal session it is exactly a restart
/// request.
pub async fn start_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((tenant, name)): Path<(String, String)>,
) -> Result<Json<AgenticSession>, ApiError> {
    let client = authorize(&state, &headers, None, false, &tenant, AccessCheck::CREATE_SESSION).await?;
    let api: Api<AgenticSession> = Api::namespaced(client, &tenant);
    let session = api.get_opt(&name).await?.ok_or(ApiError::NotFound)?;
    let phase = session.status.as_ref().map_or(SessionPhase::Pending, |s| s.phase);

    if phase.is_terminal() {
        request_annotation(&api, &name, crd::RESTART_REQUESTED_ANNOTATION).await?;
    }

    let refreshed = api.get(&name).await?;
    Ok(Json(refreshed))
}

/// `POST .../:name/stop`. A stop on an already-terminal session is a no-op
/// returning 200, per the documented acceptance criterion.
pub async fn stop_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((tenant, name)): Path<(String, String)>,
) -> Result<Json<AgenticSession>, ApiError> {
    let client = authorize(&state, &headers, None, false, &tenant, AccessCheck::CREATE_SESSION).await?;
    let api: Api<AgenticSession> = Api::namespaced(client, &tenant);
    let session = api.get_opt(&name).await?.ok_or(ApiError::NotFound)?;
    let phase = session.status.as_ref().map_or(SessionPhase::Pending, |s| s.phase);

    if !phase.is_terminal() {
        request_annotation(&api, &name, crd::STOP_REQUESTED_ANNOTATION).await?;
    }

    let refreshed = api.get(&name).await?;
    Ok(Json(refreshed))
}

async fn request_annotation(api: &Api<AgenticSession>, name: &str, key: &str) -> Result<(), kube::Error> {
    let patch = serde_json::json!({ "metadata": { "annotations": { key: "true" } } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(patch)).await?;
    Ok(())
}

/// `POST .../:name/clone`: copy a session's spec into a new record, in the
/// same or a different tenant, under a caller-chosen name, with a fresh
/// `Pending` status.
pub async fn clone_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((tenant, name)): Path<(String, String)>,
    Json(request): Json<CloneSessionRequest>,
) -> Result<(StatusCode, Json<AgenticSession>), ApiError> {
    let source_client =
        authorize(&state, &headers, None, false, &tenant, AccessCheck::LIST_SESSIONS).await?;
    let source_api: Api<AgenticSession> = Api::namespaced(source_client, &tenant);
    let source = source_api.get_opt(&name).await?.ok_or(ApiError::NotFound)?;

    let target_client = authorize(
        &state,
        &headers,
        None,
        false,
        &request.target_project,
        AccessCheck::CREATE_SESSION,
    )
    .await?;

    if request.new_session_name.trim().is_empty() {
        return Err(ValidationError::InvalidSpec {
            reason: "newSessionName must not be empty".to_owned(),
        }
        .into());
    }

    let mut spec = source.spec.clone();
    spec.owner = caller_owner(&headers);
    let cloned = AgenticSession::new(&request.new_session_name, spec);

    let target_api: Api<AgenticSession> = Api::namespaced(target_client, &request.target_project);
    let created = match target_api.create(&PostParams::default(), &cloned).await {
        Ok(s) => s,
        Err(kube::Error::Api(e)) if e.code == 409 => {
            return Err(crate::errors::CoreError::NameConflict {
                tenant: request.target_project,
                name: request.new_session_name,
            }
            .into());
        }
        Err(e) => return Err(e.into()),
    };

    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET /health`
pub async fn health() -> StatusCode {
    StatusCode::OK
}
