//! Custom resource definitions: the `AgenticSession` kind and its
//! per-tenant `ProjectSettings` companion.
//!
//! These are the typed view the [`crate::kube_client`] facade's typed client
//! works with; the dynamic client sees the same data as schemaless trees and
//! must extract through the nested-accessor pattern described in
//! `crate::kube_client::dynamic_get`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// API group all custom resources in this operator are registered under.
pub const GROUP: &str = "agentic.sessions.io";
/// API version for the current schema generation.
pub const VERSION: &str = "v1alpha1";

/// One entry in a session's configured LLM parameters.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct LlmSettings {
    /// Model identifier, interpreted by the worker.
    pub model: String,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Maximum tokens the worker's model call may return.
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// A single repository location: a clone URL and optional branch.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct RepoLocation {
    /// The repository URL, in any form accepted by [`crate::paths::canonicalize_repo_url`].
    pub url: String,
    /// Branch to check out, or the default branch when omitted.
    #[serde(default)]
    pub branch: Option<String>,
}

/// Outcome of pushing or abandoning a repo's changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RepoStatus {
    /// Changes were pushed to the output location.
    Pushed,
    /// Changes were explicitly discarded.
    Abandoned,
}

/// One repository a session works with: where it comes from, where (if
/// anywhere) results go, and the terminal disposition once the session ends.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RepoEntry {
    /// Where the worker clones from.
    pub input: RepoLocation,
    /// Where the worker pushes to, if this repo's changes are meant to leave the workspace.
    #[serde(default)]
    pub output: Option<RepoLocation>,
    /// Set once the content-staging service has pushed or abandoned this repo.
    #[serde(default)]
    pub status: Option<RepoStatus>,
}

/// CPU/memory overrides for the worker container, layered over
/// [`crate::config::AppConfig`]'s defaults.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub struct ResourceOverrides {
    /// CPU request/limit override (Kubernetes quantity string, e.g. "2").
    #[serde(default)]
    pub cpu: Option<String>,
    /// Memory request/limit override (Kubernetes quantity string, e.g. "4Gi").
    #[serde(default)]
    pub memory: Option<String>,
}

/// The declarative specification of an agentic session.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "agentic.sessions.io",
    version = "v1alpha1",
    kind = "AgenticSession",
    plural = "agenticsessions",
    shortname = "ags",
    namespaced,
    status = "AgenticSessionStatus",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct AgenticSessionSpec {
    /// The prompt delivered to the worker.
    pub prompt: String,
    /// Human-facing display name, distinct from the record's `name`.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Whether the session accepts interactive follow-up input over the
    /// messaging hub, as opposed to running a single batch turn.
    #[serde(default)]
    pub interactive: bool,
    /// Wall-clock budget for the session, enforced by the Job Monitor.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Model parameters for the worker.
    pub llm_settings: LlmSettings,
    /// Repositories the worker clones and may push back to.
    #[serde(default)]
    pub repos: Vec<RepoEntry>,
    /// Index into `repos` naming the repo the worker treats as its primary
    /// working directory. Must index into `repos` when `repos` is non-empty.
    #[serde(default)]
    pub main_repo_index: usize,
    /// Environment variables injected into the worker container. Values are
    /// never logged.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Resource overrides for the worker container.
    #[serde(default)]
    pub resource_overrides: Option<ResourceOverrides>,
    /// The identity that created this session, as recorded at creation time.
    pub owner: String,
}

/// The phase a session's current attempt is in.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// Created but not yet acted on by the reconciler.
    #[default]
    Pending,
    /// The Job has been submitted; waiting for a worker Pod to appear.
    Creating,
    /// A worker Pod is running.
    Running,
    /// The Job completed successfully.
    Completed,
    /// The Job failed or the session's timeout elapsed.
    Failed,
    /// The session was stopped by explicit request.
    Stopped,
    /// A substrate-terminal failure occurred outside the normal Job lifecycle.
    Error,
}

impl SessionPhase {
    /// Terminal phases are absorbing within an attempt; only an explicit
    /// restart moves a session out of one.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stopped | Self::Error
        )
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Creating => "Creating",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Terminal summary reported by the worker itself, via the status
/// subresource, distinct from anything the reconciler or Job Monitor writes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct WorkerSummary {
    /// Whether the worker's own run ended in an error.
    pub is_error: bool,
    /// Number of conversational turns the worker took.
    pub num_turns: u32,
    /// The worker's internal session identifier (distinct from the record's own id).
    pub session_id: String,
    /// Total estimated cost in USD, as reported by the worker.
    pub total_cost_usd: f64,
    /// Opaque usage accounting blob, worker-defined shape.
    pub usage: serde_json::Value,
    /// Final textual result, if the worker produced one.
    #[serde(default)]
    pub result: Option<String>,
}

/// The status subresource: written by the reconciler, the Job Monitor, and
/// the worker, under optimistic-concurrency retry.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AgenticSessionStatus {
    /// Current lifecycle phase.
    pub phase: SessionPhase,
    /// User-safe message describing the current or terminal state.
    #[serde(default)]
    pub message: Option<String>,
    /// When the worker Pod was first observed running.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// When the session reached a terminal phase.
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
    /// Name of the current attempt's Job, set at most once per attempt.
    #[serde(default)]
    pub job_name: Option<String>,
    /// Per-session state directory under the shared workspace volume.
    #[serde(default)]
    pub state_dir: Option<String>,
    /// Worker-reported terminal summary, once available.
    #[serde(default)]
    pub summary: Option<WorkerSummary>,
}

impl AgenticSessionStatus {
    /// A fresh status for a newly (re)started attempt.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            phase: SessionPhase::Pending,
            ..Self::default()
        }
    }
}

/// Per-tenant defaults and integration points, not elaborated beyond plain
/// CRUD: the name of the secret holding integration credentials for e.g. a
/// forge API token used to resolve git push identity.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "agentic.sessions.io",
    version = "v1alpha1",
    kind = "ProjectSettings",
    plural = "projectsettings",
    namespaced,
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSettingsSpec {
    /// Name of the secret in this tenant holding forge integration credentials.
    #[serde(default)]
    pub integration_credentials_secret: Option<String>,
    /// Default worker image override for sessions in this tenant.
    #[serde(default)]
    pub default_worker_image: Option<String>,
}

/// Annotation the API sets to request a stop of a non-terminal session; the
/// reconciler clears it once the stop has been actioned.
pub const STOP_REQUESTED_ANNOTATION: &str = "agentic.sessions.io/stop-requested";
/// Annotation the API sets to request a fresh attempt of a terminal session;
/// the reconciler clears it once the restart has been actioned.
pub const RESTART_REQUESTED_ANNOTATION: &str = "agentic.sessions.io/restart-requested";

/// Helper: derive the deterministic per-session token secret name.
#[must_use]
pub fn credential_secret_name(session_name: &str) -> String {
    format!("{session_name}-session-token")
}

/// Helper: derive the deterministic per-session role binding name.
#[must_use]
pub fn role_binding_name(session_name: &str) -> String {
    format!("{session_name}-session-binding")
}

/// Helper: derive the deterministic per-session subject (service account) name.
#[must_use]
pub fn subject_name(session_name: &str) -> String {
    format!("{session_name}-session-sa")
}

/// Helper: derive the Job name for a session's current attempt.
#[must_use]
pub fn job_name(session_name: &str) -> String {
    format!("{session_name}-job")
}

/// A random request id used only for correlating log lines, never persisted.
#[must_use]
pub fn new_request_id() -> Uuid {
    Uuid::new_v4()
}

/// Build the owner reference every per-session child resource (credentials,
/// Job, workspace bookkeeping) carries back to the session record.
///
/// Deliberately omits `block_owner_deletion`: requiring it would need foreign
/// delete permissions the backend identity does not hold in tenant
/// namespaces. Cascade deletion still happens; it is simply not blocking.
///
/// # Errors
///
/// Returns an error if the session record lacks a `name` or `uid`, which
/// should only happen for a record that has not yet been persisted.
pub fn owner_reference(session: &AgenticSession) -> anyhow::Result<OwnerReference> {
    let name = session
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow::anyhow!("session record has no name"))?;
    let uid = session
        .metadata
        .uid
        .clone()
        .ok_or_else(|| anyhow::anyhow!("session record has no uid"))?;
    Ok(OwnerReference {
        api_version: format!("{GROUP}/{VERSION}"),
        kind: "AgenticSession".to_owned(),
        name,
        uid,
        controller: Some(true),
        block_owner_deletion: None,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phases_are_absorbing() {
        assert!(SessionPhase::Completed.is_terminal());
        assert!(SessionPhase::Failed.is_terminal());
        assert!(SessionPhase::Stopped.is_terminal());
        assert!(SessionPhase::Error.is_terminal());
        assert!(!SessionPhase::Pending.is_terminal());
        assert!(!SessionPhase::Creating.is_terminal());
        assert!(!SessionPhase::Running.is_terminal());
    }

    #[test]
    fn deterministic_names_are_derived_from_session_name() {
        assert_eq!(credential_secret_name("my-session"), "my-session-session-token");
        assert_eq!(role_binding_name("my-session"), "my-session-session-binding");
        assert_eq!(subject_name("my-session"), "my-session-session-sa");
        assert_eq!(job_name("my-session"), "my-session-job");
    }

    #[test]
    fn pending_status_has_no_times_set() {
        let status = AgenticSessionStatus::pending();
        assert_eq!(status.phase, SessionPhase::Pending);
        assert!(status.start_time.is_none());
        assert!(status.completion_time.is_none());
    }
}
