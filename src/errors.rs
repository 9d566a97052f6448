//! Error taxonomy for the control plane.
//!
//! Four kinds of outcome are distinguished: validation errors (client's fault,
//! mapped to 400), authorization errors (401/403), transient substrate errors
//! (retried or absorbed inline, never surfaced as typed values), and terminal
//! [`CoreError`] values that get recorded on a session's status and logged in
//! full server-side while the client sees only a generic message.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// A request failed validation before any substrate call was made.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The request body did not deserialize or failed schema checks.
    #[error("invalid session spec: {reason}")]
    InvalidSpec {
        /// Human-readable reason.
        reason: String,
    },

    /// A workspace path escaped the session's sandbox.
    #[error("path '{path}' escapes workspace root")]
    PathEscape {
        /// The offending path, as received from the caller.
        path: String,
    },

    /// The requested operation is illegal in the session's current phase.
    #[error("operation '{operation}' is not valid while session is {current_phase}")]
    IllegalStateTransition {
        /// The attempted operation.
        operation: String,
        /// The session's current phase.
        current_phase: String,
    },

    /// A repository URL could not be parsed into `(owner, name)`.
    #[error("repository URL '{url}' could not be parsed: {reason}")]
    InvalidRepoUrl {
        /// The unparseable URL.
        url: String,
        /// Why parsing failed.
        reason: String,
    },
}

/// Authentication or authorization failed.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No bearer token, forwarded token, or query token was present.
    #[error("no caller token presented")]
    MissingToken,

    /// A token was presented but the substrate rejected it.
    #[error("caller token was rejected by the substrate")]
    InvalidToken,

    /// A self-subject access review denied the operation.
    #[error("access denied: caller may not {verb} {resource} in tenant {tenant}")]
    AccessDenied {
        /// The verb that was checked (e.g. "list", "get").
        verb: String,
        /// The resource kind that was checked.
        resource: String,
        /// The tenant namespace the check was scoped to.
        tenant: String,
    },
}

/// Substrate-terminal failures, recorded on session status as `phase=Error`.
///
/// Mirrors the session/backend error split the domain naturally falls into:
/// failures that originate from the session record's own lifecycle, and
/// failures that originate from the orchestration substrate underneath it.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Session not found.
    #[error("session {session_id} not found in tenant {tenant}")]
    NotFound {
        /// The tenant namespace searched.
        tenant: String,
        /// The session ID that was not found.
        session_id: Uuid,
    },

    /// Session name already exists within a tenant.
    #[error("session name '{name}' already exists in tenant {tenant}")]
    NameConflict {
        /// The tenant namespace.
        tenant: String,
        /// The conflicting name.
        name: String,
    },

    /// Credential provisioning failed.
    #[error("credential provisioning failed for session {session_id}: {source}")]
    CredentialProvisioningFailed {
        /// The session the credentials were for.
        session_id: Uuid,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// Token minting failed.
    #[error("token mint failed for session {session_id}: {source}")]
    TokenMintFailed {
        /// The session the token was for.
        session_id: Uuid,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// Workspace provisioning failed.
    #[error("workspace provisioning failed for session {session_id} at {path}: {source}")]
    WorkspaceProvisioningFailed {
        /// The session the workspace was for.
        session_id: Uuid,
        /// The workspace path that failed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// Job spec could not be built (e.g. an unparseable repo URL).
    #[error("job build failed for session {session_id}: {source}")]
    JobBuildFailed {
        /// The session the job was for.
        session_id: Uuid,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// Job creation on the substrate failed.
    #[error("job creation failed for session {session_id}: {source}")]
    JobCreateFailed {
        /// The session the job was for.
        session_id: Uuid,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// Content-staging git operation failed (push/abandon/diff).
    #[error("git {operation} failed for session {session_id} repo {repo}: {detail}")]
    GitOperationFailed {
        /// The session.
        session_id: Uuid,
        /// The repo subdirectory name.
        repo: String,
        /// The git subcommand attempted.
        operation: String,
        /// Stderr detail (already sanitized of any credentials).
        detail: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_path_escape_message_contains_path() {
        let err = ValidationError::PathEscape {
            path: "../../etc/passwd".to_owned(),
        };
        assert!(err.to_string().contains("../../etc/passwd"));
    }

    #[test]
    fn auth_access_denied_message_contains_tenant() {
        let err = AuthError::AccessDenied {
            verb: "list".to_owned(),
            resource: "agenticsessions".to_owned(),
            tenant: "team-a".to_owned(),
        };
        let msg = err.to_string();
        assert!(msg.contains("team-a"));
        assert!(msg.contains("list"));
    }

    #[test]
    fn core_not_found_message_contains_session_id() {
        let id = Uuid::new_v4();
        let err = CoreError::NotFound {
            tenant: "team-a".to_owned(),
            session_id: id,
        };
        assert!(err.to_string().contains(&id.to_string()));
    }
}
