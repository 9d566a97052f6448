//! RBAC / access checks against the caller's own substrate permissions.
//!
//! Before any tenant-scoped operation is served, a self-subject access
//! review asks the substrate whether the caller may perform a verb on a
//! resource kind in the target tenant. A deny short-circuits with 403; there
//! is no fallback identity and no cached "probably fine" shortcut.

use k8s_openapi::api::authentication::v1::SelfSubjectReview;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SelfSubjectAccessReview, SelfSubjectAccessReviewSpec,
};
use kube::api::{Api, PostParams};
use kube::Client;

use crate::crd;
use crate::errors::AuthError;

/// A verb + resource pair to check against the caller's own permissions.
#[derive(Debug, Clone, Copy)]
pub struct AccessCheck {
    /// The verb being checked (e.g. `"list"`, `"get"`, `"create"`).
    pub verb: &'static str,
    /// The plural resource name (e.g. `"agenticsessions"`).
    pub resource: &'static str,
}

impl AccessCheck {
    /// The coarse-grained check every tenant-scoped request passes before
    /// reaching its handler: "may this caller list sessions in this tenant?"
    pub const LIST_SESSIONS: Self = Self {
        verb: "list",
        resource: "agenticsessions",
    };

    /// Finer-grained checks for specific mutating operations.
    pub const CREATE_SESSION: Self = Self {
        verb: "create",
        resource: "agenticsessions",
    };
    /// Delete check.
    pub const DELETE_SESSION: Self = Self {
        verb: "delete",
        resource: "agenticsessions",
    };
}

/// Submit a self-subject access review as `client` (the caller's own
/// per-request identity, never the backend's) and return whether it was
/// allowed.
///
/// # Errors
///
/// Returns [`AuthError::InvalidToken`] if the review itself could not be
/// submitted (e.g. the token was rejected outright by the substrate).
pub async fn check(client: &Client, tenant: &str, check: AccessCheck) -> Result<bool, AuthError> {
    let reviews: Api<SelfSubjectAccessReview> = Api::all(client.clone());

    let review = SelfSubjectAccessReview {
        spec: SelfSubjectAccessReviewSpec {
            resource_attributes: Some(ResourceAttributes {
                namespace: Some(tenant.to_owned()),
                group: Some(crd::GROUP.to_owned()),
                resource: Some(check.resource.to_owned()),
                verb: Some(check.verb.to_owned()),
                ..Default::default()
            }),
            non_resource_attributes: None,
        },
        ..Default::default()
    };

    let response = reviews
        .create(&PostParams::default(), &review)
        .await
        .map_err(|_| AuthError::InvalidToken)?;

    Ok(response.status.is_some_and(|s| s.allowed))
}

/// Require that `check` passes, mapping a denial to [`AuthError::AccessDenied`]
/// carrying enough context to log without leaking the token itself.
///
/// # Errors
///
/// Returns [`AuthError::AccessDenied`] on denial, or whatever
/// [`check`] itself returns on failure to even submit the review.
pub async fn require(client: &Client, tenant: &str, access: AccessCheck) -> Result<(), AuthError> {
    if check(client, tenant, access).await? {
        Ok(())
    } else {
        Err(AuthError::AccessDenied {
            verb: access.verb.to_owned(),
            resource: access.resource.to_owned(),
            tenant: tenant.to_owned(),
        })
    }
}

/// Ask the substrate who `client` is authenticated as, via a self-subject
/// review. Used to recognize a worker's own per-session token, whose
/// `system:serviceaccount:<tenant>:<name>` username encodes the subject the
/// messaging hub cares about.
///
/// # Errors
///
/// Returns [`AuthError::InvalidToken`] if the review could not be submitted
/// or returned no username.
pub async fn whoami(client: &Client) -> Result<String, AuthError> {
    let reviews: Api<SelfSubjectReview> = Api::all(client.clone());
    let review = reviews
        .create(&PostParams::default(), &SelfSubjectReview::default())
        .await
        .map_err(|_| AuthError::InvalidToken)?;

    review
        .status
        .and_then(|s| s.user_info)
        .and_then(|u| u.username)
        .ok_or(AuthError::InvalidToken)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_sessions_check_is_list_verb() {
        assert_eq!(AccessCheck::LIST_SESSIONS.verb, "list");
        assert_eq!(AccessCheck::LIST_SESSIONS.resource, "agenticsessions");
    }
}
