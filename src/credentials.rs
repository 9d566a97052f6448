//! Per-session credential provisioner.
//!
//! For each session, mints a dedicated subject (a `ServiceAccount`), a role
//! binding scoped to exactly the verbs the worker needs on its own session
//! record, and a short-lived token materialized as a secret. The worker never
//! sees a token broader than its own session.

use k8s_openapi::ByteString;
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use std::collections::BTreeMap;
use tracing::instrument;

use crate::crd::{self, AgenticSession};
use crate::kube_client::Substrate;

/// Default TTL requested for a per-session token, in seconds.
const TOKEN_TTL_SECONDS: i64 = 3600;

/// Field manager used for all server-side-apply-style patches this module issues.
const FIELD_MANAGER: &str = "agentic-session-operator.credentials";

/// The materialized credential triple for a session's worker.
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    /// Name of the dedicated `ServiceAccount` subject.
    pub subject_name: String,
    /// Name of the `RoleBinding` granting the subject its scoped verbs.
    pub role_binding_name: String,
    /// Name of the `Secret` holding the minted token.
    pub secret_name: String,
}

/// Ensure the per-session subject, role binding, and a freshly minted token
/// secret exist for `session`, creating whatever is missing.
///
/// # Errors
///
/// Returns an error if the subject or binding cannot be created, or if token
/// minting fails. A binding-creation failure is expected to be retried on
/// the next reconcile; callers should not treat it as terminal without
/// checking whether it is likely transient.
#[instrument(skip(substrate, session), fields(tenant = %tenant, session = %session.spec.owner))]
pub async fn ensure_credentials(
    substrate: &Substrate,
    tenant: &str,
    session: &AgenticSession,
) -> anyhow::Result<SessionCredentials> {
    let session_name = session
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow::anyhow!("session record has no name"))?;
    let owner_ref = crd::owner_reference(session)?;

    let subject_name = crd::subject_name(&session_name);
    let role_binding_name = crd::role_binding_name(&session_name);
    let secret_name = crd::credential_secret_name(&session_name);

    ensure_subject(substrate, tenant, &subject_name, &owner_ref).await?;
    ensure_role_and_binding(
        substrate,
        tenant,
        &session_name,
        &subject_name,
        &role_binding_name,
        &owner_ref,
    )
    .await?;
    mint_token_secret(substrate, tenant, &subject_name, &secret_name, &owner_ref).await?;

    Ok(SessionCredentials {
        subject_name,
        role_binding_name,
        secret_name,
    })
}

/// Delete and re-mint the token secret for a session restart, leaving the
/// subject and role binding in place (they are identical across attempts).
///
/// # Errors
///
/// Returns an error if token minting fails. A not-found on the delete of the
/// previous secret is absorbed as success.
pub async fn regenerate_token(
    substrate: &Substrate,
    tenant: &str,
    session_name: &str,
    owner: &AgenticSession,
) -> anyhow::Result<()> {
    let subject_name = crd::subject_name(session_name);
    let secret_name = crd::credential_secret_name(session_name);
    let owner_ref = crd::owner_reference(owner)?;

    let secrets: Api<Secret> = substrate.backend_typed(tenant);
    match secrets.delete(&secret_name, &DeleteParams::default()).await {
        Ok(_) => {}
        Err(kube::Error::Api(e)) if e.code == 404 => {}
        Err(e) => return Err(e.into()),
    }

    mint_token_secret(substrate, tenant, &subject_name, &secret_name, &owner_ref).await
}

/// Delete every credential resource for a session, best-effort. Called
/// explicitly on session deletion in addition to the owner-reference cascade,
/// since cascade deletion is not guaranteed to be synchronous.
pub async fn delete_credentials(substrate: &Substrate, tenant: &str, session_name: &str) {
    let dp = DeleteParams::default();

    let secrets: Api<Secret> = substrate.backend_typed(tenant);
    if let Err(e) = secrets
        .delete(&crd::credential_secret_name(session_name), &dp)
        .await
    {
        tracing::warn!(error = %e, "failed to delete session token secret during cleanup");
    }

    let bindings: Api<RoleBinding> = substrate.backend_typed(tenant);
    if let Err(e) = bindings
        .delete(&crd::role_binding_name(session_name), &dp)
        .await
    {
        tracing::warn!(error = %e, "failed to delete session role binding during cleanup");
    }

    let roles: Api<Role> = substrate.backend_typed(tenant);
    if let Err(e) = roles.delete(&role_name(session_name), &dp).await {
        tracing::warn!(error = %e, "failed to delete session role during cleanup");
    }

    let subjects: Api<ServiceAccount> = substrate.backend_typed(tenant);
    if let Err(e) = subjects.delete(&crd::subject_name(session_name), &dp).await {
        tracing::warn!(error = %e, "failed to delete session subject during cleanup");
    }
}

fn role_name(session_name: &str) -> String {
    format!("{session_name}-session-role")
}

async fn ensure_subject(
    substrate: &Substrate,
    tenant: &str,
    subject_name: &str,
    owner_ref: &OwnerReference,
) -> anyhow::Result<()> {
    let subjects: Api<ServiceAccount> = substrate.backend_typed(tenant);
    if subjects.get_opt(subject_name).await?.is_some() {
        return Ok(());
    }

    let sa = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(subject_name.to_owned()),
            namespace: Some(tenant.to_owned()),
            owner_references: Some(vec![owner_ref.clone()]),
            ..Default::default()
        },
        ..Default::default()
    };

    match subjects.create(&PostParams::default(), &sa).await {
        Ok(_) | Err(kube::Error::Api(kube::core::ErrorResponse { code: 409, .. })) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// The verbs a worker needs on its own session record and status:
/// read/update the record, update status, and manage its own Pod.
fn worker_policy_rules(session_name: &str) -> Vec<PolicyRule> {
    vec![
        PolicyRule {
            api_groups: Some(vec![crd::GROUP.to_owned()]),
            resources: Some(vec!["agenticsessions".to_owned()]),
            resource_names: Some(vec![session_name.to_owned()]),
            verbs: vec!["get".to_owned(), "update".to_owned()],
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec![crd::GROUP.to_owned()]),
            resources: Some(vec!["agenticsessions/status".to_owned()]),
            resource_names: Some(vec![session_name.to_owned()]),
            verbs: vec!["get".to_owned(), "update".to_owned(), "patch".to_owned()],
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["pods".to_owned()]),
            verbs: vec![
                "get".to_owned(),
                "list".to_owned(),
                "watch".to_owned(),
                "create".to_owned(),
                "update".to_owned(),
                "delete".to_owned(),
            ],
            ..Default::default()
        },
    ]
}

async fn ensure_role_and_binding(
    substrate: &Substrate,
    tenant: &str,
    session_name: &str,
    subject_name: &str,
    role_binding_name: &str,
    owner_ref: &OwnerReference,
) -> anyhow::Result<()> {
    let role_name = role_name(session_name);

    let roles: Api<Role> = substrate.backend_typed(tenant);
    let role = Role {
        metadata: ObjectMeta {
            name: Some(role_name.clone()),
            namespace: Some(tenant.to_owned()),
            owner_references: Some(vec![owner_ref.clone()]),
            ..Default::default()
        },
        rules: Some(worker_policy_rules(session_name)),
    };
    match roles.create(&PostParams::default(), &role).await {
        Ok(_) | Err(kube::Error::Api(kube::core::ErrorResponse { code: 409, .. })) => {}
        Err(e) => return Err(e.into()),
    }

    let bindings: Api<RoleBinding> = substrate.backend_typed(tenant);
    if bindings.get_opt(role_binding_name).await?.is_some() {
        return Ok(());
    }

    let binding = RoleBinding {
        metadata: ObjectMeta {
            name: Some(role_binding_name.to_owned()),
            namespace: Some(tenant.to_owned()),
            owner_references: Some(vec![owner_ref.clone()]),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_owned(),
            kind: "Role".to_owned(),
            name: role_name,
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_owned(),
            name: subject_name.to_owned(),
            namespace: Some(tenant.to_owned()),
            ..Default::default()
        }]),
    };

    match bindings.create(&PostParams::default(), &binding).await {
        Ok(_) | Err(kube::Error::Api(kube::core::ErrorResponse { code: 409, .. })) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Request a token for `subject_name` via the `ServiceAccount`'s token
/// subresource, and materialize it as a secret.
async fn mint_token_secret(
    substrate: &Substrate,
    tenant: &str,
    subject_name: &str,
    secret_name: &str,
    owner_ref: &OwnerReference,
) -> anyhow::Result<()> {
    let subjects: Api<ServiceAccount> = substrate.backend_typed(tenant);

    let token_request = TokenRequest {
        spec: TokenRequestSpec {
            expiration_seconds: Some(TOKEN_TTL_SECONDS),
            ..Default::default()
        },
        ..Default::default()
    };

    let response: TokenRequest = subjects
        .create_subresource("token", subject_name, &PostParams::default(), serde_json::to_vec(&token_request)?)
        .await?;

    let token = response
        .status
        .ok_or_else(|| anyhow::anyhow!("token request returned no status"))?
        .token;

    let mut data = BTreeMap::new();
    data.insert("token".to_owned(), ByteString(token.into_bytes()));

    let secrets: Api<Secret> = substrate.backend_typed(tenant);
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.to_owned()),
            namespace: Some(tenant.to_owned()),
            owner_references: Some(vec![owner_ref.clone()]),
            ..Default::default()
        },
        data: Some(data.clone()),
        type_: Some("Opaque".to_owned()),
        ..Default::default()
    };

    match secrets.create(&PostParams::default(), &secret).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(kube::core::ErrorResponse { code: 409, .. })) => {
            let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &data["token"].0);
            let patch = serde_json::json!({ "data": { "token": encoded } });
            secrets
                .patch(
                    secret_name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Merge(patch),
                )
                .await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_policy_rules_scope_to_session_name() {
        let rules = worker_policy_rules("my-session");
        let session_rule = &rules[0];
        assert_eq!(
            session_rule.resource_names.as_deref(),
            Some(["my-session".to_owned()].as_slice())
        );
        assert!(!session_rule.verbs.contains(&"delete".to_owned()));
    }

    #[test]
    fn role_name_is_deterministic() {
        assert_eq!(role_name("abc"), "abc-session-role");
    }
}
