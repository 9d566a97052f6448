//! Per-tenant workspace provisioner.
//!
//! Ensures a tenant-scoped, `ReadWriteMany`-capable persistent volume exists
//! before any session in that tenant launches, and lays out the per-session
//! subdirectory (`workspace/` plus an empty `artifacts/` sibling) that is the
//! sole rendezvous between the API, the content-staging service, and the
//! worker.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec, ResourceRequirements, VolumeResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use tracing::{instrument, warn};

use crate::config::AppConfig;
use crate::kube_client::Substrate;

/// Name of the shared PVC provisioned once per tenant.
fn tenant_pvc_name() -> &'static str {
    "agentic-sessions-workspace"
}

/// Ensure the tenant's shared workspace PVC exists, creating it with
/// `ReadWriteMany` access if absent.
///
/// # Errors
///
/// Returns an error if the PVC cannot be created for any reason other than
/// already existing.
#[instrument(skip(substrate, config), fields(tenant = %tenant))]
pub async fn ensure_tenant_volume(
    substrate: &Substrate,
    config: &AppConfig,
    tenant: &str,
) -> anyhow::Result<()> {
    let pvcs: Api<PersistentVolumeClaim> = substrate.backend_typed(tenant);
    if pvcs.get_opt(tenant_pvc_name()).await?.is_some() {
        return Ok(());
    }

    let mut requests = BTreeMap::new();
    requests.insert(
        "storage".to_owned(),
        Quantity(config.workspace_volume_size.clone()),
    );

    let pvc = |access_mode: &str| PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(tenant_pvc_name().to_owned()),
            namespace: Some(tenant.to_owned()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![access_mode.to_owned()]),
            storage_class_name: config.storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    match pvcs.create(&PostParams::default(), &pvc("ReadWriteMany")).await {
        Ok(_) | Err(kube::Error::Api(kube::core::ErrorResponse { code: 409, .. })) => Ok(()),
        // The configured storage class does not support ReadWriteMany; fall
        // back to ReadWriteOnce rather than failing the tenant outright.
        // This is a transient, per-tenant provisioning concern, not a
        // session-terminal error — the volume is provisioned once per
        // tenant, long before any individual session's attempt.
        Err(kube::Error::Api(kube::core::ErrorResponse { code: 422, .. })) => {
            warn!(tenant = %tenant, "ReadWriteMany unsupported by storage class, retrying with ReadWriteOnce");
            match pvcs.create(&PostParams::default(), &pvc("ReadWriteOnce")).await {
                Ok(_) | Err(kube::Error::Api(kube::core::ErrorResponse { code: 409, .. })) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// The mount path inside worker/API containers for the shared workspace volume.
#[must_use]
pub fn mount_path() -> &'static Path {
    Path::new("/workspace-root")
}

/// Layout of a single session's directory tree under the shared volume.
#[derive(Debug, Clone)]
pub struct SessionLayout {
    /// `<root>/sessions/<session>/workspace/` — where repos clone into.
    pub workspace_dir: PathBuf,
    /// `<root>/sessions/<session>/artifacts/` — sibling scratch area.
    pub artifacts_dir: PathBuf,
}

impl SessionLayout {
    /// Compute the layout for `session_name` relative to the shared mount root.
    #[must_use]
    pub fn for_session(root: &Path, session_name: &str) -> Self {
        let session_root = root.join("sessions").join(session_name);
        Self {
            workspace_dir: session_root.join("workspace"),
            artifacts_dir: session_root.join("artifacts"),
        }
    }

    /// The `status.stateDir` value recorded on the session record: the
    /// session's directory relative to the shared mount root.
    #[must_use]
    pub fn state_dir_label(session_name: &str) -> String {
        format!("sessions/{session_name}")
    }
}

/// Create a session's workspace and artifacts directories if they do not
/// already exist.
///
/// # Errors
///
/// Returns an error if directory creation fails for any reason other than
/// already existing (handled by `create_dir_all`'s own idempotence).
pub fn ensure_session_directories(layout: &SessionLayout) -> std::io::Result<()> {
    std::fs::create_dir_all(&layout.workspace_dir)?;
    std::fs::create_dir_all(&layout.artifacts_dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_nests_workspace_and_artifacts_under_session_name() {
        let layout = SessionLayout::for_session(Path::new("/root"), "abc-123");
        assert_eq!(
            layout.workspace_dir,
            PathBuf::from("/root/sessions/abc-123/workspace")
        );
        assert_eq!(
            layout.artifacts_dir,
            PathBuf::from("/root/sessions/abc-123/artifacts")
        );
    }

    #[test]
    fn state_dir_label_is_relative() {
        assert_eq!(SessionLayout::state_dir_label("abc-123"), "sessions/abc-123");
    }

    #[test]
    fn ensure_session_directories_creates_both() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = SessionLayout::for_session(dir.path(), "s1");
        ensure_session_directories(&layout).expect("create");
        assert!(layout.workspace_dir.is_dir());
        assert!(layout.artifacts_dir.is_dir());
    }
}
