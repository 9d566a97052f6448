//! Session lifecycle reconciler.
//!
//! A single long-lived watch per tenant on the `AgenticSession` kind, drained
//! by one cooperative consumer. On channel close (expected periodically, e.g.
//! the substrate's watch timeout) the watch is rebuilt after a fixed backoff;
//! this loop is the only non-terminating task the reconciler itself runs —
//! everything else (Job Monitor supervisors) is detached per session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, Patch, PatchParams, PostParams, WatchEvent, WatchParams};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::config::AppConfig;
use crate::crd::{self, AgenticSession, AgenticSessionStatus, SessionPhase};
use crate::credentials;
use crate::job_builder;
use crate::job_monitor;
use crate::kube_client::Substrate;
use crate::workspace;

/// Backoff applied after a watch stream closes before it is rebuilt.
const WATCH_RESTART_BACKOFF: Duration = Duration::from_secs(2);

/// Drives one tenant's `AgenticSession` records to their Jobs.
pub struct Reconciler {
    substrate: Substrate,
    config: AppConfig,
    tenant: String,
    /// Job Monitor supervisors currently running, keyed by session name, so a
    /// restart can be told "don't spawn a second supervisor for this attempt".
    monitors: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Reconciler {
    /// Construct a reconciler for a single tenant namespace.
    #[must_use]
    pub fn new(substrate: Substrate, config: AppConfig, tenant: String) -> Self {
        Self {
            substrate,
            config,
            tenant,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Run the watch loop forever. Never returns under normal operation;
    /// errors building a watch stream are logged and retried after backoff.
    pub async fn run(self: Arc<Self>) -> ! {
        loop {
            if let Err(e) = self.watch_once().await {
                warn!(error = %e, tenant = %self.tenant, "session watch stream ended, rebuilding after backoff");
            }
            tokio::time::sleep(WATCH_RESTART_BACKOFF).await;
        }
    }

    /// Drive a single reconciliation pass over every session currently in
    /// the tenant, then return. Used by the `reconcile-once` CLI subcommand;
    /// unlike [`Self::run`], this never watches and never spawns monitors
    /// beyond what a single pass requires.
    ///
    /// # Errors
    ///
    /// Returns an error if the session list cannot be read from the substrate.
    pub async fn reconcile_all(&self) -> anyhow::Result<()> {
        let api: Api<AgenticSession> = self.substrate.backend_typed(&self.tenant);
        let sessions = api.list(&kube::api::ListParams::default()).await?;
        for session in sessions.items {
            let Some(name) = session.metadata.name.clone() else {
                continue;
            };
            if let Err(e) = self.reconcile(&name, session).await {
                warn!(session = %name, error = %e, "reconcile-once pass failed for session");
            }
        }
        Ok(())
    }

    async fn watch_once(&self) -> anyhow::Result<()> {
        let api: Api<AgenticSession> = self.substrate.backend_typed(&self.tenant);
        let wp = WatchParams::default();
        let mut stream = api.watch(&wp, "0").await?.boxed();

        while let Some(event) = stream.next().await {
            match event {
                Ok(WatchEvent::Added(session) | WatchEvent::Modified(session)) => {
                    self.dispatch(session).await;
                }
                Ok(WatchEvent::Deleted(session)) => {
                    self.handle_deletion(session).await;
                }
                Ok(WatchEvent::Bookmark(_)) => {}
                Ok(WatchEvent::Error(e)) => {
                    warn!(error = %e, "watch stream reported an error event");
                }
                Err(e) => {
                    warn!(error = %e, "watch stream transport error");
                }
            }
        }

        Ok(())
    }

    /// Re-read the record by name to guard against stale events, then
    /// reconcile it. If the record no longer exists, silently return.
    #[instrument(skip(self, stale), fields(tenant = %self.tenant, session = tracing::field::Empty))]
    async fn dispatch(&self, stale: AgenticSession) {
        let Some(name) = stale.metadata.name.clone() else {
            return;
        };
        tracing::Span::current().record("session", name.as_str());

        let api: Api<AgenticSession> = self.substrate.backend_typed(&self.tenant);
        let current = match api.get_opt(&name).await {
            Ok(Some(s)) => s,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "failed to re-read session record before reconciling");
                return;
            }
        };

        if let Err(e) = self.reconcile(&name, current).await {
            warn!(error = %e, "reconcile failed");
        }
    }

    async fn reconcile(&self, name: &str, session: AgenticSession) -> anyhow::Result<()> {
        let annotations = session.metadata.annotations.clone().unwrap_or_default();

        if annotations.contains_key(crd::STOP_REQUESTED_ANNOTATION) {
            return self.handle_stop(name, session).await;
        }
        if annotations.contains_key(crd::RESTART_REQUESTED_ANNOTATION) {
            return self.handle_restart(name, session).await;
        }

        let phase = session.status.as_ref().map_or(SessionPhase::Pending, |s| s.phase);
        match phase {
            SessionPhase::Pending => self.handle_pending(name, session).await,
            // Creating/Running are owned by the Job Monitor supervisor once
            // spawned; re-ensure one is running in case the process restarted.
            SessionPhase::Creating | SessionPhase::Running => {
                self.ensure_monitor_running(name).await;
                Ok(())
            }
            SessionPhase::Completed
            | SessionPhase::Failed
            | SessionPhase::Stopped
            | SessionPhase::Error => Ok(()),
        }
    }

    #[instrument(skip(self, session), fields(tenant = %self.tenant, session = %name))]
    async fn handle_pending(&self, name: &str, session: AgenticSession) -> anyhow::Result<()> {
        info!("assembling job for pending session");

        if let Err(e) = workspace::ensure_tenant_volume(&self.substrate, &self.config, &self.tenant).await {
            return self.fail(name, format!("workspace volume provisioning failed: {e}")).await;
        }

        let layout = workspace::SessionLayout::for_session(workspace::mount_path(), name);
        if let Err(e) = workspace::ensure_session_directories(&layout) {
            warn!(error = %e, "failed to pre-create session directories; worker will create them");
        }

        let creds = match credentials::ensure_credentials(&self.substrate, &self.tenant, &session).await {
            Ok(c) => c,
            Err(e) => return self.fail(name, format!("credential provisioning failed: {e}")).await,
        };

        let prompt_configmap = match job_builder::build_prompt_configmap(&session, name) {
            Ok(cm) => cm,
            Err(e) => return self.fail(name, format!("prompt configmap build failed: {e}")).await,
        };
        let configmaps: Api<ConfigMap> = self.substrate.backend_typed(&self.tenant);
        if configmaps.get_opt(prompt_configmap.metadata.name.as_deref().unwrap_or_default()).await?.is_none() {
            if let Err(e) = configmaps.create(&PostParams::default(), &prompt_configmap).await {
                return self.fail(name, format!("prompt configmap creation failed: {e}")).await;
            }
        }

        let job = match job_builder::build_job(&self.config, &session, name, &creds.secret_name) {
            Ok(j) => j,
            Err(e) => return self.fail(name, format!("job build failed: {e}")).await,
        };

        let jobs: Api<Job> = self.substrate.backend_typed(&self.tenant);
        let job_name = crd::job_name(name);
        if jobs.get_opt(&job_name).await?.is_none() {
            if let Err(e) = jobs.create(&PostParams::default(), &job).await {
                return self.fail(name, format!("job creation failed: {e}")).await;
            }
        }

        self.patch_status(
            name,
            &AgenticSessionStatus {
                phase: SessionPhase::Creating,
                job_name: Some(job_name),
                state_dir: Some(workspace::SessionLayout::state_dir_label(name)),
                ..AgenticSessionStatus::pending()
            },
        )
        .await?;

        self.ensure_monitor_running(name).await;
        Ok(())
    }

    async fn handle_stop(&self, name: &str, session: AgenticSession) -> anyhow::Result<()> {
        let phase = session.status.as_ref().map_or(SessionPhase::Pending, |s| s.phase);
        if phase.is_terminal() {
            // Stop on an already-terminal session is a no-op; just clear the annotation.
            self.clear_annotation(name, crd::STOP_REQUESTED_ANNOTATION).await?;
            return Ok(());
        }

        info!(session = %name, "stopping session on explicit request");

        let jobs: Api<Job> = self.substrate.backend_typed(&self.tenant);
        let dp = kube::api::DeleteParams::background();
        match jobs.delete(&crd::job_name(name), &dp).await {
            Ok(_) | Err(kube::Error::Api(kube::core::ErrorResponse { code: 404, .. })) => {}
            Err(e) => return Err(e.into()),
        }

        self.stop_monitor(name).await;

        let mut status = session.status.clone().unwrap_or_default();
        status.phase = SessionPhase::Stopped;
        status.message = Some("stopped by explicit request".to_owned());
        status.completion_time = Some(chrono::Utc::now());
        self.patch_status(name, &status).await?;
        self.clear_annotation(name, crd::STOP_REQUESTED_ANNOTATION).await?;
        Ok(())
    }

    async fn handle_restart(&self, name: &str, session: AgenticSession) -> anyhow::Result<()> {
        let phase = session.status.as_ref().map_or(SessionPhase::Pending, |s| s.phase);
        if !phase.is_terminal() {
            // Restart only makes sense from a terminal phase; drop the request.
            self.clear_annotation(name, crd::RESTART_REQUESTED_ANNOTATION).await?;
            return Ok(());
        }

        info!(session = %name, "restarting session: cleaning up prior attempt");

        let jobs: Api<Job> = self.substrate.backend_typed(&self.tenant);
        let dp = kube::api::DeleteParams::background();
        match jobs.delete(&crd::job_name(name), &dp).await {
            Ok(_) | Err(kube::Error::Api(kube::core::ErrorResponse { code: 404, .. })) => {}
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = credentials::regenerate_token(&self.substrate, &self.tenant, name, &session).await {
            return self.fail(name, format!("token regeneration failed on restart: {e}")).await;
        }

        // Preserve nothing from the prior attempt's worker summary; a fresh
        // attempt starts from a clean Pending status.
        self.patch_status(name, &AgenticSessionStatus::pending()).await?;
        self.clear_annotation(name, crd::RESTART_REQUESTED_ANNOTATION).await?;
        Ok(())
    }

    async fn handle_deletion(&self, session: AgenticSession) {
        let Some(name) = session.metadata.name.clone() else {
            return;
        };
        self.stop_monitor(&name).await;
        // Owner references cascade Job/credential deletion; this explicit
        // cleanup runs best-effort in case the cascade hasn't caught up yet.
        credentials::delete_credentials(&self.substrate, &self.tenant, &name).await;
    }

    async fn ensure_monitor_running(&self, name: &str) {
        let mut monitors = self.monitors.lock().await;
        if let Some(handle) = monitors.get(name) {
            if !handle.is_finished() {
                return;
            }
        }
        let supervisor = job_monitor::Supervisor::new(
            self.substrate.clone(),
            self.config.clone(),
            self.tenant.clone(),
            name.to_owned(),
        );
        let handle = tokio::spawn(supervisor.run());
        monitors.insert(name.to_owned(), handle);
    }

    async fn stop_monitor(&self, name: &str) {
        if let Some(handle) = self.monitors.lock().await.remove(name) {
            handle.abort();
        }
    }

    async fn fail(&self, name: &str, message: String) -> anyhow::Result<()> {
        warn!(session = %name, %message, "session entering Error phase");
        self.patch_status(
            name,
            &AgenticSessionStatus {
                phase: SessionPhase::Error,
                message: Some(message),
                completion_time: Some(chrono::Utc::now()),
                ..AgenticSessionStatus::pending()
            },
        )
        .await
    }

    /// Patch the status subresource. A concurrent deletion during the patch
    /// is treated as success.
    async fn patch_status(&self, name: &str, status: &AgenticSessionStatus) -> anyhow::Result<()> {
        let api: Api<AgenticSession> = self.substrate.backend_typed(&self.tenant);
        let patch = serde_json::json!({ "status": status });
        match api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch)).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(kube::core::ErrorResponse { code: 404, .. })) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear_annotation(&self, name: &str, key: &str) -> anyhow::Result<()> {
        let api: Api<AgenticSession> = self.substrate.backend_typed(&self.tenant);
        let patch = serde_json::json!({ "metadata": { "annotations": { key: serde_json::Value::Null } } });
        match api.patch(name, &PatchParams::default(), &Patch::Merge(patch)).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(kube::core::ErrorResponse { code: 404, .. })) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phase_blocks_stop_noop_semantics_documented() {
        // Stop on an already-stopped session is a no-op; the branch is
        // covered at the integration level since it requires a live
        // Api<AgenticSession>. This test only pins the phase classification
        // the branch depends on.
        assert!(SessionPhase::Stopped.is_terminal());
        assert!(!SessionPhase::Running.is_terminal());
    }
}
