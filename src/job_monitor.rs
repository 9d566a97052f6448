//! Job monitor: per-session supervisor that polls a Job's status to completion.
//!
//! One detached supervisor per session, spawned by the reconciler when a
//! session enters `Creating`. Polls the session's Job/Pod at a fixed cadence,
//! mirrors terminal state into the session's status subresource, and cleans
//! up the Job once a terminal state is reached. Every tick begins by
//! re-reading the session record; a missing record reclaims the supervisor
//! immediately, so supervisors never outlive their session.

use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PropagationPolicy};
use tracing::{info, instrument, warn};

use crate::config::AppConfig;
use crate::crd::{AgenticSession, AgenticSessionStatus, SessionPhase};
use crate::kube_client::Substrate;

/// Per-session background supervisor.
pub struct Supervisor {
    substrate: Substrate,
    config: AppConfig,
    tenant: String,
    session_name: String,
}

/// What a tick decided to do, used only to drive the test suite's pure
/// decision function without a live cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing terminal yet observed; keep polling.
    KeepPolling,
    /// The Job succeeded.
    Completed,
    /// The Job failed (either reported failure or deadline exceeded).
    Failed,
    /// The session or its Job disappeared; the supervisor should exit.
    Gone,
}

impl Supervisor {
    /// Construct a supervisor for one session.
    #[must_use]
    pub const fn new(substrate: Substrate, config: AppConfig, tenant: String, session_name: String) -> Self {
        Self {
            substrate,
            config,
            tenant,
            session_name,
        }
    }

    /// Run the polling loop until the session reaches a terminal phase or
    /// disappears. Never panics; every tick's errors are logged and retried
    /// on the next cadence.
    #[instrument(skip(self), fields(tenant = %self.tenant, session = %self.session_name))]
    pub async fn run(self) {
        let interval = Duration::from_secs(self.config.job_monitor_poll_interval_secs.max(1));
        loop {
            match self.tick().await {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "job monitor tick failed, will retry"),
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Run a single tick. Returns `Ok(true)` when the supervisor should exit
    /// (session gone, or a terminal phase was just recorded).
    async fn tick(&self) -> anyhow::Result<bool> {
        let sessions: Api<AgenticSession> = self.substrate.backend_typed(&self.tenant);
        let Some(session) = sessions.get_opt(&self.session_name).await? else {
            info!("session record gone, supervisor exiting");
            return Ok(true);
        };

        let mut status = session.status.clone().unwrap_or_default();
        if status.phase.is_terminal() {
            return Ok(true);
        }

        let jobs: Api<Job> = self.substrate.backend_typed(&self.tenant);
        let Some(job) = jobs.get_opt(&crate::crd::job_name(&self.session_name)).await? else {
            info!("job gone, supervisor exiting");
            return Ok(true);
        };

        if status.phase == SessionPhase::Creating && self.pod_is_running(&job).await? {
            status.phase = SessionPhase::Running;
            status.start_time = Some(status.start_time.unwrap_or_else(Utc::now));
            self.patch_status(&self.session_name, &status).await?;
        }

        let timeout_secs = session.spec.timeout_seconds.unwrap_or(self.config.default_timeout_seconds);
        if let Some(true) = is_timed_out(status.start_time, timeout_secs) {
            return self.finish(&jobs, &mut status, SessionPhase::Failed, "session exceeded its timeout".to_owned()).await;
        }

        let job_status = job.status.clone().unwrap_or_default();
        if job_status.succeeded.unwrap_or(0) > 0 {
            return self.finish(&jobs, &mut status, SessionPhase::Completed, "worker job completed successfully".to_owned()).await;
        }
        if job_status.failed.unwrap_or(0) > 0 {
            let detail = job_status
                .conditions
                .unwrap_or_default()
                .into_iter()
                .find(|c| c.type_ == "Failed")
                .and_then(|c| c.message)
                .unwrap_or_else(|| "worker job failed".to_owned());
            return self.finish(&jobs, &mut status, SessionPhase::Failed, detail).await;
        }

        Ok(false)
    }

    /// Pods created by a `Job` carry a `job-name` label set by the Job
    /// controller itself; list by that label rather than tracking Pod names.
    async fn pod_is_running(&self, job: &Job) -> anyhow::Result<bool> {
        let job_name = job
            .metadata
            .name
            .clone()
            .unwrap_or_else(|| crate::crd::job_name(&self.session_name));
        self.any_pod_running_for(&job_name).await
    }

    async fn any_pod_running_for(&self, job_name: &str) -> anyhow::Result<bool> {
        let pods: Api<Pod> = self.substrate.backend_typed(&self.tenant);
        let lp = kube::api::ListParams::default().labels(&format!("job-name={job_name}"));
        let list = pods.list(&lp).await?;
        Ok(list.items.iter().any(|p| {
            p.status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .is_some_and(|phase| phase == "Running")
        }))
    }

    /// Record a terminal phase and delete the Job with background
    /// propagation so owned Pods are collected asynchronously.
    ///
    /// If the worker posts its own summary after this
    /// supervisor has already recorded `Failed` on timeout, the worker's
    /// write is a later, independent status-subresource update and wins
    /// under optimistic concurrency — the monitor never re-reads and
    /// overwrites a summary after its own patch lands. We document this as
    /// the chosen precedence: last writer (by resourceVersion) wins, and the
    /// monitor does not attempt to re-assert Failed after a worker summary
    /// appears.
    async fn finish(
        &self,
        jobs: &Api<Job>,
        status: &mut AgenticSessionStatus,
        phase: SessionPhase,
        message: String,
    ) -> anyhow::Result<bool> {
        status.phase = phase;
        status.message = Some(message);
        status.completion_time = Some(Utc::now());
        self.patch_status(&self.session_name, status).await?;

        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..DeleteParams::default()
        };
        match jobs.delete(&crate::crd::job_name(&self.session_name), &dp).await {
            Ok(_) | Err(kube::Error::Api(kube::core::ErrorResponse { code: 404, .. })) => {}
            Err(e) => warn!(error = %e, "failed to delete terminal job"),
        }

        Ok(true)
    }

    async fn patch_status(&self, name: &str, status: &AgenticSessionStatus) -> anyhow::Result<()> {
        let api: Api<AgenticSession> = self.substrate.backend_typed(&self.tenant);
        let patch = serde_json::json!({ "status": status });
        match api.patch_status(name, &PatchParams::default(), &Patch::Merge(patch)).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(kube::core::ErrorResponse { code: 404, .. })) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Whether a session has run past its timeout, kept side-effect-free so it
/// is testable without a live substrate connection.
fn is_timed_out(start_time: Option<chrono::DateTime<Utc>>, timeout_secs: u64) -> Option<bool> {
    let start = start_time?;
    let elapsed = Utc::now().signed_duration_since(start);
    Some(elapsed.num_seconds() as u64 >= timeout_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timed_out_is_none_without_start_time() {
        assert_eq!(is_timed_out(None, 3600), None);
    }

    #[test]
    fn timed_out_true_past_deadline() {
        let start = Utc::now() - chrono::Duration::seconds(20);
        assert_eq!(is_timed_out(Some(start), 10), Some(true));
    }

    #[test]
    fn timed_out_false_within_deadline() {
        assert_eq!(is_timed_out(Some(Utc::now()), 3600), Some(false));
    }
}
