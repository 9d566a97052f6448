//! Job builder: translates a session record into a `Job` spec with a single
//! Pod template running the worker container.
//!
//! Follows the same `build_main_container` / `build_pod_spec` idiom used
//! elsewhere in this crate's Kubernetes object construction, but targets a
//! `Job` (never-restart, supervised by [`crate::job_monitor`]) instead of a
//! long-lived Pod.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec,
    ResourceRequirements, SecretKeySelector, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde::Serialize;

use crate::config::AppConfig;
use crate::crd::{self, AgenticSession, ResourceOverrides};
use crate::errors::CoreError;
use crate::paths;
use crate::workspace::{self, SessionLayout};

/// Label applied to the Job and its Pod template, used by the Job Monitor and
/// by cleanup sweeps to recognize worker Pods belonging to this operator.
const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const MANAGED_BY_VALUE: &str = "agentic-session-operator";
const SESSION_NAME_LABEL: &str = "agentic.sessions.io/session";

/// Directory the prompt `ConfigMap` is mounted under in the worker container.
const PROMPT_MOUNT_DIR: &str = "/etc/agentic-session";
/// Image used by the repo-clone init containers. Small, widely cached, and
/// carries nothing beyond `git` itself.
const GIT_CLONE_IMAGE: &str = "alpine/git:2.45.2";

/// Name of the `ConfigMap` carrying a session's prompt, delivered to the
/// worker as a mounted file rather than an environment variable (prompts can
/// be arbitrarily large and must not be truncated by an env var limit).
#[must_use]
pub fn prompt_configmap_name(session_name: &str) -> String {
    format!("{session_name}-prompt")
}

/// Build the `ConfigMap` holding a session's prompt, owned by the session
/// record so it is cascade-deleted with it.
///
/// # Errors
///
/// Returns an error if the session record carries no owner reference
/// (i.e. has no UID yet).
pub fn build_prompt_configmap(session: &AgenticSession, session_name: &str) -> anyhow::Result<ConfigMap> {
    let owner_ref = crd::owner_reference(session)?;
    let mut data = BTreeMap::new();
    data.insert("prompt".to_owned(), session.spec.prompt.clone());

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(prompt_configmap_name(session_name)),
            namespace: Some(session.metadata.namespace.clone().unwrap_or_default()),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

/// The repo list as delivered to the worker: one entry per configured repo,
/// serialized as JSON into an environment variable. Kept intentionally small
/// (urls and branches only; no credentials) since environment variables are
/// visible via `kubectl describe`.
#[derive(Debug, Serialize)]
struct WorkerRepoEntry {
    input_url: String,
    input_branch: Option<String>,
    output_url: Option<String>,
    output_branch: Option<String>,
    folder: String,
}

/// Build the `Job` spec for a session's current attempt.
///
/// # Errors
///
/// Returns [`CoreError::JobBuildFailed`] if any repo URL fails to parse.
pub fn build_job(
    config: &AppConfig,
    session: &AgenticSession,
    session_name: &str,
    secret_name: &str,
) -> Result<Job, CoreError> {
    let session_id = session.metadata.uid.clone().unwrap_or_default();
    build_job_inner(config, session, session_name, secret_name).map_err(|source| {
        CoreError::JobBuildFailed {
            session_id: uuid::Uuid::parse_str(&session_id).unwrap_or_else(|_| uuid::Uuid::nil()),
            source,
        }
    })
}

fn build_job_inner(
    config: &AppConfig,
    session: &AgenticSession,
    session_name: &str,
    secret_name: &str,
) -> anyhow::Result<Job> {
    let spec = &session.spec;

    let repos = spec
        .repos
        .iter()
        .map(|r| {
            let repo_ref = paths::canonicalize_repo_url(&r.input.url)?;
            Ok(WorkerRepoEntry {
                input_url: r.input.url.clone(),
                input_branch: r.input.branch.clone(),
                output_url: r.output.as_ref().map(|o| o.url.clone()),
                output_branch: r.output.as_ref().and_then(|o| o.branch.clone()),
                folder: repo_ref.workspace_folder().to_owned(),
            })
        })
        .collect::<Result<Vec<_>, crate::errors::ValidationError>>()?;

    let layout = SessionLayout::for_session(workspace::mount_path(), session_name);
    let owner_ref = crd::owner_reference(session)?;
    let job_name = crd::job_name(session_name);

    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned());
    labels.insert(SESSION_NAME_LABEL.to_owned(), session_name.to_owned());

    let container = build_worker_container(config, spec, session_name, secret_name, &repos, &layout)?;
    let init_containers = build_clone_init_containers(&repos, &layout);

    let pod_spec = PodSpec {
        init_containers: (!init_containers.is_empty()).then_some(init_containers),
        containers: vec![container],
        restart_policy: Some("Never".to_owned()),
        service_account_name: Some(crd::subject_name(session_name)),
        security_context: Some(k8s_openapi::api::core::v1::PodSecurityContext {
            run_as_non_root: Some(true),
            run_as_user: Some(1000),
            fs_group: Some(1000),
            ..Default::default()
        }),
        volumes: Some(vec![
            Volume {
                name: "workspace-root".to_owned(),
                persistent_volume_claim: Some(
                    k8s_openapi::api::core::v1::PersistentVolumeClaimVolumeSource {
                        claim_name: "agentic-sessions-workspace".to_owned(),
                        read_only: Some(false),
                    },
                ),
                ..Default::default()
            },
            Volume {
                name: "prompt".to_owned(),
                config_map: Some(ConfigMapVolumeSource {
                    name: prompt_configmap_name(session_name),
                    optional: Some(false),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let job = Job {
        metadata: ObjectMeta {
            name: Some(job_name),
            namespace: Some(session.metadata.namespace.clone().unwrap_or_default()),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_ref]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            selector: None::<LabelSelector>,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    };

    Ok(job)
}

fn build_worker_container(
    config: &AppConfig,
    spec: &crd::AgenticSessionSpec,
    session_name: &str,
    secret_name: &str,
    repos: &[WorkerRepoEntry],
    layout: &SessionLayout,
) -> anyhow::Result<Container> {
    let mut env = vec![
        EnvVar {
            name: "AGENTIC_SESSION_NAME".to_owned(),
            value: Some(session_name.to_owned()),
            ..Default::default()
        },
        EnvVar {
            name: "AGENTIC_SESSION_PROMPT_FILE".to_owned(),
            value: Some(format!("{PROMPT_MOUNT_DIR}/prompt")),
            ..Default::default()
        },
        EnvVar {
            name: "AGENTIC_SESSION_TOKEN_FILE".to_owned(),
            value: Some("/var/run/secrets/agentic-session/token".to_owned()),
            ..Default::default()
        },
        EnvVar {
            name: "AGENTIC_SESSION_WORKSPACE_DIR".to_owned(),
            value: Some(layout.workspace_dir.to_string_lossy().into_owned()),
            ..Default::default()
        },
        EnvVar {
            name: "AGENTIC_SESSION_REPOS".to_owned(),
            value: Some(serde_json::to_string(repos)?),
            ..Default::default()
        },
        EnvVar {
            name: "AGENTIC_SESSION_MAIN_REPO_INDEX".to_owned(),
            value: Some(spec.main_repo_index.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "AGENTIC_SESSION_INTERACTIVE".to_owned(),
            value: Some(spec.interactive.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "AGENTIC_SESSION_LLM_MODEL".to_owned(),
            value: Some(spec.llm_settings.model.clone()),
            ..Default::default()
        },
    ];

    if let Some(temperature) = spec.llm_settings.temperature {
        env.push(EnvVar {
            name: "AGENTIC_SESSION_LLM_TEMPERATURE".to_owned(),
            value: Some(temperature.to_string()),
            ..Default::default()
        });
    }
    if let Some(max_tokens) = spec.llm_settings.max_tokens {
        env.push(EnvVar {
            name: "AGENTIC_SESSION_LLM_MAX_TOKENS".to_owned(),
            value: Some(max_tokens.to_string()),
            ..Default::default()
        });
    }

    // Per-session token mounted as a file, not an env var: env vars show up
    // in `kubectl describe`, secret file mounts do not by default.
    env.push(EnvVar {
        name: "AGENTIC_SESSION_TOKEN".to_owned(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.to_owned(),
                key: "token".to_owned(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
    });

    // User-provided environment, values never logged by anything touching this struct.
    for (key, value) in &spec.environment {
        env.push(EnvVar {
            name: key.clone(),
            value: Some(value.clone()),
            ..Default::default()
        });
    }

    let (cpu_request, cpu_limit, memory_request, memory_limit) =
        resolve_resources(config, spec.resource_overrides.as_ref());

    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_owned(), Quantity(cpu_request));
    requests.insert("memory".to_owned(), Quantity(memory_request));
    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_owned(), Quantity(cpu_limit));
    limits.insert("memory".to_owned(), Quantity(memory_limit));

    Ok(Container {
        name: "worker".to_owned(),
        image: Some(config.worker_image.clone()),
        env: Some(env),
        working_dir: Some(layout.workspace_dir.to_string_lossy().into_owned()),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "workspace-root".to_owned(),
                mount_path: workspace::mount_path().to_string_lossy().into_owned(),
                ..Default::default()
            },
            VolumeMount {
                name: "prompt".to_owned(),
                mount_path: PROMPT_MOUNT_DIR.to_owned(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        resources: Some(ResourceRequirements {
            requests: Some(requests),
            limits: Some(limits),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            run_as_non_root: Some(true),
            run_as_user: Some(1000),
            allow_privilege_escalation: Some(false),
            capabilities: Some(k8s_openapi::api::core::v1::Capabilities {
                drop: Some(vec!["ALL".to_owned()]),
                add: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// One init container per `repos` entry, run in order by the Pod's own
/// init-container sequencing, each cloning into its derived workspace
/// subdirectory before the worker container starts. An unparseable repo URL
/// is caught earlier in [`build_job_inner`] and never reaches here.
fn build_clone_init_containers(repos: &[WorkerRepoEntry], layout: &SessionLayout) -> Vec<Container> {
    repos
        .iter()
        .map(|repo| {
            let dest = layout.workspace_dir.join(&repo.folder);
            let mut args = vec!["clone".to_owned(), "--depth".to_owned(), "1".to_owned()];
            if let Some(branch) = &repo.input_branch {
                args.push("--branch".to_owned());
                args.push(branch.clone());
            }
            args.push(repo.input_url.clone());
            args.push(dest.to_string_lossy().into_owned());

            Container {
                name: format!("clone-{}", repo.folder),
                image: Some(GIT_CLONE_IMAGE.to_owned()),
                command: Some(vec!["git".to_owned()]),
                args: Some(args),
                volume_mounts: Some(vec![VolumeMount {
                    name: "workspace-root".to_owned(),
                    mount_path: workspace::mount_path().to_string_lossy().into_owned(),
                    ..Default::default()
                }]),
                security_context: Some(SecurityContext {
                    run_as_non_root: Some(true),
                    run_as_user: Some(1000),
                    allow_privilege_escalation: Some(false),
                    capabilities: Some(k8s_openapi::api::core::v1::Capabilities {
                        drop: Some(vec!["ALL".to_owned()]),
                        add: None,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }
        })
        .collect()
}

fn resolve_resources(
    config: &AppConfig,
    overrides: Option<&ResourceOverrides>,
) -> (String, String, String, String) {
    let cpu_request = overrides
        .and_then(|o| o.cpu.clone())
        .unwrap_or_else(|| config.default_cpu_request.clone());
    let cpu_limit = overrides
        .and_then(|o| o.cpu.clone())
        .unwrap_or_else(|| config.default_cpu_limit.clone());
    let memory_request = overrides
        .and_then(|o| o.memory.clone())
        .unwrap_or_else(|| config.default_memory_request.clone());
    let memory_limit = overrides
        .and_then(|o| o.memory.clone())
        .unwrap_or_else(|| config.default_memory_limit.clone());
    (cpu_request, cpu_limit, memory_request, memory_limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AgenticSessionSpec, LlmSettings};
    use kube::Resource;

    fn sample_session() -> AgenticSession {
        let mut session = AgenticSession::new(
            "sess-1",
            AgenticSessionSpec {
                prompt: "hello".to_owned(),
                display_name: None,
                interactive: false,
                timeout_seconds: None,
                llm_settings: LlmSettings {
                    model: "claude".to_owned(),
                    temperature: None,
                    max_tokens: None,
                },
                repos: vec![],
                main_repo_index: 0,
                environment: BTreeMap::new(),
                resource_overrides: None,
                owner: "alice".to_owned(),
            },
        );
        session.meta_mut().namespace = Some("team-a".to_owned());
        session.meta_mut().uid = Some("11111111-1111-1111-1111-111111111111".to_owned());
        session
    }

    #[test]
    fn job_carries_owner_reference_and_labels() {
        let config = AppConfig::default();
        let session = sample_session();
        let job = build_job(&config, &session, "sess-1", "sess-1-session-token").expect("builds");
        assert_eq!(job.metadata.name.as_deref(), Some("sess-1-job"));
        assert!(job.metadata.owner_references.is_some());
        let pod_spec = job
            .spec
            .as_ref()
            .expect("spec")
            .template
            .spec
            .as_ref()
            .expect("pod spec");
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(
            pod_spec.service_account_name.as_deref(),
            Some("sess-1-session-sa")
        );
    }

    #[test]
    fn worker_container_drops_all_capabilities_and_is_non_root() {
        let config = AppConfig::default();
        let session = sample_session();
        let job = build_job(&config, &session, "sess-1", "sess-1-session-token").expect("builds");
        let container = &job.spec.unwrap().template.spec.unwrap().containers[0];
        let sc = container.security_context.as_ref().expect("security context");
        assert_eq!(sc.run_as_non_root, Some(true));
        assert_eq!(sc.allow_privilege_escalation, Some(false));
        assert_eq!(sc.capabilities.as_ref().unwrap().drop.as_deref(), Some(["ALL".to_owned()].as_slice()));
    }

    #[test]
    fn unparseable_repo_url_fails_job_build() {
        let config = AppConfig::default();
        let mut session = sample_session();
        session.spec.repos = vec![crate::crd::RepoEntry {
            input: crate::crd::RepoLocation {
                url: String::new(),
                branch: None,
            },
            output: None,
            status: None,
        }];
        let err = build_job(&config, &session, "sess-1", "sess-1-session-token").unwrap_err();
        assert!(matches!(err, CoreError::JobBuildFailed { .. }));
    }

    #[test]
    fn resource_overrides_apply_to_both_request_and_limit() {
        let config = AppConfig::default();
        let overrides = ResourceOverrides {
            cpu: Some("4".to_owned()),
            memory: Some("8Gi".to_owned()),
        };
        let (cpu_req, cpu_limit, mem_req, mem_limit) = resolve_resources(&config, Some(&overrides));
        assert_eq!(cpu_req, "4");
        assert_eq!(cpu_limit, "4");
        assert_eq!(mem_req, "8Gi");
        assert_eq!(mem_limit, "8Gi");
    }
}
