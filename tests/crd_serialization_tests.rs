//! Black-box serialization tests for the custom resource types.
//!
//! These exercise the wire shape callers and the Kubernetes API server
//! actually see, as opposed to the colocated unit tests in `src/crd.rs`
//! which focus on the pure helper functions.

use agentic_session_operator::crd::{
    AgenticSessionSpec, AgenticSessionStatus, LlmSettings, RepoEntry, RepoLocation, RepoStatus,
    ResourceOverrides, SessionPhase, WorkerSummary,
};

fn sample_spec() -> AgenticSessionSpec {
    AgenticSessionSpec {
        prompt: "refactor the billing module".to_owned(),
        display_name: Some("Billing refactor".to_owned()),
        interactive: true,
        timeout_seconds: Some(3600),
        llm_settings: LlmSettings {
            model: "claude-sonnet".to_owned(),
            temperature: Some(0.2),
            max_tokens: Some(4096),
        },
        repos: vec![RepoEntry {
            input: RepoLocation {
                url: "github.com/acme/billing".to_owned(),
                branch: Some("main".to_owned()),
            },
            output: Some(RepoLocation {
                url: "github.com/acme/billing".to_owned(),
                branch: Some("agent/billing-refactor".to_owned()),
            }),
            status: None,
        }],
        main_repo_index: 0,
        environment: Default::default(),
        resource_overrides: Some(ResourceOverrides {
            cpu: Some("2".to_owned()),
            memory: Some("4Gi".to_owned()),
        }),
        owner: "alice@acme.example".to_owned(),
    }
}

#[test]
fn spec_round_trips_through_camel_case_json() {
    let spec = sample_spec();
    let json = serde_json::to_value(&spec).expect("serialize spec");

    assert_eq!(json["displayName"], "Billing refactor");
    assert_eq!(json["timeoutSeconds"], 3600);
    assert_eq!(json["llmSettings"]["model"], "claude-sonnet");
    assert_eq!(json["mainRepoIndex"], 0);

    let parsed: AgenticSessionSpec = serde_json::from_value(json).expect("deserialize spec");
    assert_eq!(parsed, spec);
}

#[test]
fn spec_defaults_fill_in_when_optional_fields_are_omitted() {
    let minimal = serde_json::json!({
        "prompt": "say hello",
        "llmSettings": { "model": "claude-haiku" },
        "owner": "bob@acme.example",
    });

    let parsed: AgenticSessionSpec = serde_json::from_value(minimal).expect("deserialize minimal spec");
    assert_eq!(parsed.display_name, None);
    assert!(!parsed.interactive);
    assert_eq!(parsed.timeout_seconds, None);
    assert!(parsed.repos.is_empty());
    assert_eq!(parsed.main_repo_index, 0);
    assert!(parsed.environment.is_empty());
    assert_eq!(parsed.resource_overrides, None);
}

#[test]
fn repo_status_serializes_lowercase() {
    let pushed = serde_json::to_value(RepoStatus::Pushed).unwrap();
    let abandoned = serde_json::to_value(RepoStatus::Abandoned).unwrap();
    assert_eq!(pushed, "pushed");
    assert_eq!(abandoned, "abandoned");
}

#[test]
fn status_round_trips_with_worker_summary() {
    let status = AgenticSessionStatus {
        phase: SessionPhase::Completed,
        message: Some("finished cleanly".to_owned()),
        start_time: None,
        completion_time: None,
        job_name: Some("my-session-job".to_owned()),
        state_dir: Some("sessions/my-session".to_owned()),
        summary: Some(WorkerSummary {
            is_error: false,
            num_turns: 12,
            session_id: "worker-session-id".to_owned(),
            total_cost_usd: 0.42,
            usage: serde_json::json!({ "input_tokens": 1000, "output_tokens": 500 }),
            result: Some("Refactored billing module".to_owned()),
        }),
    };

    let json = serde_json::to_value(&status).expect("serialize status");
    assert_eq!(json["phase"], "Completed");
    assert_eq!(json["jobName"], "my-session-job");
    assert_eq!(json["summary"]["numTurns"], 12);

    let parsed: AgenticSessionStatus = serde_json::from_value(json).expect("deserialize status");
    assert_eq!(parsed, status);
}

#[test]
fn session_phase_display_matches_serialized_variant_name() {
    for phase in [
        SessionPhase::Pending,
        SessionPhase::Creating,
        SessionPhase::Running,
        SessionPhase::Completed,
        SessionPhase::Failed,
        SessionPhase::Stopped,
        SessionPhase::Error,
    ] {
        let displayed = phase.to_string();
        let serialized = serde_json::to_value(phase).unwrap();
        assert_eq!(serde_json::Value::String(displayed), serialized);
    }
}
