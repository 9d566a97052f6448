//! Control plane that schedules, executes, and streams results of
//! long-running agentic AI sessions on top of Kubernetes.

#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![warn(elided_lifetimes_in_paths)]
#![deny(unused_must_use)]
#![deny(unsafe_op_in_unsafe_fn)]

/// RBAC / Access Check: self-subject access reviews gating tenant-scoped requests.
pub mod access;
/// HTTP API Surface: session CRUD/lifecycle, workspace, git, websocket and messages.
pub mod api;
/// Process-wide configuration.
pub mod config;
/// Content-Staging Service: workspace file access and per-repo git operations.
pub mod content_staging;
/// Custom resource definitions (`AgenticSession`, `ProjectSettings`).
pub mod crd;
/// Per-Session Credential Provisioner.
pub mod credentials;
/// Error taxonomy.
pub mod errors;
/// Forge user-identity lookup for git push attribution.
pub mod forge;
/// Caller identity extraction from bearer tokens and forwarded headers.
pub mod identity;
/// Worker Job spec construction.
pub mod job_builder;
/// Job Monitor: per-session Job-to-status supervision.
pub mod job_monitor;
/// Substrate client facade (typed/dynamic, backend/per-request).
pub mod kube_client;
/// Session Messaging Hub and append-only persistence.
pub mod messaging;
/// Observability infrastructure.
pub mod observability;
/// Path containment checking and repository URL canonicalization.
pub mod paths;
/// Session Lifecycle Reconciler.
pub mod reconciler;
/// Per-tenant workspace provisioning and per-session directory layout.
pub mod workspace;
