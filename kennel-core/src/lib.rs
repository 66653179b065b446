//! # Kennel Core
//!
//! Scheduling core for kennel: a queue that hands every job to exactly one
//! dispatcher, a dispatcher that turns claimed jobs into cluster workloads,
//! the lurcher sidecar that uploads scan results, and the cascading rule
//! engine that turns findings into follow-up scans.
//!
//! ## Feature Flags
//!
//! - `database`: Postgres queue backend (SQLx). On by default.
//! - `postgres-tests`: runs the Postgres queue tests against `DATABASE_URL`.
//!
//! ## Architecture
//!
//! - [`queue`]: [`QueueService`] with in-memory and Postgres backends
//! - [`engine`]: [`ScanJobService`], the operations behind the engine's HTTP API
//! - [`storage`]: presigned result URLs
//! - [`cluster`]: job definitions, workload construction, Kubernetes adapters
//! - [`dispatcher`]: the reconcile loop
//! - [`lurcher`]: the result-extraction sidecar
//! - [`cascade`]: the cascading rule engine
//! - [`client`]: HTTP client for the engine

pub mod broker;
pub mod cascade;
pub mod client;
pub mod cluster;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod lurcher;
pub mod queue;
pub mod storage;

pub use broker::JobBroker;
pub use client::EngineClient;
pub use dispatcher::{Dispatcher, DispatcherSettings, ReconcileOutcome};
pub use engine::{EngineSettings, ScanJobService};
pub use error::{Result, ScanError};
pub use queue::{
    ClaimRequest, CompletionRecord, FindingsRecord, InMemoryQueueService,
    ParseJob, QueueService,
};
#[cfg(feature = "database")]
pub use queue::PostgresQueueService;
pub use storage::{DisabledStorage, ObjectStorageGateway, S3Gateway, UrlMethod};

pub use kennel_model as model;

/// Schema migrations for the Postgres queue backend.
#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
