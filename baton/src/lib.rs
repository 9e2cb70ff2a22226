//! Baton - a coordinator for distributed media transcoding.
//!
//! Baton accepts transcoding jobs, holds them until their dependencies have
//! succeeded, and places each eligible job on a worker node chosen by load,
//! capability fit and recent success. It retries failed attempts with
//! exponential backoff, requeues work from nodes that stop heartbeating and
//! grows or shrinks the node pool under queue pressure.
//!
//! # Core Concepts
//!
//! - **Job**: A [`JobSubmission`] becomes a [`JobRecord`] in the
//!   [`JobStore`], the single source of truth. Every state change is an
//!   atomic compare-and-set on one record.
//!
//! - **Node**: Workers register with the [`NodeRegistry`] and heartbeat to
//!   stay ACTIVE. The [`LoadBalancer`] ranks them for each job.
//!
//! - **Dispatch**: The [`Dispatcher`] claims jobs in [`dispatch_order`] and
//!   hands them to a [`ProcessingExecutor`].
//!
//! - **Events**: Every transition is published on a [`JobEventPublisher`]
//!   with a per-job `event_seq`.
//!
//! - **Coordinator**: [`Coordinator`] ties everything together and runs the
//!   background loops. Build one with [`CoordinatorBuilder`].
//!
//! # Feature Flags
//!
//! - `postgres` - PostgreSQL key-value backend via sqlx
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use baton::*;
//!
//! let coordinator = CoordinatorBuilder::new(CoordinatorConfig::default())
//!     .with_executor(Arc::new(MyExecutor))
//!     .build()?;
//! coordinator.start().await?;
//!
//! coordinator.register_node(NodeRegistration::new("gpu-1", 4)).await?;
//! let id = coordinator
//!     .submit(JobSubmission::new(JobPayload::new("s3://in/a.mov").with_preset("h264_720p")))
//!     .await?;
//! ```

/// Content analysis hints applied at submission.
pub mod analyzer;

/// Pool sizing under queue pressure.
pub mod autoscaler;

/// Node ranking by load, capability match and success history.
pub mod balancer;

/// Configuration structures for every coordinator component.
pub mod config;

/// Dependency graph validation, promotion and failure cascade.
pub mod dependency;

/// Claiming, running and settling job attempts.
pub mod dispatcher;

/// Error type shared by all coordinator operations.
pub mod error;

/// Job lifecycle events and the in-process event bus.
pub mod events;

/// Contract for the component that performs the media work.
pub mod executor;

/// Job identifiers, payloads, records and the state machine.
pub mod job;

/// Submission throttling.
pub mod limiter;

#[cfg(feature = "metrics")]
/// Prometheus metrics, enabled by the `metrics` feature.
pub mod metrics;

/// Node identifiers, capabilities and records.
pub mod node;

/// Key-value backends with compare-and-set.
pub mod persistence;

/// Contract for adding and removing worker capacity.
pub mod provisioner;

/// Queue and cluster snapshots.
pub mod queue;

/// Node registration, heartbeats and health sweeps.
pub mod registry;

/// Backoff and attempt accounting.
pub mod retry;

/// Coordinator façade, builder and background loops.
pub mod runtime;

/// Eligible-job ordering.
pub mod scheduler;

/// Persistent job records.
pub mod store;

/// Tracing spans and metric helpers.
pub mod telemetry;

pub use analyzer::*;
pub use autoscaler::*;
pub use balancer::*;
pub use config::*;
pub use dependency::*;
pub use dispatcher::*;
pub use error::{BatonError, Result};
pub use events::*;
pub use executor::*;
pub use job::*;
pub use limiter::*;
pub use node::*;
pub use persistence::{
    CasOutcome, InMemoryKvStore, JsonFileKvStore, KeyValueStore, Versioned,
};
#[cfg(feature = "postgres")]
pub use persistence::PostgresKvStore;
pub use provisioner::*;
pub use queue::*;
pub use registry::*;
pub use retry::*;
pub use runtime::{CancelSignal, Coordinator, CoordinatorBuilder};
pub use scheduler::*;
pub use store::*;
