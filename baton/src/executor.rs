//! Processing Executor contract.
//!
//! The executor performs the actual media work on an assigned node. The
//! coordinator only sees its final outcome and a best-effort stream of
//! progress fractions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::job::{JobId, JobPayload};
use crate::node::NodeRecord;
use crate::runtime::CancelSignal;

/// Everything an executor needs to run one attempt of a job.
#[derive(Clone, Debug)]
pub struct ExecutionTask {
    pub job_id: JobId,
    /// Identifies this dispatch; results from older dispatches are dropped.
    pub dispatch_seq: u64,
    /// 1-based attempt number.
    pub attempt: u32,
    pub payload: JobPayload,
    pub node: NodeRecord,
    pub deadline: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Succeeded,
    Failed { message: String, retryable: bool },
}

impl ExecutionOutcome {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Sending half of a job's progress stream.
///
/// Reports never block; when the coordinator falls behind, intermediate
/// values are dropped and only later ones arrive.
#[derive(Clone, Debug)]
pub struct ProgressReporter {
    tx: mpsc::Sender<f64>,
}

impl ProgressReporter {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<f64>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Reports completion as a fraction; clamped to `[0, 1]`.
    pub fn report(&self, fraction: f64) {
        if !fraction.is_finite() {
            return;
        }
        let _ = self.tx.try_send(fraction.clamp(0.0, 1.0));
    }
}

/// Trait for running jobs on worker nodes.
#[async_trait]
pub trait ProcessingExecutor: Send + Sync {
    /// Run one attempt of a job.
    ///
    /// `abort` is signalled when the job is cancelled, its node is lost or
    /// its deadline passes. Honouring it is cooperative. An `Err` is
    /// treated as a retryable failure.
    async fn execute(
        &self,
        task: ExecutionTask,
        progress: ProgressReporter,
        abort: CancelSignal,
    ) -> anyhow::Result<ExecutionOutcome>;
}
