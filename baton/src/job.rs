use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::analyzer::ContentProfile;
use crate::error::{BatonError, Result};
use crate::node::{JobRequirements, NodeId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling priority. Variants are declared low to high so the derived
/// `Ord` ranks `Critical` above everything else.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl JobPriority {
    pub const ALL: [JobPriority; 4] = [
        JobPriority::Critical,
        JobPriority::High,
        JobPriority::Normal,
        JobPriority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Low => "low",
            JobPriority::Normal => "normal",
            JobPriority::High => "high",
            JobPriority::Critical => "critical",
        }
    }
}

impl Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Eligible,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Pending,
        JobState::Eligible,
        JobState::Assigned,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Eligible => "eligible",
            JobState::Assigned => "assigned",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// States that hold a node slot.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Assigned | JobState::Running)
    }

    /// Edges of the job state machine.
    ///
    /// `Failed -> Eligible` and `Failed -> Cancelled` are only legal while a
    /// retry is pending; `JobRecord` enforces that part.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Eligible)
                | (Pending, Cancelled)
                | (Eligible, Assigned)
                | (Eligible, Failed)
                | (Eligible, Cancelled)
                | (Assigned, Running)
                | (Assigned, Eligible)
                | (Assigned, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Eligible)
                | (Running, Cancelled)
                | (Failed, Eligible)
                | (Failed, Cancelled)
        )
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    ExecutorFailure,
    DependencyFailed,
    DeadlineExceeded,
    Cancelled,
    NodeUnreachable,
}

/// Structured failure description stored on the job record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: JobErrorKind,
    pub message: String,
    pub retryable: bool,
    pub node_id: Option<NodeId>,
    pub attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

impl JobError {
    pub fn new(
        kind: JobErrorKind,
        message: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
            node_id: None,
            attempt: 0,
            occurred_at,
        }
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn on_node(mut self, node_id: Option<NodeId>) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn at_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

impl Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Opaque work descriptor handed verbatim to the processing executor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub input_ref: String,
    #[serde(default)]
    pub output_ref: Option<String>,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub requirements: JobRequirements,
    #[serde(default)]
    pub content_profile: Option<ContentProfile>,
}

impl JobPayload {
    pub fn new(input_ref: impl Into<String>) -> Self {
        Self {
            input_ref: input_ref.into(),
            ..Default::default()
        }
    }

    pub fn with_output(mut self, output_ref: impl Into<String>) -> Self {
        self.output_ref = Some(output_ref.into());
        self
    }

    pub fn with_preset(mut self, preset: impl Into<String>) -> Self {
        self.preset = Some(preset.into());
        self
    }

    pub fn with_parameter(
        mut self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_requirements(mut self, requirements: JobRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Groups "similar" jobs for per-node success tracking.
    pub fn job_class(&self) -> &str {
        self.preset.as_deref().unwrap_or("default")
    }
}

/// A request to create a job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSubmission {
    /// Caller-chosen id, needed when later batch members depend on it.
    pub id: Option<JobId>,
    pub payload: JobPayload,
    pub priority: JobPriority,
    pub dependencies: Vec<JobId>,
    pub max_attempts: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub correlation_id: Option<Uuid>,
}

impl JobSubmission {
    pub fn new(payload: JobPayload) -> Self {
        Self {
            id: None,
            payload,
            priority: JobPriority::Normal,
            dependencies: Vec::new(),
            max_attempts: None,
            timeout_secs: None,
            correlation_id: None,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, dependency: JobId) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
}

/// Authoritative job state, persisted in the job store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub priority: JobPriority,
    pub state: JobState,
    pub dependencies: BTreeSet<JobId>,
    /// Reverse edges, maintained by the dependency tracker.
    pub dependents: BTreeSet<JobId>,
    pub payload: JobPayload,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub timeout_secs: u64,
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Tiebreaker for jobs created within the same clock tick.
    pub submit_seq: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_node: Option<NodeId>,
    pub progress: f64,
    pub error: Option<JobError>,
    /// Set while a failed job waits out its backoff.
    pub retry_at: Option<DateTime<Utc>>,
    pub dispatch_seq: u64,
    pub event_seq: u64,
    pub correlation_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(
        id: JobId,
        submission: JobSubmission,
        max_attempts: u32,
        timeout_secs: u64,
        submit_seq: u64,
        now: DateTime<Utc>,
    ) -> Self {
        let deadline = i64::try_from(timeout_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|timeout| now.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            id,
            priority: submission.priority,
            state: JobState::Pending,
            dependencies: submission.dependencies.into_iter().collect(),
            dependents: BTreeSet::new(),
            payload: submission.payload,
            attempt_count: 0,
            max_attempts,
            timeout_secs,
            deadline,
            created_at: now,
            submit_seq,
            started_at: None,
            completed_at: None,
            assigned_node: None,
            progress: 0.0,
            error: None,
            retry_at: None,
            dispatch_seq: 0,
            event_seq: 0,
            correlation_id: submission.correlation_id.unwrap_or_else(Uuid::now_v7),
            updated_at: now,
        }
    }

    /// Terminal jobs never change state again. A failed job with a pending
    /// retry is not terminal.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            JobState::Succeeded | JobState::Cancelled => true,
            JobState::Failed => self.retry_at.is_none(),
            _ => false,
        }
    }

    pub fn awaiting_retry(&self) -> bool {
        self.state == JobState::Failed && self.retry_at.is_some()
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.event_seq += 1;
        self.updated_at = now;
    }

    fn transition(&mut self, next: JobState, now: DateTime<Utc>) -> Result<()> {
        let retry_gate = self.state == JobState::Failed && !self.awaiting_retry();
        if retry_gate || !self.state.can_transition_to(next) {
            return Err(BatonError::conflict(
                format!("job/{}", self.id),
                format!("illegal transition {} -> {}", self.state, next),
            ));
        }
        self.state = next;
        self.touch(now);
        Ok(())
    }

    pub fn mark_eligible(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.state != JobState::Pending {
            return Err(BatonError::conflict(
                format!("job/{}", self.id),
                format!("expected pending, found {}", self.state),
            ));
        }
        self.transition(JobState::Eligible, now)
    }

    /// Claims the job for `node`. Returns the new dispatch sequence number.
    pub fn assign(&mut self, node: NodeId, now: DateTime<Utc>) -> Result<u64> {
        self.transition(JobState::Assigned, now)?;
        self.assigned_node = Some(node);
        self.progress = 0.0;
        self.dispatch_seq += 1;
        Ok(self.dispatch_seq)
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Running, now)?;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        Ok(())
    }

    pub fn set_progress(&mut self, progress: f64, now: DateTime<Utc>) -> Result<()> {
        if self.state != JobState::Running {
            return Err(BatonError::conflict(
                format!("job/{}", self.id),
                format!("progress reported while {}", self.state),
            ));
        }
        if !progress.is_finite() {
            return Err(BatonError::InvalidSubmission(format!(
                "progress must be finite, got {progress}"
            )));
        }
        self.progress = progress.clamp(0.0, 1.0);
        self.touch(now);
        Ok(())
    }

    pub fn succeed(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Succeeded, now)?;
        self.assigned_node = None;
        self.progress = 1.0;
        self.error = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Records a failed executor attempt. `retry_at` is `Some` when the
    /// retry policy grants another attempt.
    pub fn record_failure(
        &mut self,
        error: JobError,
        retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.state != JobState::Running {
            return Err(BatonError::conflict(
                format!("job/{}", self.id),
                format!("failure reported while {}", self.state),
            ));
        }
        self.transition(JobState::Failed, now)?;
        self.attempt_count += 1;
        self.assigned_node = None;
        self.error = Some(error.at_attempt(self.attempt_count));
        self.retry_at = retry_at;
        if retry_at.is_none() {
            self.completed_at = Some(now);
        }
        Ok(())
    }

    /// Fails the job for good without consuming an attempt (deadline).
    pub fn fail_terminal(&mut self, error: JobError, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Failed, now)?;
        self.assigned_node = None;
        self.error = Some(error.at_attempt(self.attempt_count));
        self.retry_at = None;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Returns an in-flight job to the queue. The attempt is not counted.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.state.is_active() {
            return Err(BatonError::conflict(
                format!("job/{}", self.id),
                format!("cannot requeue a {} job", self.state),
            ));
        }
        self.transition(JobState::Eligible, now)?;
        self.assigned_node = None;
        self.progress = 0.0;
        Ok(())
    }

    pub fn promote_retry(&mut self, now: DateTime<Utc>) -> Result<()> {
        if !self.awaiting_retry() {
            return Err(BatonError::conflict(
                format!("job/{}", self.id),
                "no retry pending",
            ));
        }
        self.transition(JobState::Eligible, now)?;
        self.retry_at = None;
        self.progress = 0.0;
        Ok(())
    }

    pub fn cancel(&mut self, error: JobError, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Cancelled, now)?;
        self.assigned_node = None;
        self.retry_at = None;
        self.error = Some(error.at_attempt(self.attempt_count));
        self.completed_at = Some(now);
        Ok(())
    }
}

/// Read-only status view handed to API callers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub state: JobState,
    pub priority: JobPriority,
    pub progress: f64,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub assigned_node: Option<NodeId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
    pub error: Option<JobError>,
}

impl From<&JobRecord> for JobStatusView {
    fn from(record: &JobRecord) -> Self {
        Self {
            id: record.id,
            state: record.state,
            priority: record.priority,
            progress: record.progress,
            attempt_count: record.attempt_count,
            max_attempts: record.max_attempts,
            assigned_node: record.assigned_node.clone(),
            created_at: record.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            retry_at: record.retry_at,
            error: record.error.clone(),
        }
    }
}

/// Predicate for job listings. Empty fields match everything.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub states: BTreeSet<JobState>,
    pub priority: Option<JobPriority>,
    pub node: Option<NodeId>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_state(state: JobState) -> Self {
        Self::default().with_state(state)
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.states.insert(state);
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn on_node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        if !self.states.is_empty() && !self.states.contains(&record.state) {
            return false;
        }
        if let Some(priority) = self.priority
            && record.priority != priority
        {
            return false;
        }
        match &self.node {
            Some(node) => record.assigned_node.as_ref() == Some(node),
            None => true,
        }
    }
}
