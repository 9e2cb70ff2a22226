use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use baton::*;
use parking_lot::Mutex;
use serde_json::Value;

/// One scripted executor behaviour.
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    Succeed,
    Fail { message: String, retryable: bool },
    /// Return `Err`, which the coordinator treats as retryable.
    Error(String),
    /// Report each fraction, then succeed.
    Progress(Vec<f64>),
    /// Block until aborted, then report a retryable failure.
    Hang,
    /// Panic inside the executor.
    Panic(String),
}

impl Step {
    pub fn retryable(message: impl Into<String>) -> Self {
        Step::Fail {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Step::Fail {
            message: message.into(),
            retryable: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExecutionRecord {
    pub job_id: JobId,
    pub node_id: NodeId,
    pub attempt: u32,
    pub dispatch_seq: u64,
    pub aborted: bool,
}

/// Scripted [`ProcessingExecutor`] that records every call.
///
/// Steps scripted for a specific job take precedence over the shared
/// script; when both are empty the default step runs.
#[derive(Clone)]
pub struct MockExecutor {
    calls: Arc<Mutex<Vec<ExecutionRecord>>>,
    per_job: Arc<Mutex<HashMap<JobId, VecDeque<Step>>>>,
    shared: Arc<Mutex<VecDeque<Step>>>,
    default: Arc<Mutex<Step>>,
    delay: Arc<Mutex<Duration>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::with_default(Step::Succeed)
    }

    pub fn with_default(step: Step) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            per_job: Arc::new(Mutex::new(HashMap::new())),
            shared: Arc::new(Mutex::new(VecDeque::new())),
            default: Arc::new(Mutex::new(step)),
            delay: Arc::new(Mutex::new(Duration::ZERO)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every call sleeps this long before acting out its step.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = delay;
        self
    }

    pub fn set_default(&self, step: Step) {
        *self.default.lock() = step;
    }

    pub fn push_step(&self, step: Step) {
        self.shared.lock().push_back(step);
    }

    pub fn script_job(&self, job_id: JobId, steps: impl IntoIterator<Item = Step>) {
        self.per_job
            .lock()
            .entry(job_id)
            .or_default()
            .extend(steps);
    }

    pub fn calls(&self) -> Vec<ExecutionRecord> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, job_id: JobId) -> Vec<ExecutionRecord> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Highest number of concurrent `execute` calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn assert_call_count_eq(&self, expected: usize) {
        let actual = self.call_count();
        assert_eq!(
            actual, expected,
            "Expected {} executor calls, got {}",
            expected, actual
        );
    }

    /// Polls until at least `count` calls were made. Returns `false` on
    /// timeout.
    pub async fn wait_for_calls(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while self.call_count() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .is_ok()
    }

    fn next_step(&self, job_id: JobId) -> Step {
        if let Some(step) = self
            .per_job
            .lock()
            .get_mut(&job_id)
            .and_then(VecDeque::pop_front)
        {
            return step;
        }
        if let Some(step) = self.shared.lock().pop_front() {
            return step;
        }
        self.default.lock().clone()
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProcessingExecutor for MockExecutor {
    async fn execute(
        &self,
        task: ExecutionTask,
        progress: ProgressReporter,
        abort: CancelSignal,
    ) -> anyhow::Result<ExecutionOutcome> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(self.in_flight.clone());

        let index = {
            let mut calls = self.calls.lock();
            calls.push(ExecutionRecord {
                job_id: task.job_id,
                node_id: task.node.id.clone(),
                attempt: task.attempt,
                dispatch_seq: task.dispatch_seq,
                aborted: false,
            });
            calls.len() - 1
        };
        let step = self.next_step(task.job_id);

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = abort.cancelled() => {}
            }
        }

        let outcome = match step {
            Step::Succeed => Ok(ExecutionOutcome::Succeeded),
            Step::Fail { message, retryable } => {
                Ok(ExecutionOutcome::Failed { message, retryable })
            }
            Step::Error(message) => Err(anyhow::anyhow!(message)),
            Step::Progress(fractions) => {
                for fraction in fractions {
                    progress.report(fraction);
                    tokio::task::yield_now().await;
                }
                Ok(ExecutionOutcome::Succeeded)
            }
            Step::Hang => {
                abort.cancelled().await;
                Ok(ExecutionOutcome::retryable("aborted"))
            }
            Step::Panic(message) => panic!("{message}"),
        };
        if abort.is_cancelled()
            && let Some(call) = self.calls.lock().get_mut(index)
        {
            call.aborted = true;
        }
        outcome
    }
}

/// [`NodeProvisioner`] that hands out `auto-N` ids and records retirements.
#[derive(Clone, Default)]
pub struct MockProvisioner {
    provisioned: Arc<Mutex<Vec<NodeId>>>,
    retired: Arc<Mutex<Vec<NodeId>>>,
    fail: Arc<Mutex<bool>>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn provisioned(&self) -> Vec<NodeId> {
        self.provisioned.lock().clone()
    }

    pub fn retired(&self) -> Vec<NodeId> {
        self.retired.lock().clone()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock() = fail;
    }
}

#[async_trait]
impl NodeProvisioner for MockProvisioner {
    async fn provision(&self) -> anyhow::Result<NodeId> {
        if *self.fail.lock() {
            anyhow::bail!("provisioning unavailable");
        }
        let mut provisioned = self.provisioned.lock();
        let id = NodeId::new(format!("auto-{}", provisioned.len()));
        provisioned.push(id.clone());
        Ok(id)
    }

    async fn retire(&self, node_id: &NodeId) -> anyhow::Result<()> {
        self.retired.lock().push(node_id.clone());
        Ok(())
    }
}

/// [`ContentAnalyzer`] returning a fixed profile, or failing.
#[derive(Clone)]
pub struct StaticAnalyzer {
    profile: Option<ContentProfile>,
    calls: Arc<AtomicUsize>,
}

impl StaticAnalyzer {
    pub fn new(profile: ContentProfile) -> Self {
        Self {
            profile: Some(profile),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            profile: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContentAnalyzer for StaticAnalyzer {
    async fn analyze(&self, input_ref: &str) -> anyhow::Result<ContentProfile> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.profile
            .clone()
            .ok_or_else(|| anyhow::anyhow!("cannot analyze {input_ref}"))
    }
}

type WriteMatcher = Box<dyn Fn(&str, &Value) -> bool + Send + Sync>;

struct WriteFault {
    remaining: usize,
    matches: WriteMatcher,
}

/// [`KeyValueStore`] wrapper that fails chosen compare-and-set calls with a
/// backend error, leaving the stored data untouched.
#[derive(Clone)]
pub struct FaultyKvStore {
    inner: Arc<dyn KeyValueStore>,
    faults: Arc<Mutex<Vec<WriteFault>>>,
    injected: Arc<AtomicUsize>,
}

impl FaultyKvStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner,
            faults: Arc::new(Mutex::new(Vec::new())),
            injected: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fails the next `times` writes whose key and new value satisfy
    /// `matches`.
    pub fn fail_writes(
        &self,
        times: usize,
        matches: impl Fn(&str, &Value) -> bool + Send + Sync + 'static,
    ) {
        self.faults.lock().push(WriteFault {
            remaining: times,
            matches: Box::new(matches),
        });
    }

    /// Writes that would move a job into `state`.
    pub fn job_entering(state: JobState) -> impl Fn(&str, &Value) -> bool + Send + Sync {
        let expected = serde_json::to_value(state).unwrap_or(Value::Null);
        move |key: &str, value: &Value| key.starts_with("job/") && value["state"] == expected
    }

    /// Writes that leave node `id` with no active job.
    pub fn node_emptied(id: &str) -> impl Fn(&str, &Value) -> bool + Send + Sync {
        let key_wanted = format!("node/{id}");
        move |key: &str, value: &Value| key == key_wanted && value["active_job_count"] == 0
    }

    /// Number of writes failed so far.
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn take_fault(&self, key: &str, value: &Value) -> bool {
        let mut faults = self.faults.lock();
        let hit = faults
            .iter_mut()
            .find(|fault| fault.remaining > 0 && (fault.matches)(key, value));
        match hit {
            Some(fault) => {
                fault.remaining -= 1;
                self.injected.fetch_add(1, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl KeyValueStore for FaultyKvStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Versioned>> {
        self.inner.get(key).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: Value,
    ) -> anyhow::Result<CasOutcome> {
        if self.take_fault(key, &value) {
            anyhow::bail!("injected write failure on {key}");
        }
        self.inner.compare_and_set(key, expected_version, value).await
    }

    async fn delete(&self, key: &str, expected_version: u64) -> anyhow::Result<bool> {
        self.inner.delete(key, expected_version).await
    }

    async fn scan_prefix(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<Vec<(String, Versioned)>> {
        self.inner.scan_prefix(prefix, start_after, limit).await
    }
}
