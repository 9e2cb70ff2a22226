//! Property tests for the job state machine, retry backoff and dispatch
//! order.

use baton::*;
use chrono::{Duration, Utc};
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
    Assign(u8),
    Start,
    Progress(f64),
    Succeed,
    Fail { retryable: bool },
    Deadline,
    Requeue,
    PromoteRetry,
    Cancel,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..3).prop_map(Op::Assign),
        Just(Op::Start),
        (-0.5f64..1.5).prop_map(Op::Progress),
        Just(Op::Succeed),
        any::<bool>().prop_map(|retryable| Op::Fail { retryable }),
        Just(Op::Deadline),
        Just(Op::Requeue),
        Just(Op::PromoteRetry),
        Just(Op::Cancel),
    ]
}

fn apply(record: &mut JobRecord, op: &Op, policy: &RetryPolicy) -> Result<()> {
    let now = Utc::now();
    match op {
        Op::Assign(n) => record.assign(NodeId::new(format!("n{n}")), now).map(|_| ()),
        Op::Start => record.start(now),
        Op::Progress(p) => record.set_progress(*p, now),
        Op::Succeed => record.succeed(now),
        Op::Fail { retryable } => {
            let decision = policy.decide(
                record.attempt_count + 1,
                record.max_attempts,
                *retryable,
                now,
            );
            let error = JobError::new(JobErrorKind::ExecutorFailure, "boom", now)
                .retryable(*retryable);
            record.record_failure(error, decision.retry_at(), now)
        }
        Op::Deadline => record.fail_terminal(
            JobError::new(JobErrorKind::DeadlineExceeded, "late", now),
            now,
        ),
        Op::Requeue => record.requeue(now),
        Op::PromoteRetry => record.promote_retry(now),
        Op::Cancel => record.cancel(JobError::new(JobErrorKind::Cancelled, "user", now), now),
    }
}

fn eligible_job(max_attempts: u32) -> JobRecord {
    let now = Utc::now();
    let submission = JobSubmission::new(JobPayload::new("prop.mov"));
    let mut record = JobRecord::new(JobId::new(), submission, max_attempts, 600, 0, now);
    record.mark_eligible(now).unwrap();
    record
}

proptest! {
    #[test]
    fn job_record_invariants_hold(
        max_attempts in 1u32..5,
        ops in prop::collection::vec(op(), 1..60),
    ) {
        let policy = RetryPolicy::new(RetryConfig::default());
        let mut record = eligible_job(max_attempts);

        for op in &ops {
            let before = record.clone();
            let result = apply(&mut record, op, &policy);

            match result {
                Err(_) => prop_assert_eq!(&record, &before, "rejected {:?} mutated the record", op),
                Ok(()) => {
                    prop_assert!(!before.is_terminal(), "terminal job accepted {:?}", op);
                    prop_assert!(record.event_seq > before.event_seq);
                    if record.state != before.state {
                        prop_assert!(before.state.can_transition_to(record.state));
                    }
                    if matches!(op, Op::Assign(_)) {
                        prop_assert_eq!(record.dispatch_seq, before.dispatch_seq + 1);
                    } else {
                        prop_assert_eq!(record.dispatch_seq, before.dispatch_seq);
                    }
                    if matches!(op, Op::Requeue) {
                        prop_assert_eq!(record.attempt_count, before.attempt_count);
                        prop_assert_eq!(record.state, JobState::Eligible);
                    }
                }
            }

            prop_assert!(record.attempt_count <= record.max_attempts);
            prop_assert!((0.0..=1.0).contains(&record.progress));
            prop_assert_eq!(record.assigned_node.is_some(), record.state.is_active());
            prop_assert_eq!(record.retry_at.is_some(), record.awaiting_retry());
            if record.is_terminal() {
                prop_assert!(record.completed_at.is_some());
            }
        }
    }

    #[test]
    fn backoff_is_monotonic_and_capped(
        base in 1u64..10_000,
        cap in 1u64..600_000,
        attempts in 1u32..80,
    ) {
        let config = RetryConfig {
            base_delay_ms: base,
            max_backoff_ms: cap,
            ..RetryConfig::default()
        };
        let current = compute_backoff(attempts, &config);
        let next = compute_backoff(attempts + 1, &config);
        prop_assert!(current <= next);
        prop_assert!(next <= Duration::milliseconds(cap as i64));
        prop_assert_eq!(
            compute_backoff(1, &config),
            Duration::milliseconds(base.min(cap) as i64)
        );
    }

    #[test]
    fn dispatch_order_puts_higher_priority_first(
        jobs in prop::collection::vec((0usize..4, 0i64..1_000), 2..40),
    ) {
        let base = Utc::now();
        let priorities = [
            JobPriority::Low,
            JobPriority::Normal,
            JobPriority::High,
            JobPriority::Critical,
        ];
        let mut records: Vec<JobRecord> = jobs
            .iter()
            .enumerate()
            .map(|(seq, (p, offset))| {
                let submission = JobSubmission::new(JobPayload::new("order.mov"))
                    .with_priority(priorities[*p]);
                let created = base + Duration::milliseconds(*offset);
                JobRecord::new(JobId::new(), submission, 3, 600, seq as u64, created)
            })
            .collect();
        records.sort_by(dispatch_order);

        for pair in records.windows(2) {
            prop_assert!(pair[0].priority >= pair[1].priority);
            if pair[0].priority == pair[1].priority {
                prop_assert!(pair[0].created_at <= pair[1].created_at);
                if pair[0].created_at == pair[1].created_at {
                    prop_assert!(pair[0].submit_seq < pair[1].submit_seq);
                }
            }
        }
    }
}
