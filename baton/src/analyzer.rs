use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{JobPriority, JobSubmission};

/// Output of content analysis, used only as a scheduling hint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentProfile {
    pub content_type: String,
    pub confidence: f64,
    #[serde(default)]
    pub recommended_parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub priority_hint: Option<JobPriority>,
}

/// Trait for inspecting input media before a job is queued.
#[async_trait]
pub trait ContentAnalyzer: Send + Sync {
    async fn analyze(&self, input_ref: &str) -> anyhow::Result<ContentProfile>;
}

/// Folds a profile into a submission.
///
/// Recommended parameters fill gaps but never override parameters the
/// caller set, and the priority hint can only raise the priority.
pub fn enrich(submission: &mut JobSubmission, profile: ContentProfile) {
    for (key, value) in &profile.recommended_parameters {
        submission
            .payload
            .parameters
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
    if let Some(hint) = profile.priority_hint {
        submission.priority = submission.priority.max(hint);
    }
    submission.payload.content_profile = Some(profile);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobPayload;
    use serde_json::json;

    fn profile(hint: Option<JobPriority>) -> ContentProfile {
        ContentProfile {
            content_type: "animation".into(),
            confidence: 0.92,
            recommended_parameters: BTreeMap::from([
                ("crf".to_string(), json!(20)),
                ("tune".to_string(), json!("animation")),
            ]),
            priority_hint: hint,
        }
    }

    #[test]
    fn test_enrich_keeps_explicit_parameters() {
        let mut submission = JobSubmission::new(
            JobPayload::new("cartoon.mov").with_parameter("crf", 28),
        );
        enrich(&mut submission, profile(None));

        let params = &submission.payload.parameters;
        assert_eq!(params["crf"], json!(28));
        assert_eq!(params["tune"], json!("animation"));
        assert_eq!(
            submission
                .payload
                .content_profile
                .as_ref()
                .map(|p| p.content_type.as_str()),
            Some("animation")
        );
    }

    #[test]
    fn test_priority_hint_only_raises() {
        let mut low = JobSubmission::new(JobPayload::new("a.mov"))
            .with_priority(JobPriority::Low);
        enrich(&mut low, profile(Some(JobPriority::High)));
        assert_eq!(low.priority, JobPriority::High);

        let mut critical = JobSubmission::new(JobPayload::new("b.mov"))
            .with_priority(JobPriority::Critical);
        enrich(&mut critical, profile(Some(JobPriority::Low)));
        assert_eq!(critical.priority, JobPriority::Critical);
    }
}
