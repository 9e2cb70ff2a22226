use std::collections::BTreeSet;
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(
    Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HardwareAccel {
    Nvenc,
    QuickSync,
    Vaapi,
    VideoToolbox,
    Amf,
}

/// What a job needs from the node it runs on.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequirements {
    #[serde(default)]
    pub min_bitrate_kbps: Option<u32>,
    #[serde(default)]
    pub hardware_acceleration: BTreeSet<HardwareAccel>,
    #[serde(default)]
    pub format: Option<String>,
}

impl JobRequirements {
    pub fn with_min_bitrate(mut self, kbps: u32) -> Self {
        self.min_bitrate_kbps = Some(kbps);
        self
    }

    pub fn with_acceleration(mut self, accel: HardwareAccel) -> Self {
        self.hardware_acceleration.insert(accel);
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }
}

/// What a node offers. An empty `formats` set accepts any format.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    pub max_bitrate_kbps: u32,
    #[serde(default)]
    pub hardware_acceleration: BTreeSet<HardwareAccel>,
    #[serde(default)]
    pub formats: BTreeSet<String>,
}

impl NodeCapabilities {
    pub fn new(max_bitrate_kbps: u32) -> Self {
        Self {
            max_bitrate_kbps,
            ..Default::default()
        }
    }

    pub fn with_acceleration(mut self, accel: HardwareAccel) -> Self {
        self.hardware_acceleration.insert(accel);
        self
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.formats.insert(format.into());
        self
    }

    pub fn satisfies(&self, requirements: &JobRequirements) -> bool {
        let bitrate_ok = requirements
            .min_bitrate_kbps
            .is_none_or(|min| self.max_bitrate_kbps >= min);
        let accel_ok = requirements
            .hardware_acceleration
            .is_subset(&self.hardware_acceleration);
        let format_ok = match &requirements.format {
            Some(format) => {
                self.formats.is_empty() || self.formats.contains(format)
            }
            None => true,
        };
        bitrate_ok && accel_ok && format_ok
    }

    /// How tightly the node fits the requirements, in `[0, 1]`.
    ///
    /// 1.0 means an exact match; a node offering much more than asked for
    /// scores lower so specialised hardware stays free for jobs needing it.
    pub fn match_quality(&self, requirements: &JobRequirements) -> f64 {
        if !self.satisfies(requirements) {
            return 0.0;
        }
        let wanted = requirements.hardware_acceleration.len() as f64;
        let offered = self.hardware_acceleration.len() as f64;
        let accel_fit = (wanted + 1.0) / (offered + 1.0);

        let bitrate_fit = match requirements.min_bitrate_kbps {
            Some(min) if self.max_bitrate_kbps > 0 => {
                f64::from(min) / f64::from(self.max_bitrate_kbps)
            }
            _ => 1.0,
        };

        0.7 * accel_fit + 0.3 * bitrate_fit
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Draining,
    Unreachable,
    Retired,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Active => "active",
            NodeStatus::Draining => "draining",
            NodeStatus::Unreachable => "unreachable",
            NodeStatus::Retired => "retired",
        }
    }

    pub fn accepts_work(&self) -> bool {
        matches!(self, NodeStatus::Active)
    }

    /// Jobs on a node in this status can no longer complete.
    pub fn is_lost(&self) -> bool {
        matches!(self, NodeStatus::Unreachable | NodeStatus::Retired)
    }
}

impl Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Load as reported by the node itself in a heartbeat.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub running_jobs: u32,
    pub cpu_utilization: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub id: NodeId,
    pub capabilities: NodeCapabilities,
    pub capacity: u32,
}

impl NodeRegistration {
    pub fn new(id: impl Into<NodeId>, capacity: u32) -> Self {
        Self {
            id: id.into(),
            capabilities: NodeCapabilities::default(),
            capacity,
        }
    }

    pub fn with_capabilities(mut self, capabilities: NodeCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub capabilities: NodeCapabilities,
    pub status: NodeStatus,
    /// Owned by the dispatcher; counts jobs ASSIGNED or RUNNING here.
    pub active_job_count: u32,
    pub capacity: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub last_report: Option<LoadSnapshot>,
}

impl NodeRecord {
    pub fn from_registration(
        registration: NodeRegistration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: registration.id,
            capabilities: registration.capabilities,
            status: NodeStatus::Active,
            active_job_count: 0,
            capacity: registration.capacity,
            last_heartbeat: now,
            registered_at: now,
            last_report: None,
        }
    }

    pub fn has_free_slot(&self) -> bool {
        self.active_job_count < self.capacity
    }

    pub fn free_slots(&self) -> u32 {
        self.capacity.saturating_sub(self.active_job_count)
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 1.0;
        }
        f64::from(self.active_job_count) / f64::from(self.capacity)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now - self.last_heartbeat > timeout
    }
}
