// ── Device records ──
//
// One record per physical device, keyed by MAC in the registry file.
// Unknown fields survive load/save cycles via the flattened `extra`
// map so older or hand-edited registries are never silently stripped.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Highest pipeline stage a device has completed (0 = untouched).
pub const MAX_STAGE: u8 = 4;

/// Persistent state for one provisioned device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Marketing model as reported by the device (`S3SW-001P8EU`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Hardware app identifier (`Mini1PMG3`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hw_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub friendly_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Free-form operator note, carried verbatim across saves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remarks: Option<String>,
    /// 0 (untouched) through 4 (fully provisioned).
    #[serde(default)]
    pub stage_completed: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage3: Option<Stage3Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage4: Option<Stage4Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl DeviceRecord {
    /// Record a successful stage run. Stage progress never moves
    /// backwards through the pipeline; only an explicit registry
    /// removal resets a device.
    pub fn advance_stage(&mut self, stage: u8) {
        self.stage_completed = self.stage_completed.max(stage.min(MAX_STAGE));
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen = Some(now);
    }
}

/// Outcome of the latest firmware/naming pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage3Status {
    #[serde(default)]
    pub ota_status: String,
    #[serde(default)]
    pub friendly_status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
}

/// Outcome of the latest profile application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage4Status {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_applied: Option<String>,
    #[serde(default)]
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
}
