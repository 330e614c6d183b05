// Typed views of the RPC payloads the pipeline reads.
//
// Only the fields the stages act on are typed; everything else rides
// along in `extra` so snapshots keep the full device answer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `Shelly.GetDeviceInfo` result.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceInfo {
    pub id: String,
    pub mac: String,
    pub model: String,
    #[serde(rename = "gen")]
    pub generation: u8,
    #[serde(default)]
    pub fw_id: Option<String>,
    /// Firmware version string, e.g. `1.4.4`.
    #[serde(default)]
    pub ver: Option<String>,
    #[serde(default)]
    pub app: Option<String>,
    #[serde(default)]
    pub auth_en: bool,
    /// Active device profile on multi-profile models (`switch`, `cover`).
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `Sys.GetConfig` result, reduced to the parts the pipeline touches.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SysConfig {
    #[serde(default)]
    pub device: SysDeviceConfig,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SysDeviceConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub fw_id: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `Wifi.GetConfig` result.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WifiConfig {
    #[serde(default)]
    pub sta: Option<StaConfig>,
    #[serde(default)]
    pub sta1: Option<StaConfig>,
    #[serde(default)]
    pub ap: Option<ApConfig>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Station (client) WiFi configuration.
///
/// When switching to static addressing, the device expects the full
/// set (`ip`, `gw`, `netmask`, `nameserver`) in a single `SetConfig`
/// alongside the credentials. Partial static payloads are rejected or,
/// worse, half-applied by some firmwares.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StaConfig {
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(default)]
    pub enable: bool,
    /// `dhcp` or `static`.
    #[serde(default)]
    pub ipv4mode: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub gw: Option<String>,
    #[serde(default)]
    pub netmask: Option<String>,
    #[serde(default)]
    pub nameserver: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Access-point side of `Wifi.GetConfig`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ApConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub ssid: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One release channel inside a `Shelly.CheckForUpdate` answer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpdateChannel {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub build_id: Option<String>,
}

impl UpdateChannel {
    /// The version string to report, falling back to the build id.
    pub fn display_version(&self) -> &str {
        self.version
            .as_deref()
            .or(self.build_id.as_deref())
            .unwrap_or("unknown")
    }
}

/// `Shelly.CheckForUpdate` result. An empty object means the device is
/// already on the newest firmware.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UpdateReport {
    #[serde(default)]
    pub stable: Option<UpdateChannel>,
    #[serde(default)]
    pub beta: Option<UpdateChannel>,
    /// Older firmwares report a single flat channel instead of the
    /// stable/beta map.
    #[serde(default)]
    pub has_update: Option<bool>,
    #[serde(default)]
    pub new_version: Option<String>,
}

impl UpdateReport {
    pub fn is_up_to_date(&self) -> bool {
        !self.has_stable() && self.beta.is_none()
    }

    /// A stable update is available for install.
    pub fn has_stable(&self) -> bool {
        self.stable.is_some() || self.has_update == Some(true)
    }

    /// Only a beta build is offered. The pipeline reports these but
    /// never installs them.
    pub fn beta_only(&self) -> bool {
        !self.has_stable() && self.beta.is_some()
    }

    /// The version string the pending stable update would install.
    pub fn stable_version(&self) -> Option<&str> {
        self.stable
            .as_ref()
            .map(UpdateChannel::display_version)
            .or(self.new_version.as_deref())
    }
}

/// One page of `KVS.GetMany`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KvsPage {
    #[serde(default)]
    pub items: BTreeMap<String, Value>,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub total: u64,
}

impl KvsPage {
    /// Whether another page follows this one.
    pub fn has_more(&self) -> bool {
        !self.items.is_empty() && self.offset + (self.items.len() as u64) < self.total
    }
}

/// One entry of `Webhook.List`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookEntry {
    pub id: i64,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `Webhook.List` result.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebhookList {
    #[serde(default)]
    pub hooks: Vec<WebhookEntry>,
    #[serde(default)]
    pub rev: Option<i64>,
}
