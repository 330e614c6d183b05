// ── Stage runtime settings ──
//
// Plain value types handed into each stage invocation. The core never
// reads configuration files itself; the loader crate builds one of
// these per run and the stages treat it as immutable.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::model::MacAddress;
use crate::pool::IpPool;

/// Production network parameters shared by Stage 2 and the scanner.
#[derive(Debug, Clone)]
pub struct NetworkSettings {
    /// Full network in CIDR notation, e.g. `10.20.0.0/24`.
    pub cidr: String,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub nameserver: Ipv4Addr,
    pub pool: IpPool,
    /// Narrower range DHCP hands fresh devices addresses from. When
    /// set, discovery scans only this range.
    pub dhcp_scan: Option<(Ipv4Addr, Ipv4Addr)>,
    /// Skip pool addresses while scanning for unadopted devices.
    pub scan_exclude_pool: bool,
    /// Operator overrides pinning a MAC to a fixed address.
    pub ip_map: BTreeMap<MacAddress, Ipv4Addr>,
}

/// One WiFi credential set pushed to a device station slot.
#[derive(Debug, Clone, Deserialize)]
pub struct WifiProfile {
    pub ssid: String,
    pub password: SecretString,
}

impl WifiProfile {
    /// SSIDs left over from template configs are skipped, never pushed.
    pub fn is_placeholder(&self) -> bool {
        const PLACEHOLDERS: &[&str] = &[
            "",
            "SSID",
            "SSID2",
            "YOUR_SSID",
            "YOUR_BACKUP_SSID",
            "YOUR_WIFI_SSID",
            "BACKUP_SSID",
            "EXAMPLE_SSID",
        ];
        let upper = self.ssid.trim().to_ascii_uppercase();
        PLACEHOLDERS.contains(&upper.as_str())
    }
}

/// Stage 1 behavior switches.
#[derive(Debug, Clone)]
pub struct Stage1Settings {
    /// Address a factory-fresh device gives itself on its own AP.
    pub device_ap_ip: Ipv4Addr,
    /// SSID prefix identifying candidate device APs.
    pub ap_ssid_prefix: String,
    pub wifi_profiles: Vec<WifiProfile>,
    pub disable_cloud: bool,
    pub disable_ble: bool,
    pub disable_ap: bool,
    pub disable_mqtt: bool,
    /// Pause between loop-mode cycles when nothing was found.
    pub idle_delay: Duration,
}

impl Default for Stage1Settings {
    fn default() -> Self {
        Self {
            device_ap_ip: Ipv4Addr::new(192, 168, 33, 1),
            ap_ssid_prefix: "shelly".into(),
            wifi_profiles: Vec::new(),
            disable_cloud: true,
            disable_ble: true,
            disable_ap: true,
            disable_mqtt: false,
            idle_delay: Duration::from_secs(10),
        }
    }
}

/// How hostnames are derived from hardware models.
#[derive(Debug, Clone, Default)]
pub struct HostnameRules {
    /// Model (or app) name to hostname prefix, e.g. `Mini1PMG3` → `sw`.
    pub prefixes: BTreeMap<String, String>,
    pub default_prefix: String,
}

impl HostnameRules {
    /// `<prefix>-<mac-suffix>`, lowercased.
    pub fn derive(&self, model: &str, mac: &MacAddress) -> String {
        let prefix = self
            .prefixes
            .get(model)
            .map_or(self.default_prefix.as_str(), String::as_str);
        let prefix = if prefix.is_empty() { "shelly" } else { prefix };
        format!("{}-{}", prefix, mac.suffix().to_ascii_lowercase())
    }
}

/// Firmware update handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtaMode {
    CheckOnly,
    CheckAndUpdate,
}

#[derive(Debug, Clone)]
pub struct OtaSettings {
    pub enabled: bool,
    pub mode: OtaMode,
    /// Budget for `Shelly.CheckForUpdate`, which consults the vendor
    /// cloud.
    pub check_timeout: Duration,
    pub update_timeout: Duration,
}

impl Default for OtaSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: OtaMode::CheckOnly,
            check_timeout: Duration::from_secs(15),
            update_timeout: Duration::from_secs(30),
        }
    }
}

/// Who wins when the registry and the device disagree on a name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingPolicy {
    /// Only write the registry name to devices that have none yet.
    DeviceIsMaster,
    /// Always push the registry name, overwriting the device.
    RegistryIsMaster,
}

/// Which registry field supplies the desired device name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameSource {
    FriendlyName,
    Room,
    Location,
    Hostname,
}

#[derive(Debug, Clone)]
pub struct FriendlySettings {
    pub enabled: bool,
    pub policy: NamingPolicy,
    pub source: NameSource,
}

impl Default for FriendlySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: NamingPolicy::RegistryIsMaster,
            source: NameSource::FriendlyName,
        }
    }
}

/// Which component family a device profile configures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    Switch,
    Cover,
    Light,
    InputOnly,
}

/// Per-model device configuration template applied by Stage 4.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceProfile {
    pub kind: ProfileKind,
    /// Initial output state after power-on (`on`, `off`, `restore_last`).
    #[serde(default)]
    pub initial_state: Option<String>,
    #[serde(default)]
    pub auto_off_delay: Option<f64>,
    #[serde(default)]
    pub auto_on_delay: Option<f64>,
    /// Input mode (`button`, `switch`, `follow`, `detached`).
    #[serde(default)]
    pub input_mode: Option<String>,
    #[serde(default)]
    pub input_invert: Option<bool>,
    /// Switch relay coupling (`follow`, `flip`, `momentary`, `detached`).
    #[serde(default)]
    pub in_mode: Option<String>,
    #[serde(default)]
    pub cover_open_secs: Option<f64>,
    #[serde(default)]
    pub cover_close_secs: Option<f64>,
    #[serde(default)]
    pub cover_invert_directions: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Stage4Settings {
    /// Hardware model (or app name) to profile.
    pub profiles: BTreeMap<String, DeviceProfile>,
    /// How long to wait for the device to come back after
    /// `Shelly.SetProfile` forces a reboot.
    pub reboot_wait: Duration,
}

impl Default for Stage4Settings {
    fn default() -> Self {
        Self {
            profiles: BTreeMap::new(),
            reboot_wait: Duration::from_secs(20),
        }
    }
}

/// Snapshot directory and retention.
#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub dir: std::path::PathBuf,
    pub retention: usize,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            dir: std::path::PathBuf::from("snapshots"),
            retention: 5,
        }
    }
}
