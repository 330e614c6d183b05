//! TOML configuration for the stagebox CLI.
//!
//! Loads a config file (plus `STAGEBOX_` environment overrides) via
//! figment and translates the raw TOML shape into the validated option
//! structs `stagebox_core` consumes. The core crates never read config
//! files themselves.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use thiserror::Error;

use stagebox_core::config::{
    DeviceProfile, FriendlySettings, HostnameRules, NameSource, NamingPolicy, NetworkSettings,
    OtaMode, OtaSettings, SnapshotSettings, Stage1Settings, Stage4Settings, WifiProfile,
};
use stagebox_core::model::MacAddress;
use stagebox_core::pool::IpPool;

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── Raw TOML shape ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RawConfig {
    /// Registry file location; defaults next to the config file.
    pub registry: Option<PathBuf>,

    /// Concurrent devices per job; the orchestrator default applies
    /// when unset.
    pub concurrency: Option<usize>,

    pub network: NetworkSection,

    #[serde(default)]
    pub wifi: WifiSection,

    #[serde(default)]
    pub stage1: Stage1Section,

    #[serde(default)]
    pub hostname: HostnameSection,

    #[serde(default)]
    pub ota: OtaSection,

    #[serde(default)]
    pub friendly: FriendlySection,

    /// `[profiles.<model>]` stage 4 templates, keyed by hardware model
    /// or app name.
    #[serde(default)]
    pub profiles: BTreeMap<String, DeviceProfile>,

    #[serde(default)]
    pub stage4: Stage4Section,

    #[serde(default)]
    pub snapshot: SnapshotSection,
}

#[derive(Debug, Deserialize)]
pub struct NetworkSection {
    /// Full production network, e.g. `"10.20.0.0/24"`.
    pub scan_cidr: String,
    pub gateway: Ipv4Addr,
    /// Defaults to `255.255.255.0`.
    pub netmask: Option<Ipv4Addr>,
    /// Defaults to the gateway.
    pub nameserver: Option<Ipv4Addr>,
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
    pub dhcp_scan_start: Option<Ipv4Addr>,
    pub dhcp_scan_end: Option<Ipv4Addr>,
    #[serde(default = "default_true")]
    pub scan_exclude_pool: bool,
    /// MAC (any common notation) to pinned address.
    #[serde(default)]
    pub ip_map: BTreeMap<String, Ipv4Addr>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WifiSection {
    #[serde(default)]
    pub profiles: Vec<WifiProfile>,
}

#[derive(Debug, Deserialize)]
pub struct Stage1Section {
    pub ap_ip: Option<Ipv4Addr>,
    pub ssid_prefix: Option<String>,
    #[serde(default = "default_true")]
    pub disable_cloud: bool,
    #[serde(default = "default_true")]
    pub disable_ble: bool,
    #[serde(default = "default_true")]
    pub disable_ap: bool,
    #[serde(default)]
    pub disable_mqtt: bool,
    pub idle_delay_s: Option<u64>,
}

impl Default for Stage1Section {
    fn default() -> Self {
        Self {
            ap_ip: None,
            ssid_prefix: None,
            disable_cloud: true,
            disable_ble: true,
            disable_ap: true,
            disable_mqtt: false,
            idle_delay_s: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HostnameSection {
    /// Model (or app) name to hostname prefix.
    #[serde(default)]
    pub prefixes: BTreeMap<String, String>,
    pub default_prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OtaSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub mode: Option<OtaMode>,
    pub check_timeout_s: Option<u64>,
    pub update_timeout_s: Option<u64>,
}

impl Default for OtaSection {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: None,
            check_timeout_s: None,
            update_timeout_s: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FriendlySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub policy: Option<NamingPolicy>,
    pub source: Option<NameSource>,
}

impl Default for FriendlySection {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: None,
            source: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct Stage4Section {
    pub reboot_wait_s: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotSection {
    pub dir: Option<PathBuf>,
    pub retention: Option<usize>,
}

fn default_true() -> bool {
    true
}

// ── Validated settings bundle ───────────────────────────────────────

/// Everything the CLI hands to the core runners.
#[derive(Debug, Clone)]
pub struct Settings {
    pub registry_path: PathBuf,
    pub concurrency: usize,
    pub network: NetworkSettings,
    pub wifi_profiles: Vec<WifiProfile>,
    pub stage1: Stage1Settings,
    pub hostname: HostnameRules,
    pub ota: OtaSettings,
    pub friendly: FriendlySettings,
    pub stage4: Stage4Settings,
    pub snapshot: SnapshotSettings,
}

impl Settings {
    /// Validate and translate the raw TOML shape.
    pub fn from_raw(raw: RawConfig, config_dir: &Path) -> Result<Self, ConfigError> {
        let network = build_network(&raw.network)?;

        let defaults = Stage1Settings::default();
        let mut stage1 = Stage1Settings {
            device_ap_ip: raw.stage1.ap_ip.unwrap_or(defaults.device_ap_ip),
            ap_ssid_prefix: raw
                .stage1
                .ssid_prefix
                .unwrap_or(defaults.ap_ssid_prefix),
            wifi_profiles: raw.wifi.profiles.clone(),
            disable_cloud: raw.stage1.disable_cloud,
            disable_ble: raw.stage1.disable_ble,
            disable_ap: raw.stage1.disable_ap,
            disable_mqtt: raw.stage1.disable_mqtt,
            idle_delay: defaults.idle_delay,
        };
        if let Some(secs) = raw.stage1.idle_delay_s {
            stage1.idle_delay = Duration::from_secs(secs);
        }

        let hostname = HostnameRules {
            prefixes: raw.hostname.prefixes,
            default_prefix: raw
                .hostname
                .default_prefix
                .unwrap_or_else(|| HostnameRules::default().default_prefix),
        };

        let ota_defaults = OtaSettings::default();
        let ota = OtaSettings {
            enabled: raw.ota.enabled,
            mode: raw.ota.mode.unwrap_or(ota_defaults.mode),
            check_timeout: raw
                .ota
                .check_timeout_s
                .map_or(ota_defaults.check_timeout, Duration::from_secs),
            update_timeout: raw
                .ota
                .update_timeout_s
                .map_or(ota_defaults.update_timeout, Duration::from_secs),
        };

        let friendly_defaults = FriendlySettings::default();
        let friendly = FriendlySettings {
            enabled: raw.friendly.enabled,
            policy: raw.friendly.policy.unwrap_or(friendly_defaults.policy),
            source: raw.friendly.source.unwrap_or(friendly_defaults.source),
        };

        let stage4_defaults = Stage4Settings::default();
        let stage4 = Stage4Settings {
            profiles: raw.profiles,
            reboot_wait: raw
                .stage4
                .reboot_wait_s
                .map_or(stage4_defaults.reboot_wait, Duration::from_secs),
        };

        let snapshot_defaults = SnapshotSettings::default();
        let snapshot = SnapshotSettings {
            dir: raw
                .snapshot
                .dir
                .unwrap_or_else(|| config_dir.join(snapshot_defaults.dir)),
            retention: raw.snapshot.retention.unwrap_or(snapshot_defaults.retention),
        };

        Ok(Self {
            registry_path: raw
                .registry
                .unwrap_or_else(|| config_dir.join("registry.json")),
            concurrency: raw
                .concurrency
                .unwrap_or(stagebox_core::DEFAULT_CONCURRENCY),
            network,
            wifi_profiles: raw.wifi.profiles,
            stage1,
            hostname,
            ota,
            friendly,
            stage4,
            snapshot,
        })
    }
}

fn build_network(section: &NetworkSection) -> Result<NetworkSettings, ConfigError> {
    let pool =
        IpPool::new(section.pool_start, section.pool_end).map_err(|e| ConfigError::Validation {
            field: "network.pool_start/pool_end".into(),
            reason: e.to_string(),
        })?;

    let dhcp_scan = match (section.dhcp_scan_start, section.dhcp_scan_end) {
        (Some(start), Some(end)) if start <= end => Some((start, end)),
        (Some(_), Some(_)) => {
            return Err(ConfigError::Validation {
                field: "network.dhcp_scan_start/dhcp_scan_end".into(),
                reason: "start is above end".into(),
            });
        }
        (None, None) => None,
        _ => {
            return Err(ConfigError::Validation {
                field: "network.dhcp_scan_start/dhcp_scan_end".into(),
                reason: "both ends of the range are required".into(),
            });
        }
    };

    let mut ip_map = BTreeMap::new();
    for (raw_mac, ip) in &section.ip_map {
        let mac = MacAddress::parse(raw_mac).map_err(|e| ConfigError::Validation {
            field: format!("network.ip_map.{raw_mac}"),
            reason: e.to_string(),
        })?;
        ip_map.insert(mac, *ip);
    }

    Ok(NetworkSettings {
        cidr: section.scan_cidr.clone(),
        gateway: section.gateway,
        netmask: section.netmask.unwrap_or(Ipv4Addr::new(255, 255, 255, 0)),
        nameserver: section.nameserver.unwrap_or(section.gateway),
        pool,
        dhcp_scan,
        scan_exclude_pool: section.scan_exclude_pool,
        ip_map,
    })
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("dev", "stagebox", "stagebox").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("stagebox");
    p
}

// ── Loading ─────────────────────────────────────────────────────────

/// Load and validate settings from an explicit path or the canonical
/// location, with `STAGEBOX_` environment overrides on top.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);

    let figment = Figment::new()
        .merge(Toml::file(&path))
        .merge(Env::prefixed("STAGEBOX_").split("_"));

    let raw: RawConfig = figment.extract()?;
    let config_dir = path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    Settings::from_raw(raw, &config_dir)
}
