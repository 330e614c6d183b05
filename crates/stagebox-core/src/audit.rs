// ── Audit and snapshot engine ──
//
// A snapshot is an immutable bundle of live device scans written as
// `snapshot_YYYYMMDD_HHMMSS.json`. Audits take a fresh scan and
// classify each device against a reference snapshot; they never touch
// the registry.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stagebox_rpc::ClientFactory;
use tracing::{debug, info, warn};

use crate::config::SnapshotSettings;
use crate::error::{CoreError, Result};
use crate::model::{DeviceRecord, MacAddress};
use crate::scan::SCAN_CONCURRENCY;

const SCAN_TIMEOUT: Duration = Duration::from_secs(3);

/// Live scan of one device at snapshot time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceScan {
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub firmware: Option<String>,
    /// Full `Shelly.GetConfig` tree, kept verbatim for deep diffs.
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub webhook_count: usize,
    #[serde(default)]
    pub schedule_count: usize,
    #[serde(default)]
    pub kvs_keys: BTreeSet<String>,
}

/// One immutable snapshot bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub created_at: DateTime<Utc>,
    pub devices: BTreeMap<MacAddress, DeviceScan>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Ok,
    Changed,
    Offline,
    New,
}

/// Classification of one device against the reference snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceAudit {
    pub mac: MacAddress,
    pub status: AuditStatus,
    pub differences: Vec<String>,
    pub ip: Option<Ipv4Addr>,
    pub name: Option<String>,
    pub firmware: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    pub taken_at: DateTime<Utc>,
    pub reference: DateTime<Utc>,
    pub devices: Vec<DeviceAudit>,
}

impl AuditReport {
    pub fn count(&self, status: AuditStatus) -> usize {
        self.devices.iter().filter(|d| d.status == status).count()
    }
}

/// Snapshot directory with retention.
pub struct SnapshotStore {
    settings: SnapshotSettings,
}

impl SnapshotStore {
    pub fn new(settings: SnapshotSettings) -> Self {
        Self { settings }
    }

    // ── Snapshot creation ────────────────────────────────────────────

    /// Scan the given devices live and persist a new snapshot,
    /// pruning the oldest bundles past the retention limit.
    pub async fn take(
        &self,
        targets: &BTreeMap<MacAddress, DeviceRecord>,
        factory: &dyn ClientFactory,
    ) -> Result<(PathBuf, Snapshot)> {
        let snapshot = Snapshot {
            created_at: Utc::now(),
            devices: scan_fleet(targets, factory).await,
        };

        fs::create_dir_all(&self.settings.dir).map_err(|e| CoreError::Snapshot {
            path: self.settings.dir.clone(),
            message: e.to_string(),
        })?;

        let filename = format!(
            "snapshot_{}.json",
            snapshot.created_at.format("%Y%m%d_%H%M%S")
        );
        let path = self.settings.dir.join(filename);
        let payload = serde_json::to_vec_pretty(&snapshot)?;
        fs::write(&path, payload).map_err(|e| CoreError::Snapshot {
            path: path.clone(),
            message: e.to_string(),
        })?;
        info!(path = %path.display(), devices = snapshot.devices.len(), "snapshot written");

        self.prune()?;
        Ok((path, snapshot))
    }

    /// Snapshot files, oldest first. Timestamped names sort
    /// chronologically.
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        if !self.settings.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.settings.dir).map_err(|e| CoreError::Snapshot {
            path: self.settings.dir.clone(),
            message: e.to_string(),
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("snapshot_") && n.ends_with(".json"))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    pub fn latest(&self) -> Result<Option<PathBuf>> {
        Ok(self.list()?.pop())
    }

    pub fn load(&self, path: &Path) -> Result<Snapshot> {
        let raw = fs::read_to_string(path).map_err(|e| CoreError::Snapshot {
            path: path.to_owned(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| CoreError::Snapshot {
            path: path.to_owned(),
            message: format!("invalid snapshot: {e}"),
        })
    }

    fn prune(&self) -> Result<()> {
        let files = self.list()?;
        let excess = files.len().saturating_sub(self.settings.retention);
        for old in &files[..excess] {
            debug!(path = %old.display(), "pruning old snapshot");
            fs::remove_file(old).map_err(|e| CoreError::Snapshot {
                path: old.clone(),
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    // ── Audit ────────────────────────────────────────────────────────

    /// Fresh scan, compared against `reference`. Read-only throughout.
    pub async fn audit(
        &self,
        targets: &BTreeMap<MacAddress, DeviceRecord>,
        reference: &Snapshot,
        factory: &dyn ClientFactory,
    ) -> AuditReport {
        let live = scan_fleet(targets, factory).await;

        let all_macs: BTreeSet<&MacAddress> =
            reference.devices.keys().chain(live.keys()).collect();

        let mut devices = Vec::with_capacity(all_macs.len());
        for mac in all_macs {
            let snap = reference.devices.get(mac);
            let now = live.get(mac);
            devices.push(match (snap, now) {
                (Some(snap), None) => DeviceAudit {
                    mac: mac.clone(),
                    status: AuditStatus::Offline,
                    differences: vec!["device in snapshot but not responding".into()],
                    ip: Some(snap.ip),
                    name: snap.name.clone(),
                    firmware: snap.firmware.clone(),
                },
                (None, Some(now)) => DeviceAudit {
                    mac: mac.clone(),
                    status: AuditStatus::New,
                    differences: vec!["device not in reference snapshot".into()],
                    ip: Some(now.ip),
                    name: now.name.clone(),
                    firmware: now.firmware.clone(),
                },
                (Some(snap), Some(now)) => {
                    let differences = diff_scans(snap, now);
                    DeviceAudit {
                        mac: mac.clone(),
                        status: if differences.is_empty() {
                            AuditStatus::Ok
                        } else {
                            AuditStatus::Changed
                        },
                        differences,
                        ip: Some(now.ip),
                        name: now.name.clone(),
                        firmware: now.firmware.clone(),
                    }
                }
                (None, None) => unreachable!("mac came from one of the maps"),
            });
        }

        AuditReport {
            taken_at: Utc::now(),
            reference: reference.created_at,
            devices,
        }
    }
}

// ── Live scanning ───────────────────────────────────────────────────

async fn scan_fleet(
    targets: &BTreeMap<MacAddress, DeviceRecord>,
    factory: &dyn ClientFactory,
) -> BTreeMap<MacAddress, DeviceScan> {
    let addressed: Vec<(MacAddress, Ipv4Addr)> = targets
        .iter()
        .filter_map(|(mac, record)| record.ip.map(|ip| (mac.clone(), ip)))
        .collect();

    stream::iter(addressed)
        .map(|(mac, ip)| async move {
            match scan_device(ip, factory).await {
                Some(scan) => Some((mac, scan)),
                None => {
                    debug!(%mac, %ip, "device did not answer scan");
                    None
                }
            }
        })
        .buffer_unordered(SCAN_CONCURRENCY)
        .filter_map(|hit| async move { hit })
        .collect()
        .await
}

/// Collect one device's identity, config, webhooks and KVS keys.
async fn scan_device(ip: Ipv4Addr, factory: &dyn ClientFactory) -> Option<DeviceScan> {
    let client = factory.client(&ip.to_string()).ok()?;

    let info = match client
        .call_with_timeout("Shelly.GetDeviceInfo", None, SCAN_TIMEOUT)
        .await
    {
        Ok(value) => stagebox_rpc::RpcClient::decode::<stagebox_rpc::types::DeviceInfo>(value).ok()?,
        Err(_) => return None,
    };
    let config = client.full_config().await.unwrap_or(Value::Null);
    let name = config
        .pointer("/sys/device/name")
        .and_then(Value::as_str)
        .map(str::to_owned);

    let webhook_count = match client.webhook_list().await {
        Ok(list) => list.hooks.len(),
        Err(err) => {
            warn!(%ip, %err, "webhook listing failed during scan");
            0
        }
    };

    let schedule_count = match client.schedule_list().await {
        Ok(value) => value
            .pointer("/jobs")
            .and_then(Value::as_array)
            .map_or(0, Vec::len),
        Err(err) => {
            warn!(%ip, %err, "schedule listing failed during scan");
            0
        }
    };

    let kvs_keys = match client.kvs_all().await {
        Ok(page) => page.items.into_keys().collect(),
        Err(err) => {
            warn!(%ip, %err, "kvs listing failed during scan");
            BTreeSet::new()
        }
    };

    Some(DeviceScan {
        ip,
        name,
        model: info.app.clone().or(Some(info.model)),
        firmware: info.ver,
        config,
        webhook_count,
        schedule_count,
        kvs_keys,
    })
}

// ── Diffing ─────────────────────────────────────────────────────────

fn diff_scans(snap: &DeviceScan, live: &DeviceScan) -> Vec<String> {
    let mut diffs = Vec::new();

    if snap.ip != live.ip {
        diffs.push(format!("ip: {} -> {}", snap.ip, live.ip));
    }
    if snap.name != live.name {
        diffs.push(format!(
            "name: {} -> {}",
            display_opt(&snap.name),
            display_opt(&live.name)
        ));
    }
    if snap.firmware != live.firmware {
        diffs.push(format!(
            "firmware: {} -> {}",
            display_opt(&snap.firmware),
            display_opt(&live.firmware)
        ));
    }

    for i in 0..4 {
        let key = format!("input:{i}");
        for field in ["type", "invert"] {
            diff_config_field(&mut diffs, snap, live, &key, field);
        }
    }
    for i in 0..2 {
        let key = format!("switch:{i}");
        for field in ["in_mode", "initial_state"] {
            diff_config_field(&mut diffs, snap, live, &key, field);
        }
    }
    for field in ["in_mode", "swap_inputs", "invert_directions"] {
        diff_config_field(&mut diffs, snap, live, "cover:0", field);
    }

    if snap.webhook_count != live.webhook_count {
        diffs.push(format!(
            "webhooks: {} -> {}",
            snap.webhook_count, live.webhook_count
        ));
    }
    if snap.schedule_count != live.schedule_count {
        diffs.push(format!(
            "schedules: {} -> {}",
            snap.schedule_count, live.schedule_count
        ));
    }
    if snap.kvs_keys != live.kvs_keys {
        let added: Vec<_> = live.kvs_keys.difference(&snap.kvs_keys).cloned().collect();
        let removed: Vec<_> = snap.kvs_keys.difference(&live.kvs_keys).cloned().collect();
        diffs.push(format!(
            "kvs keys: +[{}] -[{}]",
            added.join(", "),
            removed.join(", ")
        ));
    }

    diffs
}

fn display_opt(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("(none)")
}

fn diff_config_field(
    diffs: &mut Vec<String>,
    snap: &DeviceScan,
    live: &DeviceScan,
    component: &str,
    field: &str,
) {
    let pointer = format!("/{component}/{field}");
    let a = snap.config.pointer(&pointer);
    let b = live.config.pointer(&pointer);
    if a.is_none() && b.is_none() {
        return;
    }
    if a != b {
        diffs.push(format!(
            "{component}.{field}: {} -> {}",
            a.unwrap_or(&Value::Null),
            b.unwrap_or(&Value::Null)
        ));
    }
}
