// ── Device registry ──
//
// The registry file is the single source of truth for the fleet:
// `{"version": 1, "devices": {"<MAC>": {...}}}`. Every write goes
// through the same atomic sequence (temp file + fsync, copy the old
// primary to `.bak`, rename over the primary) so a crash at any point
// leaves either the previous or the new state on disk, never a torn
// file. Writes are serialized by a registry-wide lock; readers work
// from cloned snapshots.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::model::{DeviceRecord, MacAddress};

const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    devices: BTreeMap<MacAddress, DeviceRecord>,
}

/// Persisted device registry.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    devices: RwLock<BTreeMap<MacAddress, DeviceRecord>>,
}

impl Registry {
    /// Open the registry at `path`, creating an empty one in memory if
    /// the file does not exist yet. A corrupt primary fails over to the
    /// `.bak` copy from the last successful save.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let devices = match Self::load_file(&path) {
            Ok(devices) => devices,
            Err(err @ (CoreError::RegistryCorrupt { .. } | CoreError::RegistryVersion { .. })) => {
                // Without a backup the primary's diagnosis stands; a
                // missing `.bak` must not read as an empty fleet, or
                // the next save would wipe the evidence.
                let backup = Self::backup_path(&path);
                if !backup.exists() {
                    return Err(err);
                }
                warn!(
                    path = %path.display(),
                    %err,
                    "registry primary unreadable, trying backup"
                );
                match Self::load_file(&backup) {
                    Ok(devices) => {
                        info!(path = %backup.display(), "recovered registry from backup");
                        devices
                    }
                    // The primary's diagnosis is the useful one.
                    Err(_) => return Err(err),
                }
            }
            Err(err) => return Err(err),
        };
        Ok(Self {
            path,
            devices: RwLock::new(devices),
        })
    }

    /// Load strictly from the primary file, without backup failover.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let devices = Self::load_file(&path)?;
        Ok(Self {
            path,
            devices: RwLock::new(devices),
        })
    }

    fn load_file(path: &Path) -> Result<BTreeMap<MacAddress, DeviceRecord>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read_to_string(path).map_err(|source| CoreError::RegistryIo {
            path: path.to_owned(),
            source,
        })?;
        let file: RegistryFile =
            serde_json::from_str(&raw).map_err(|e| CoreError::RegistryCorrupt {
                path: path.to_owned(),
                reason: e.to_string(),
            })?;
        if file.version != REGISTRY_VERSION {
            return Err(CoreError::RegistryVersion {
                path: path.to_owned(),
                found: file.version,
                expected: REGISTRY_VERSION,
            });
        }
        Ok(file.devices)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Clone of one record.
    pub fn get(&self, mac: &MacAddress) -> Option<DeviceRecord> {
        self.read_guard().get(mac).cloned()
    }

    pub fn contains(&self, mac: &MacAddress) -> bool {
        self.read_guard().contains_key(mac)
    }

    /// Point-in-time copy of the whole device map. Stage runs work
    /// from one of these so concurrent readers never block a run.
    pub fn snapshot(&self) -> BTreeMap<MacAddress, DeviceRecord> {
        self.read_guard().clone()
    }

    /// Reverse lookup by assigned address. Linear over the map, which
    /// is fine at fleet scale (tens of devices).
    pub fn find_by_ip(&self, ip: Ipv4Addr) -> Option<(MacAddress, DeviceRecord)> {
        self.read_guard()
            .iter()
            .find(|(_, record)| record.ip == Some(ip))
            .map(|(mac, record)| (mac.clone(), record.clone()))
    }

    pub fn len(&self) -> usize {
        self.read_guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_guard().is_empty()
    }

    // ── Writes (each persists exactly once) ──────────────────────────

    /// Merge changes into one record, creating it if absent, then
    /// persist.
    pub fn update<F>(&self, mac: &MacAddress, apply: F) -> Result<DeviceRecord>
    where
        F: FnOnce(&mut DeviceRecord),
    {
        let updated;
        {
            let mut devices = self.write_guard();
            let record = devices.entry(mac.clone()).or_default();
            apply(record);
            record.touch(Utc::now());
            updated = record.clone();
            self.persist(&devices)?;
        }
        debug!(%mac, stage = updated.stage_completed, "registry updated");
        Ok(updated)
    }

    /// Replace one record wholesale and persist.
    pub fn upsert(&self, mac: &MacAddress, record: DeviceRecord) -> Result<()> {
        let mut devices = self.write_guard();
        devices.insert(mac.clone(), record);
        self.persist(&devices)
    }

    /// Remove a device entirely. This is the only path that lowers a
    /// device's stage: the record vanishes, it does not regress.
    pub fn remove(&self, mac: &MacAddress) -> Result<DeviceRecord> {
        let mut devices = self.write_guard();
        let removed = devices
            .remove(mac)
            .ok_or_else(|| CoreError::DeviceNotFound {
                mac: mac.to_string(),
            })?;
        self.persist(&devices)?;
        info!(%mac, "device removed from registry");
        Ok(removed)
    }

    /// Apply many record edits under one lock and persist exactly
    /// once. Stage runs that touch a whole batch of devices end with
    /// one of these instead of a save per device.
    pub fn batch<F>(&self, apply: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<MacAddress, DeviceRecord>),
    {
        let mut devices = self.write_guard();
        apply(&mut devices);
        self.persist(&devices)
    }

    /// Persist the current in-memory map as-is.
    pub fn save(&self) -> Result<()> {
        let devices = self.read_guard();
        self.persist(&devices)
    }

    // ── Atomic write machinery ───────────────────────────────────────

    fn persist(&self, devices: &BTreeMap<MacAddress, DeviceRecord>) -> Result<()> {
        let file = RegistryFile {
            version: REGISTRY_VERSION,
            devices: devices.clone(),
        };
        let payload = serde_json::to_vec_pretty(&file)?;

        let io_err = |source: std::io::Error| CoreError::RegistryIo {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        // 1. New content to a temp file in the same directory, synced.
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut tmp = fs::File::create(&tmp_path).map_err(io_err)?;
            tmp.write_all(&payload).map_err(io_err)?;
            tmp.sync_all().map_err(io_err)?;
        }

        // 2. Previous primary becomes the backup.
        if self.path.exists() {
            fs::copy(&self.path, Self::backup_path(&self.path)).map_err(io_err)?;
        }

        // 3. Rename is the commit point.
        fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        Ok(())
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_owned();
        os.push(".bak");
        PathBuf::from(os)
    }

    // Lock poisoning only happens after a panic mid-write; the map may
    // be stale but is never structurally broken, so recover the guard.
    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<MacAddress, DeviceRecord>> {
        self.devices.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<MacAddress, DeviceRecord>> {
        self.devices.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
