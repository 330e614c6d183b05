// ── IP pool allocation ──
//
// The registry is the single source of truth for which pool addresses
// are in use. No pinging or ARP heuristics here: an address held by
// any record is taken, every other address inside the range is free.

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

use serde::Serialize;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::model::{DeviceRecord, MacAddress};

/// Inclusive IPv4 range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPool {
    start: Ipv4Addr,
    end: Ipv4Addr,
}

/// How an address was chosen for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationSource {
    /// Pinned by the operator's MAC-to-IP override map.
    Pinned,
    /// The device's existing registry assignment inside the pool.
    Existing,
    /// Lowest free address in the pool.
    Fresh,
}

/// Occupancy counters for status output.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub used: usize,
    pub free: usize,
}

impl IpPool {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        if start > end {
            return Err(CoreError::InvalidRange {
                input: format!("{start}-{end}"),
                reason: "pool start is after pool end".into(),
            });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn end(&self) -> Ipv4Addr {
        self.end
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.start <= ip && ip <= self.end
    }

    pub fn len(&self) -> usize {
        (u32::from(self.end) - u32::from(self.start)) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Ascending iteration over every address in the range.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        (u32::from(self.start)..=u32::from(self.end)).map(Ipv4Addr::from)
    }

    /// Occupancy derived from the given registry snapshot. Only
    /// addresses inside the pool count as used.
    pub fn stats(&self, devices: &BTreeMap<MacAddress, DeviceRecord>) -> PoolStats {
        let used = devices
            .values()
            .filter_map(|d| d.ip)
            .filter(|ip| self.contains(*ip))
            .collect::<BTreeSet<_>>()
            .len();
        let total = self.len();
        PoolStats {
            total,
            used,
            free: total.saturating_sub(used),
        }
    }

    /// Pick the address for `mac`, in strict precedence order:
    ///
    /// 1. an operator override in `ip_map` (honored even outside the
    ///    pool range, the operator knows their network),
    /// 2. the device's existing registry assignment, if inside the pool,
    /// 3. the lowest pool address not held by any record or override.
    pub fn allocate(
        &self,
        mac: &MacAddress,
        devices: &BTreeMap<MacAddress, DeviceRecord>,
        ip_map: &BTreeMap<MacAddress, Ipv4Addr>,
    ) -> Result<(Ipv4Addr, AllocationSource)> {
        if let Some(pinned) = ip_map.get(mac) {
            debug!(%mac, ip = %pinned, "address pinned by override map");
            return Ok((*pinned, AllocationSource::Pinned));
        }

        if let Some(existing) = devices.get(mac).and_then(|d| d.ip) {
            if self.contains(existing) {
                return Ok((existing, AllocationSource::Existing));
            }
        }

        let taken: BTreeSet<Ipv4Addr> = devices
            .values()
            .filter_map(|d| d.ip)
            .chain(ip_map.values().copied())
            .collect();

        for candidate in self.iter() {
            if !taken.contains(&candidate) {
                debug!(%mac, ip = %candidate, "allocated lowest free pool address");
                return Ok((candidate, AllocationSource::Fresh));
            }
        }

        Err(CoreError::AllocationConflict {
            range: format!("{}-{}", self.start, self.end),
            size: self.len(),
        })
    }
}
