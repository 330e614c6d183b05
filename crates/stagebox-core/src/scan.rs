// ── Network discovery ──
//
// Enumerates candidate addresses for Stage 2 and probes them
// concurrently with short-deadline RPC identity calls. Devices answer
// `Shelly.GetDeviceInfo` even before adoption, which doubles as the
// discovery handshake.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use futures_util::{StreamExt, stream};
use stagebox_rpc::types::DeviceInfo;
use stagebox_rpc::{ClientFactory, RpcClient};
use tracing::{debug, info};

use crate::config::NetworkSettings;
use crate::error::{CoreError, Result};

/// How many probes run in flight at once during a sweep.
pub const SCAN_CONCURRENCY: usize = 20;

/// Deadline per probed address. Anything alive on the local segment
/// answers well inside this.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// IPv4 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(CoreError::InvalidRange {
                input: format!("{address}/{prefix}"),
                reason: "prefix must be 0-32".into(),
            });
        }
        let mask = Self::mask_bits(prefix);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(address) & mask),
            prefix,
        })
    }

    fn mask_bits(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask_bits(self.prefix) == u32::from(self.network)
    }

    /// Usable host addresses: network and broadcast are excluded for
    /// prefixes up to /30; /31 and /32 yield every address.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        let base = u32::from(self.network);
        let span = 1u64 << (32 - self.prefix);
        let (first, last) = if self.prefix >= 31 {
            (base, base + (span as u32 - 1))
        } else {
            (base + 1, base + (span - 2) as u32)
        };
        (first..=last).map(Ipv4Addr::from)
    }
}

impl FromStr for Cidr {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| CoreError::InvalidRange {
            input: s.to_owned(),
            reason: reason.to_owned(),
        };
        let (addr, prefix) = s.split_once('/').ok_or_else(|| invalid("missing '/'"))?;
        let addr: Ipv4Addr = addr
            .trim()
            .parse()
            .map_err(|_| invalid("invalid network address"))?;
        let prefix: u8 = prefix
            .trim()
            .parse()
            .map_err(|_| invalid("invalid prefix length"))?;
        Self::new(addr, prefix)
    }
}

/// An address that answered the identity probe.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub ip: Ipv4Addr,
    pub info: DeviceInfo,
}

/// Build the list of addresses a Stage 2 sweep should probe.
///
/// The DHCP sub-range wins when configured: factory-reset devices land
/// there, and scanning thirty addresses beats scanning a /24. Without
/// one, the full CIDR is swept, minus the managed pool when
/// `scan_exclude_pool` is set (pool addresses hold adopted devices).
pub fn scan_candidates(network: &NetworkSettings) -> Result<Vec<Ipv4Addr>> {
    if let Some((start, end)) = network.dhcp_scan {
        if start > end {
            return Err(CoreError::InvalidRange {
                input: format!("{start}-{end}"),
                reason: "scan range start is after end".into(),
            });
        }
        return Ok((u32::from(start)..=u32::from(end)).map(Ipv4Addr::from).collect());
    }

    let cidr: Cidr = network.cidr.parse()?;
    let candidates = cidr
        .hosts()
        .filter(|ip| !(network.scan_exclude_pool && network.pool.contains(*ip)))
        .collect();
    Ok(candidates)
}

/// Probe every candidate concurrently, returning the devices that
/// identified themselves, in ascending address order.
pub async fn discover(
    candidates: Vec<Ipv4Addr>,
    factory: &dyn ClientFactory,
) -> Vec<DiscoveredDevice> {
    let total = candidates.len();
    debug!(total, "starting discovery sweep");

    let mut found: Vec<DiscoveredDevice> = stream::iter(candidates)
        .map(|ip| async move {
            let client = factory.client(&ip.to_string()).ok()?;
            let value = client
                .call_with_timeout("Shelly.GetDeviceInfo", None, PROBE_TIMEOUT)
                .await
                .ok()?;
            let info: DeviceInfo = RpcClient::decode(value).ok()?;
            debug!(%ip, model = %info.model, "device answered identity probe");
            Some(DiscoveredDevice { ip, info })
        })
        .buffer_unordered(SCAN_CONCURRENCY)
        .filter_map(|hit| async move { hit })
        .collect()
        .await;

    found.sort_by_key(|d| d.ip);
    info!(probed = total, found = found.len(), "discovery sweep finished");
    found
}
