// ── Stage 2: adoption ──
//
// Moves devices from DHCP addresses into the managed static pool.
// Discovery sweeps the DHCP sub-range (or the full CIDR); every
// allocation is then decided up front against one registry snapshot,
// so concurrent workers can never hand two devices the same address.
// The network phase runs per device and the whole run persists its
// registry changes in a single save.

use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::Utc;
use secrecy::ExposeSecret;
use serde_json::json;
use stagebox_rpc::{ClientFactory, Probe};
use tracing::{debug, info, warn};

use crate::config::{HostnameRules, NetworkSettings, WifiProfile};
use crate::error::{CoreError, Result};
use crate::model::MacAddress;
use crate::pool::AllocationSource;
use crate::registry::Registry;
use crate::scan::{self, DiscoveredDevice};
use crate::stage::DeviceOutcome;

/// How long the device gets to re-join on its new static address.
const SETTLE_ATTEMPTS: u32 = 10;
const SETTLE_INTERVAL: Duration = Duration::from_secs(2);

pub struct Stage2Runner<'a> {
    pub registry: &'a Registry,
    pub network: &'a NetworkSettings,
    pub wifi_profiles: &'a [WifiProfile],
    pub hostname_rules: &'a HostnameRules,
    pub probe: &'a dyn Probe,
    pub factory: &'a dyn ClientFactory,
    pub dry_run: bool,
}

/// One decided adoption. All plans of a run are allocated against the
/// same registry snapshot before any network work starts.
#[derive(Debug, Clone)]
pub struct AdoptionPlan {
    pub mac: MacAddress,
    pub device: DiscoveredDevice,
    pub target_ip: Ipv4Addr,
    pub source: AllocationSource,
}

/// Record fields a successful adoption wants persisted.
#[derive(Debug, Clone)]
pub struct AdoptionEdit {
    pub mac: MacAddress,
    pub target_ip: Ipv4Addr,
    pub hostname: String,
    pub model: String,
    pub hw_model: Option<String>,
    pub firmware: Option<String>,
}

impl Stage2Runner<'_> {
    /// Sweep the network and adopt everything that answered, except
    /// devices excluded by `mac_filter`.
    pub async fn adopt_all(&self, mac_filter: Option<&MacAddress>) -> Result<Vec<DeviceOutcome>> {
        let candidates = scan::scan_candidates(self.network)?;
        let discovered = scan::discover(candidates, self.factory).await;
        self.adopt_discovered(&discovered, mac_filter).await
    }

    /// Plan, execute and persist adoption of already-discovered
    /// devices, ending with exactly one registry save.
    pub async fn adopt_discovered(
        &self,
        discovered: &[DiscoveredDevice],
        mac_filter: Option<&MacAddress>,
    ) -> Result<Vec<DeviceOutcome>> {
        let (plans, mut outcomes) = self.plan(discovered, mac_filter);
        let mut edits = Vec::new();
        for plan in &plans {
            let (outcome, edit) = self.execute_outcome(plan).await;
            outcomes.push(outcome);
            edits.extend(edit);
        }
        self.commit(&edits)?;
        Ok(outcomes)
    }

    /// Decide every allocation for this run against one registry
    /// snapshot. Devices that need no network work (already adopted,
    /// dry run, unusable) come back as settled outcomes; each plan
    /// reserves its address so later plans cannot collide with it.
    pub fn plan(
        &self,
        discovered: &[DiscoveredDevice],
        mac_filter: Option<&MacAddress>,
    ) -> (Vec<AdoptionPlan>, Vec<DeviceOutcome>) {
        let mut snapshot = self.registry.snapshot();
        let mut plans = Vec::new();
        let mut settled = Vec::new();

        for device in discovered {
            let mac = match MacAddress::parse(&device.info.mac) {
                Ok(mac) => mac,
                Err(err) => {
                    settled.push(DeviceOutcome::error(device.ip.to_string(), err.to_string()));
                    continue;
                }
            };
            if let Some(filter) = mac_filter {
                if filter != &mac {
                    continue;
                }
            }

            let (target_ip, source) =
                match self.network.pool.allocate(&mac, &snapshot, &self.network.ip_map) {
                    Ok(decision) => decision,
                    Err(err) => {
                        settled.push(DeviceOutcome::error(mac.to_string(), err.to_string()));
                        continue;
                    }
                };
            debug!(%mac, ip = %target_ip, ?source, "allocation decided");

            // Idempotence: already on the right address with stage >= 2
            // means there is nothing to push and nothing to persist.
            if source == AllocationSource::Existing
                && device.ip == target_ip
                && snapshot.get(&mac).is_some_and(|r| r.stage_completed >= 2)
            {
                settled.push(DeviceOutcome::ok(
                    mac.to_string(),
                    format!("already adopted at {target_ip}"),
                ));
                continue;
            }

            // Reserve the address in the working snapshot so the next
            // device in this run allocates past it.
            snapshot.entry(mac.clone()).or_default().ip = Some(target_ip);

            if self.dry_run {
                settled.push(DeviceOutcome::ok(
                    mac.to_string(),
                    format!("dry-run: would assign {target_ip} ({source:?})"),
                ));
                continue;
            }

            plans.push(AdoptionPlan {
                mac,
                device: device.clone(),
                target_ip,
                source,
            });
        }

        (plans, settled)
    }

    /// Network phase for one planned adoption, with the error folded
    /// into a per-device outcome so one failure never sinks the batch.
    /// No registry write happens here; the caller commits all edits of
    /// the run in one batch.
    pub async fn execute_outcome(
        &self,
        plan: &AdoptionPlan,
    ) -> (DeviceOutcome, Option<AdoptionEdit>) {
        match self.execute(plan).await {
            Ok(edit) => {
                let outcome = DeviceOutcome::ok(
                    plan.mac.to_string(),
                    format!("adopted at {} ({:?})", plan.target_ip, plan.source),
                );
                (outcome, Some(edit))
            }
            Err(err) => (
                DeviceOutcome::error(plan.mac.to_string(), err.to_string()),
                None,
            ),
        }
    }

    async fn execute(&self, plan: &AdoptionPlan) -> Result<AdoptionEdit> {
        if plan.device.ip == plan.target_ip {
            debug!(mac = %plan.mac, ip = %plan.target_ip, "device already on target address, refreshing config");
        } else {
            self.push_static_config(plan.device.ip, plan.target_ip).await?;
            self.wait_for_settle(&plan.mac, plan.target_ip).await;
        }

        let info = &plan.device.info;
        let hostname = self
            .hostname_rules
            .derive(info.app.as_deref().unwrap_or(&info.model), &plan.mac);
        Ok(AdoptionEdit {
            mac: plan.mac.clone(),
            target_ip: plan.target_ip,
            hostname,
            model: info.model.clone(),
            hw_model: info.app.clone(),
            firmware: info.ver.clone(),
        })
    }

    /// Merge every successful adoption of the run into the registry in
    /// one save.
    pub fn commit(&self, edits: &[AdoptionEdit]) -> Result<()> {
        if edits.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        self.registry.batch(|devices| {
            for edit in edits {
                let record = devices.entry(edit.mac.clone()).or_default();
                if record.assigned_at.is_none() {
                    record.assigned_at = Some(now);
                }
                record.ip = Some(edit.target_ip);
                record.hostname = Some(edit.hostname.clone());
                record.model = Some(edit.model.clone());
                record.hw_model = edit.hw_model.clone();
                record.firmware_version = edit.firmware.clone();
                record.advance_stage(2);
                info!(mac = %edit.mac, ip = %edit.target_ip, "device adopted");
            }
        })
    }

    /// Push the full static station configuration. The protocol
    /// requires SSID, password, address, gateway, netmask and
    /// nameserver together; a partial payload is rejected.
    async fn push_static_config(&self, current_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Result<()> {
        let profile = self
            .wifi_profiles
            .iter()
            .find(|p| !p.is_placeholder())
            .ok_or_else(|| CoreError::Wifi {
                message: "no usable wifi profile for static configuration".into(),
            })?;

        let client = self.factory.client(&current_ip.to_string())?;
        let sta = json!({
            "ssid": profile.ssid,
            "pass": profile.password.expose_secret(),
            "enable": true,
            "ipv4mode": "static",
            "ip": target_ip.to_string(),
            "gw": self.network.gateway.to_string(),
            "netmask": self.network.netmask.to_string(),
            "nameserver": self.network.nameserver.to_string(),
        });

        match client.set_wifi_sta(sta).await {
            Ok(_) => Ok(()),
            // The device applies the new address immediately and drops
            // the connection mid-response; a transient failure here
            // means the change very likely took.
            Err(err) if err.is_transient() => {
                debug!(%current_ip, %target_ip, "connection dropped during re-address, assuming applied");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn wait_for_settle(&self, mac: &MacAddress, ip: Ipv4Addr) {
        for _ in 0..SETTLE_ATTEMPTS {
            tokio::time::sleep(SETTLE_INTERVAL).await;
            if self.probe.is_alive(ip).await {
                debug!(%mac, %ip, "device settled on new address");
                return;
            }
        }
        warn!(%mac, %ip, "device not yet reachable on new address, continuing");
    }
}
