// ── Stage 3: OTA and naming ──
//
// Per device: reachability check, firmware update handling, friendly
// name reconciliation. Unreachable devices are marked offline and
// skipped; the whole run persists its registry changes in one batch.

use std::collections::BTreeMap;

use chrono::Utc;
use stagebox_rpc::types::UpdateReport;
use stagebox_rpc::{ClientFactory, Probe, RpcClient};
use tracing::{debug, info, warn};

use crate::config::{FriendlySettings, NameSource, NamingPolicy, OtaMode, OtaSettings};
use crate::error::Result;
use crate::model::{DeviceRecord, MacAddress, Stage3Status};
use crate::registry::Registry;
use crate::stage::DeviceOutcome;

pub struct Stage3Runner<'a> {
    pub registry: &'a Registry,
    pub ota: &'a OtaSettings,
    pub friendly: &'a FriendlySettings,
    pub probe: &'a dyn Probe,
    pub factory: &'a dyn ClientFactory,
    pub dry_run: bool,
}

/// Result of one device's pass, before registry merge.
#[derive(Debug, Clone)]
struct DevicePass {
    ota_status: String,
    /// `None` leaves the previous friendly status untouched (offline
    /// devices keep whatever the last run recorded).
    friendly_status: Option<String>,
    reached: bool,
}

impl Stage3Runner<'_> {
    /// Run over every registry device (or a single filtered MAC),
    /// ending with exactly one persist.
    pub async fn run(&self, mac_filter: Option<&MacAddress>) -> Result<Vec<DeviceOutcome>> {
        let snapshot = self.registry.snapshot();
        let targets: Vec<(MacAddress, DeviceRecord)> = snapshot
            .into_iter()
            .filter(|(mac, _)| mac_filter.is_none_or(|f| f == mac))
            .collect();

        let mut outcomes = Vec::with_capacity(targets.len());
        let mut passes: BTreeMap<MacAddress, DevicePass> = BTreeMap::new();

        for (mac, record) in &targets {
            let pass = self.process_device(mac, record).await;
            outcomes.push(Self::outcome_for(mac, &pass));
            passes.insert(mac.clone(), pass);
        }

        if !self.dry_run {
            let now = Utc::now();
            self.registry.batch(|devices| {
                for (mac, pass) in &passes {
                    let Some(record) = devices.get_mut(mac) else {
                        continue;
                    };
                    let previous = record.stage3.take().unwrap_or_default();
                    record.stage3 = Some(Stage3Status {
                        ota_status: pass.ota_status.clone(),
                        friendly_status: pass
                            .friendly_status
                            .clone()
                            .unwrap_or(previous.friendly_status),
                        last_run: Some(now),
                    });
                    if pass.reached {
                        record.advance_stage(3);
                        record.touch(now);
                    }
                }
            })?;
        }

        Ok(outcomes)
    }

    // Offline is a recorded skip, not a hard error; RPC failures on a
    // reachable device are reported as errors so the run fails.
    fn outcome_for(mac: &MacAddress, pass: &DevicePass) -> DeviceOutcome {
        let friendly = pass.friendly_status.as_deref().unwrap_or("unchanged");
        let message = format!("ota={} friendly={friendly}", pass.ota_status);
        if Self::is_hard_failure(&pass.ota_status) || Self::is_hard_failure(friendly) {
            DeviceOutcome::error(mac.to_string(), message)
        } else {
            DeviceOutcome::ok(mac.to_string(), message)
        }
    }

    fn is_hard_failure(status: &str) -> bool {
        status.starts_with("error:")
            || status.starts_with("check_failed:")
            || status.starts_with("update_failed:")
    }

    async fn process_device(&self, mac: &MacAddress, record: &DeviceRecord) -> DevicePass {
        let Some(ip) = record.ip else {
            return DevicePass {
                ota_status: "offline".into(),
                friendly_status: None,
                reached: false,
            };
        };

        if !self.probe.is_alive(ip).await {
            debug!(%mac, %ip, "device offline, skipping stage 3");
            return DevicePass {
                ota_status: "offline".into(),
                friendly_status: None,
                reached: false,
            };
        }

        let client = match self.factory.client(&ip.to_string()) {
            Ok(client) => client,
            Err(err) => {
                return DevicePass {
                    ota_status: format!("error: {err}"),
                    friendly_status: None,
                    reached: false,
                };
            }
        };

        let ota_status = if self.ota.enabled {
            self.handle_ota(mac, &client).await
        } else {
            "disabled".into()
        };

        let friendly_status = if self.friendly.enabled {
            Some(self.handle_friendly(mac, record, &client).await)
        } else {
            Some("disabled".into())
        };

        DevicePass {
            ota_status,
            friendly_status,
            reached: true,
        }
    }

    // ── OTA ──────────────────────────────────────────────────────────

    async fn handle_ota(&self, mac: &MacAddress, client: &RpcClient) -> String {
        let report: UpdateReport = match client.check_for_update(self.ota.check_timeout).await {
            Ok(report) => report,
            Err(err) => return format!("check_failed: {err}"),
        };

        if report.is_up_to_date() {
            return "up_to_date".into();
        }
        if report.beta_only() {
            // Beta builds are never installed by the pipeline.
            return "skipped (beta only)".into();
        }

        let version = report.stable_version().unwrap_or("unknown").to_owned();

        match self.ota.mode {
            OtaMode::CheckOnly => format!("update_available ({version})"),
            OtaMode::CheckAndUpdate => {
                if self.dry_run {
                    return format!("update_available ({version})");
                }
                match client.trigger_update("stable", self.ota.update_timeout).await {
                    Ok(()) => {
                        info!(%mac, %version, "firmware update triggered");
                        // The install is asynchronous on the device; a
                        // later run observes up_to_date.
                        format!("updating ({version})")
                    }
                    Err(err) => format!("update_failed: {err}"),
                }
            }
        }
    }

    // ── Friendly name ────────────────────────────────────────────────

    async fn handle_friendly(
        &self,
        mac: &MacAddress,
        record: &DeviceRecord,
        client: &RpcClient,
    ) -> String {
        let desired = match self.friendly.source {
            NameSource::FriendlyName => record.friendly_name.clone(),
            NameSource::Room => record.room.clone(),
            NameSource::Location => record.location.clone(),
            NameSource::Hostname => record.hostname.clone(),
        };
        let Some(desired) = desired.filter(|n| !n.trim().is_empty()) else {
            return "no_value".into();
        };

        // Failing to read the current name never blocks the write.
        let current = match client.sys_config().await {
            Ok(cfg) => cfg.device.name,
            Err(err) => {
                warn!(%mac, %err, "could not read current device name");
                None
            }
        };

        if self.friendly.policy == NamingPolicy::DeviceIsMaster {
            if let Some(existing) = current.as_deref().filter(|n| !n.trim().is_empty()) {
                debug!(%mac, existing, "keeping device-side name");
                return "kept_device_name".into();
            }
        }

        if current.as_deref() == Some(desired.as_str()) {
            return "ok".into();
        }
        if self.dry_run {
            return format!("would_set ({desired})");
        }
        match client.set_device_name(&desired).await {
            Ok(()) => {
                info!(%mac, name = %desired, "device name written");
                "ok".into()
            }
            Err(err) => format!("error: {err}"),
        }
    }
}
