// ── Stage 1: AP onboarding ──
//
// A factory-fresh device broadcasts its own open access point. The
// controller joins it from its wireless interface, reads the device
// identity at the well-known AP address, pushes the production WiFi
// credentials plus service-disable settings, reboots the device and
// waits for it to surface on the production network.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Serialize;
use serde_json::json;
use stagebox_rpc::{ClientFactory, Probe, RpcClient};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Stage1Settings;
use crate::error::{CoreError, Result};
use crate::model::MacAddress;
use crate::registry::Registry;
use crate::stage::DeviceOutcome;

/// Progress of one onboarding cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage1State {
    WaitingForAp,
    ConnectedToAp,
    ReadingInfo,
    ApplyingConfig,
    Rebooting,
    WaitingForNetworkJoin,
    Done,
    Failed,
}

/// A device access point seen in a scan.
#[derive(Debug, Clone)]
pub struct ApCandidate {
    pub ssid: String,
    /// Signal strength percentage; `None` when the scanner did not
    /// report one.
    pub signal: Option<i32>,
}

/// Controller-side WiFi interface control.
///
/// Production uses NetworkManager via `nmcli`; tests substitute a
/// scripted implementation.
#[async_trait]
pub trait WifiStation: Send + Sync {
    /// Scan for visible access points.
    async fn scan(&self) -> Result<Vec<ApCandidate>>;
    /// Join an open access point by SSID.
    async fn connect(&self, ssid: &str) -> Result<()>;
    /// Drop the current association so NetworkManager does not keep
    /// re-joining the device AP.
    async fn disconnect(&self) -> Result<()>;
}

/// `WifiStation` backed by the system `nmcli` binary.
pub struct NmcliStation {
    /// Explicit interface name; autodetected when `None`.
    pub interface: Option<String>,
}

impl NmcliStation {
    pub fn new(interface: Option<String>) -> Self {
        Self { interface }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new("nmcli")
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CoreError::Wifi {
                message: format!("nmcli failed to start: {e}"),
            })?;
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if !output.status.success() {
            return Err(CoreError::Wifi {
                message: format!("nmcli {} failed: {}", args.join(" "), combined.trim()),
            });
        }
        Ok(combined)
    }

    async fn detect_interface(&self) -> Result<String> {
        if let Some(iface) = &self.interface {
            return Ok(iface.clone());
        }
        let out = self.run(&["-t", "-f", "DEVICE,TYPE", "device", "status"]).await?;
        for line in out.lines() {
            let mut parts = line.trim().split(':');
            if let (Some(dev), Some("wifi")) = (parts.next(), parts.next()) {
                if !dev.is_empty() {
                    return Ok(dev.to_owned());
                }
            }
        }
        Err(CoreError::Wifi {
            message: "no wifi interface found".into(),
        })
    }
}

#[async_trait]
impl WifiStation for NmcliStation {
    async fn scan(&self) -> Result<Vec<ApCandidate>> {
        let mut args = vec!["-t", "-f", "SSID,SIGNAL", "device", "wifi", "list"];
        if let Some(iface) = &self.interface {
            args.push("ifname");
            args.push(iface);
        }
        let out = self.run(&args).await?;

        let mut candidates = Vec::new();
        for line in out.lines() {
            let mut parts = line.trim().rsplitn(2, ':');
            let signal = parts.next().and_then(|s| s.parse::<i32>().ok());
            let Some(ssid) = parts.next() else { continue };
            if ssid.is_empty() {
                continue;
            }
            candidates.push(ApCandidate {
                ssid: ssid.to_owned(),
                signal,
            });
        }
        Ok(candidates)
    }

    async fn connect(&self, ssid: &str) -> Result<()> {
        let iface = self.detect_interface().await?;
        self.run(&["device", "wifi", "connect", ssid, "ifname", &iface])
            .await?;
        // nmcli returns before DHCP on the AP side has fully settled.
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let iface = self.detect_interface().await?;
        self.run(&["device", "disconnect", &iface]).await?;
        Ok(())
    }
}

/// Outcome of one onboarding cycle.
#[derive(Debug)]
pub enum CycleOutcome {
    /// No candidate AP was visible or connectable.
    NothingFound,
    /// One device was processed.
    Provisioned(CycleReport),
}

/// Per-cycle report: the state the machine ended in plus the device
/// outcome.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub state: Stage1State,
    pub outcome: DeviceOutcome,
}

pub struct Stage1Runner<'a> {
    pub registry: &'a Registry,
    pub settings: &'a Stage1Settings,
    pub station: &'a dyn WifiStation,
    pub probe: &'a dyn Probe,
    pub factory: &'a dyn ClientFactory,
    pub dry_run: bool,
    /// Optional filter: only provision the device with this MAC.
    pub mac_filter: Option<MacAddress>,
}

impl Stage1Runner<'_> {
    /// Run cycles until cancelled. Each cycle provisions at most one
    /// device; idle cycles sleep before rescanning. Cancellation is
    /// honored between cycles, never mid-cycle, so an in-flight
    /// provisioning always finishes and reaches the registry.
    pub async fn run_loop(&self, cancel: CancellationToken) -> Result<Vec<CycleReport>> {
        let mut reports = Vec::new();
        info!("stage 1 loop started");
        while !cancel.is_cancelled() {
            match self.run_once().await? {
                CycleOutcome::Provisioned(report) => reports.push(report),
                CycleOutcome::NothingFound => {
                    debug!("no new device ready, idling");
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(self.settings.idle_delay) => {}
                    }
                }
            }
        }
        info!(processed = reports.len(), "stage 1 loop stopped");
        Ok(reports)
    }

    /// One full onboarding cycle.
    pub async fn run_once(&self) -> Result<CycleOutcome> {
        let mut state = Stage1State::WaitingForAp;
        debug!(?state, "scanning for device APs");

        let aps = self.find_candidate_aps().await?;
        if aps.is_empty() {
            let _ = self.station.disconnect().await;
            return Ok(CycleOutcome::NothingFound);
        }

        // Strongest signal first; first connectable AP wins.
        let mut joined = None;
        for ap in &aps {
            debug!(ssid = %ap.ssid, signal = ?ap.signal, "trying candidate AP");
            match self.station.connect(&ap.ssid).await {
                Ok(()) => {
                    joined = Some(ap.ssid.clone());
                    state = Stage1State::ConnectedToAp;
                    break;
                }
                Err(err) => warn!(ssid = %ap.ssid, %err, "AP connect failed"),
            }
        }
        let Some(ssid) = joined else {
            let _ = self.station.disconnect().await;
            return Ok(CycleOutcome::NothingFound);
        };

        let outcome = self.provision_joined(&ssid, &mut state).await;

        // Always drop the association, even on failure, so the next
        // cycle scans from a clean slate.
        if let Err(err) = self.station.disconnect().await {
            warn!(%err, "wifi disconnect failed");
        }

        match outcome {
            Ok(outcome) => Ok(CycleOutcome::Provisioned(CycleReport { state, outcome })),
            Err(err) => {
                state = Stage1State::Failed;
                debug!(?state, "cycle failed");
                Ok(CycleOutcome::Provisioned(CycleReport {
                    state,
                    outcome: DeviceOutcome::error(ssid, err.to_string()),
                }))
            }
        }
    }

    async fn find_candidate_aps(&self) -> Result<Vec<ApCandidate>> {
        let prefix = self.settings.ap_ssid_prefix.to_ascii_lowercase();
        let mut aps: Vec<ApCandidate> = self
            .station
            .scan()
            .await?
            .into_iter()
            .filter(|ap| ap.ssid.to_ascii_lowercase().starts_with(&prefix))
            .collect();
        aps.sort_by_key(|ap| std::cmp::Reverse(ap.signal.unwrap_or(i32::MIN)));
        aps.dedup_by(|a, b| a.ssid == b.ssid);
        Ok(aps)
    }

    async fn provision_joined(
        &self,
        ssid: &str,
        state: &mut Stage1State,
    ) -> Result<DeviceOutcome> {
        *state = Stage1State::ReadingInfo;
        let client = self
            .factory
            .client(&self.settings.device_ap_ip.to_string())?;

        let info = client.device_info().await?;
        let mac = MacAddress::parse(&info.mac)?;
        info!(%mac, model = %info.model, fw = ?info.ver, ssid, "device identified on AP");

        if let Some(filter) = &self.mac_filter {
            if filter != &mac {
                *state = Stage1State::Done;
                return Ok(DeviceOutcome::ok(
                    mac.to_string(),
                    format!("skipped (filter wants {filter})"),
                ));
            }
        }

        if self.dry_run {
            *state = Stage1State::Done;
            return Ok(DeviceOutcome::ok(
                mac.to_string(),
                format!("dry-run: identified {} fw {:?}", info.model, info.ver),
            ));
        }

        *state = Stage1State::ApplyingConfig;
        self.push_wifi_profiles(&client).await?;
        self.apply_disable_flags(&client).await;

        *state = Stage1State::Rebooting;
        if let Err(err) = client.reboot().await {
            // Devices often drop the AP before answering the reboot
            // call; that counts as success.
            if !err.is_transient() {
                return Err(err.into());
            }
        }

        *state = Stage1State::WaitingForNetworkJoin;
        self.wait_for_network_join(&mac).await;

        self.registry.update(&mac, |record| {
            record.model = Some(info.model.clone());
            record.hw_model = info.app.clone();
            record.firmware_version = info.ver.clone();
            record.advance_stage(1);
        })?;

        *state = Stage1State::Done;
        Ok(DeviceOutcome::ok(
            mac.to_string(),
            format!("onboarded {} via {ssid}", info.model),
        ))
    }

    /// Write the real credential sets so the device can fail over
    /// between networks. The firmware has exactly two station slots;
    /// profiles beyond that are ignored with a warning.
    async fn push_wifi_profiles(&self, client: &RpcClient) -> Result<()> {
        let mut slot = 0;
        for profile in &self.settings.wifi_profiles {
            if profile.is_placeholder() {
                continue;
            }
            let key = match slot {
                0 => "sta",
                1 => "sta1",
                _ => {
                    warn!(ssid = %profile.ssid, "device holds only two station slots, profile ignored");
                    continue;
                }
            };
            let payload = json!({
                "config": { key: {
                    "ssid": profile.ssid,
                    "pass": profile.password.expose_secret(),
                    "enable": true,
                }}
            });
            client.call("Wifi.SetConfig", Some(payload)).await?;
            debug!(slot, ssid = %profile.ssid, "wifi profile written");
            slot += 1;
        }
        if slot == 0 {
            return Err(CoreError::Wifi {
                message: "no usable wifi profiles configured".into(),
            });
        }
        Ok(())
    }

    /// Service disables are best-effort; a failed one is logged, not
    /// fatal, since the device is still perfectly adoptable.
    async fn apply_disable_flags(&self, client: &RpcClient) {
        if self.settings.disable_cloud {
            if let Err(err) = client.disable_cloud().await {
                warn!(%err, "cloud disable failed");
            }
        }
        if self.settings.disable_ble {
            if let Err(err) = client.disable_ble().await {
                warn!(%err, "ble disable failed");
            }
        }
        if self.settings.disable_mqtt {
            if let Err(err) = client.disable_mqtt().await {
                warn!(%err, "mqtt disable failed");
            }
        }
        if self.settings.disable_ap {
            if let Err(err) = client.disable_ap().await {
                warn!(%err, "ap disable failed");
            }
        }
    }

    /// Poll the production network until the device appears or the
    /// window closes. Best-effort: Stage 2 owns address management.
    async fn wait_for_network_join(&self, mac: &MacAddress) {
        const ATTEMPTS: u32 = 15;
        let known_ip = self.registry.get(mac).and_then(|r| r.ip);
        let Some(ip) = known_ip else {
            debug!(%mac, "no known address yet, skipping join wait");
            return;
        };
        for _ in 0..ATTEMPTS {
            tokio::time::sleep(Duration::from_secs(2)).await;
            if self.probe.is_alive(ip).await {
                info!(%mac, %ip, "device joined production network");
                return;
            }
        }
        warn!(%mac, %ip, "device did not reappear within the join window");
    }
}
