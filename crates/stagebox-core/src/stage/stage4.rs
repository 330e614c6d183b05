// ── Stage 4: device-type configuration ──
//
// Applies a per-model profile through component `SetConfig` calls.
// Multi-profile hardware may need a `Shelly.SetProfile` first, which
// reboots the device. Component writes follow a strict order because
// some `switch.in_mode` values are only valid for certain
// `input.type` values: switches get parked in `detached` before an
// input type change, then covers, inputs, switches, and the rest.

use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use stagebox_rpc::{ClientFactory, Probe, RpcClient};
use tracing::{debug, info, warn};

use crate::config::{DeviceProfile, ProfileKind, Stage4Settings};
use crate::error::Result;
use crate::model::{DeviceRecord, MacAddress, Stage4Status};
use crate::registry::Registry;
use crate::stage::DeviceOutcome;

const REBOOT_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct Stage4Runner<'a> {
    pub registry: &'a Registry,
    pub settings: &'a Stage4Settings,
    pub probe: &'a dyn Probe,
    pub factory: &'a dyn ClientFactory,
    pub dry_run: bool,
}

/// One planned component write.
#[derive(Debug, Clone)]
struct ComponentWrite {
    component: &'static str,
    id: u32,
    config: Value,
}

/// Stage 4 result for one device, persisted by `commit`.
#[derive(Debug, Clone)]
pub struct ConfigureEdit {
    pub mac: MacAddress,
    pub status: Stage4Status,
    pub advance: bool,
}

impl Stage4Runner<'_> {
    /// Configure every registry device (or a single filtered MAC),
    /// ending with exactly one registry save.
    pub async fn run(&self, mac_filter: Option<&MacAddress>) -> Result<Vec<DeviceOutcome>> {
        let snapshot = self.registry.snapshot();
        let mut outcomes = Vec::new();
        let mut edits = Vec::new();
        for (mac, record) in snapshot
            .iter()
            .filter(|(mac, _)| mac_filter.is_none_or(|f| f == *mac))
        {
            let (outcome, edit) = self.configure_one(mac, record).await;
            outcomes.push(outcome);
            edits.extend(edit);
        }
        self.commit(&edits)?;
        Ok(outcomes)
    }

    /// Configure one device. Failures become per-device outcomes; the
    /// returned edit carries what the caller should persist, so a run
    /// can batch every device into one save.
    pub async fn configure_one(
        &self,
        mac: &MacAddress,
        record: &DeviceRecord,
    ) -> (DeviceOutcome, Option<ConfigureEdit>) {
        let (result, ok) = self.apply(mac, record).await;

        let edit = (!self.dry_run).then(|| ConfigureEdit {
            mac: mac.clone(),
            status: Stage4Status {
                profile_applied: if ok { self.profile_name(record) } else { None },
                result: result.clone(),
                last_run: Some(Utc::now()),
            },
            advance: ok && result != "profile_missing",
        });

        let outcome = if ok {
            DeviceOutcome::ok(mac.to_string(), result)
        } else {
            DeviceOutcome::error(mac.to_string(), result)
        };
        (outcome, edit)
    }

    /// Merge every device's stage 4 result into the registry in one
    /// save.
    pub fn commit(&self, edits: &[ConfigureEdit]) -> Result<()> {
        if edits.is_empty() {
            return Ok(());
        }
        self.registry.batch(|devices| {
            for edit in edits {
                let Some(record) = devices.get_mut(&edit.mac) else {
                    continue;
                };
                record.stage4 = Some(edit.status.clone());
                if edit.advance {
                    record.advance_stage(4);
                }
            }
        })
    }

    fn profile_name(&self, record: &DeviceRecord) -> Option<String> {
        record
            .hw_model
            .as_deref()
            .or(record.model.as_deref())
            .filter(|key| self.settings.profiles.contains_key(*key))
            .map(str::to_owned)
    }

    async fn apply(&self, mac: &MacAddress, record: &DeviceRecord) -> (String, bool) {
        let Some(key) = self.profile_name(record) else {
            debug!(%mac, model = ?record.model, "no profile for model, skipping");
            return ("profile_missing".into(), true);
        };
        let Some(profile) = self.settings.profiles.get(&key) else {
            return ("profile_missing".into(), true);
        };
        let Some(ip) = record.ip else {
            return ("error: no address on record".into(), false);
        };

        if self.dry_run {
            return (format!("dry-run: would apply profile {key}"), true);
        }

        let client = match self.factory.client(&ip.to_string()) {
            Ok(client) => client,
            Err(err) => return (format!("error: {err}"), false),
        };

        if let Err(message) = self.ensure_device_profile(mac, &client, profile).await {
            return (format!("error: {message}"), false);
        }

        let writes = Self::plan_writes(profile);
        match self.apply_writes(mac, &client, profile, &writes).await {
            Ok(changed) => (format!("applied {key} ({changed} components)"), true),
            Err(message) => (format!("error: {message}"), false),
        }
    }

    // ── Device profile (switch vs cover hardware mode) ───────────────

    /// Switch the device profile when the target kind demands it,
    /// riding out the reboot `Shelly.SetProfile` forces.
    async fn ensure_device_profile(
        &self,
        mac: &MacAddress,
        client: &RpcClient,
        profile: &DeviceProfile,
    ) -> std::result::Result<(), String> {
        let wanted = match profile.kind {
            ProfileKind::Cover => "cover",
            ProfileKind::Switch => "switch",
            // Light and input-only models have no profile dimension.
            ProfileKind::Light | ProfileKind::InputOnly => return Ok(()),
        };

        let info = client.device_info().await.map_err(|e| e.to_string())?;
        let Some(current) = info.profile else {
            // Single-profile hardware.
            return Ok(());
        };
        if current == wanted {
            return Ok(());
        }

        info!(%mac, from = %current, to = wanted, "switching device profile");
        client
            .set_profile(wanted)
            .await
            .map_err(|e| format!("profile switch rejected: {e}"))?;

        // The device reboots to apply; wait until it answers again.
        let ip = client.host().parse().map_err(|_| "bad host".to_owned())?;
        let deadline = tokio::time::Instant::now() + self.settings.reboot_wait;
        loop {
            tokio::time::sleep(REBOOT_POLL_INTERVAL).await;
            if self.probe.is_alive(ip).await {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err("device did not come back after profile change".into());
            }
        }
    }

    // ── Component planning ───────────────────────────────────────────

    fn plan_writes(profile: &DeviceProfile) -> Vec<ComponentWrite> {
        let mut writes = Vec::new();

        match profile.kind {
            ProfileKind::Switch => {
                let mut config = serde_json::Map::new();
                if let Some(state) = &profile.initial_state {
                    config.insert("initial_state".into(), json!(state));
                }
                if let Some(delay) = profile.auto_off_delay {
                    config.insert("auto_off".into(), json!(true));
                    config.insert("auto_off_delay".into(), json!(delay));
                }
                if let Some(delay) = profile.auto_on_delay {
                    config.insert("auto_on".into(), json!(true));
                    config.insert("auto_on_delay".into(), json!(delay));
                }
                if let Some(mode) = &profile.in_mode {
                    config.insert("in_mode".into(), json!(mode));
                }
                if !config.is_empty() {
                    writes.push(ComponentWrite {
                        component: "Switch",
                        id: 0,
                        config: Value::Object(config),
                    });
                }
            }
            ProfileKind::Cover => {
                let mut config = serde_json::Map::new();
                if let Some(secs) = profile.cover_open_secs {
                    config.insert("maxtime_open".into(), json!(secs));
                }
                if let Some(secs) = profile.cover_close_secs {
                    config.insert("maxtime_close".into(), json!(secs));
                }
                if let Some(invert) = profile.cover_invert_directions {
                    config.insert("invert_directions".into(), json!(invert));
                }
                if !config.is_empty() {
                    writes.push(ComponentWrite {
                        component: "Cover",
                        id: 0,
                        config: Value::Object(config),
                    });
                }
            }
            ProfileKind::Light => {
                let mut config = serde_json::Map::new();
                if let Some(state) = &profile.initial_state {
                    config.insert("initial_state".into(), json!(state));
                }
                if let Some(delay) = profile.auto_off_delay {
                    config.insert("auto_off".into(), json!(true));
                    config.insert("auto_off_delay".into(), json!(delay));
                }
                if !config.is_empty() {
                    writes.push(ComponentWrite {
                        component: "Light",
                        id: 0,
                        config: Value::Object(config),
                    });
                }
            }
            ProfileKind::InputOnly => {}
        }

        let mut input = serde_json::Map::new();
        if let Some(mode) = &profile.input_mode {
            input.insert("type".into(), json!(mode));
        }
        if let Some(invert) = profile.input_invert {
            input.insert("invert".into(), json!(invert));
        }
        if !input.is_empty() {
            writes.push(ComponentWrite {
                component: "Input",
                id: 0,
                config: Value::Object(input),
            });
        }

        writes
    }

    // ── Ordered application ──────────────────────────────────────────

    async fn apply_writes(
        &self,
        mac: &MacAddress,
        client: &RpcClient,
        profile: &DeviceProfile,
        writes: &[ComponentWrite],
    ) -> std::result::Result<usize, String> {
        // Park switches in detached before an input type change so the
        // intermediate state is valid for any input type.
        for write in writes.iter().filter(|w| w.component == "Input") {
            let Some(target_type) = profile.input_mode.as_deref() else {
                continue;
            };
            let current = client.component_config("Input", write.id).await.ok();
            let current_type = current
                .as_ref()
                .and_then(|c| c.get("type"))
                .and_then(Value::as_str);
            let type_changes = current_type.is_some_and(|t| t != target_type);
            let has_switch = writes.iter().any(|w| w.component == "Switch" && w.id == write.id);
            if type_changes && has_switch {
                debug!(%mac, id = write.id, "parking switch in detached for input type change");
                let parked = client
                    .set_component_config(
                        "Switch",
                        write.id,
                        json!({ "in_mode": "detached", "initial_state": "off" }),
                    )
                    .await;
                if let Err(err) = parked {
                    warn!(%mac, %err, "could not park switch, continuing");
                }
            }
        }

        let mut changed = 0;
        for component in ["Cover", "Input", "Switch", "Light"] {
            for write in writes.iter().filter(|w| w.component == component) {
                client
                    .set_component_config(write.component, write.id, write.config.clone())
                    .await
                    .map_err(|e| format!("{}:{} rejected: {e}", write.component, write.id))?;
                debug!(%mac, component = write.component, id = write.id, "component configured");
                changed += 1;
            }
        }
        Ok(changed)
    }
}
