// Typed wrappers for the RPC methods the pipeline uses.
//
// Read-style methods decode into the structs in `types.rs`; setters
// return the raw answer since devices rarely put anything useful in it.

use std::time::Duration;

use serde_json::{Value, json};

use crate::client::RpcClient;
use crate::error::Error;
use crate::types::{DeviceInfo, KvsPage, SysConfig, UpdateReport, WebhookList, WifiConfig};

impl RpcClient {
    // ── Identity ─────────────────────────────────────────────────────

    /// `Shelly.GetDeviceInfo`
    pub async fn device_info(&self) -> Result<DeviceInfo, Error> {
        let value = self.call("Shelly.GetDeviceInfo", None).await?;
        Self::decode(value)
    }

    /// `Sys.GetConfig`
    pub async fn sys_config(&self) -> Result<SysConfig, Error> {
        let value = self.call("Sys.GetConfig", None).await?;
        Self::decode(value)
    }

    /// `Sys.SetConfig` with a new device name.
    ///
    /// Sent GET-style so the `config` parameter rides in the query
    /// string as compact JSON; see `call_query` for why.
    pub async fn set_device_name(&self, name: &str) -> Result<(), Error> {
        let config = json!({ "device": { "name": name } });
        self.call_query("Sys.SetConfig", &[("config", config)])
            .await?;
        Ok(())
    }

    // ── WiFi ─────────────────────────────────────────────────────────

    /// `Wifi.GetConfig`
    pub async fn wifi_config(&self) -> Result<WifiConfig, Error> {
        let value = self.call("Wifi.GetConfig", None).await?;
        Self::decode(value)
    }

    /// `Wifi.SetConfig` for the primary station slot.
    pub async fn set_wifi_sta(&self, sta: Value) -> Result<Value, Error> {
        self.call("Wifi.SetConfig", Some(json!({ "config": { "sta": sta } })))
            .await
    }

    /// `Wifi.SetConfig` disabling the device access point.
    pub async fn disable_ap(&self) -> Result<Value, Error> {
        self.call(
            "Wifi.SetConfig",
            Some(json!({ "config": { "ap": { "enable": false } } })),
        )
        .await
    }

    // ── Radios and cloud ─────────────────────────────────────────────

    /// `Cloud.SetConfig` with `enable: false`.
    pub async fn disable_cloud(&self) -> Result<Value, Error> {
        self.call(
            "Cloud.SetConfig",
            Some(json!({ "config": { "enable": false } })),
        )
        .await
    }

    /// `BLE.SetConfig` with `enable: false`.
    pub async fn disable_ble(&self) -> Result<Value, Error> {
        self.call(
            "BLE.SetConfig",
            Some(json!({ "config": { "enable": false } })),
        )
        .await
    }

    /// `MQTT.SetConfig` with `enable: false`.
    pub async fn disable_mqtt(&self) -> Result<Value, Error> {
        self.call(
            "MQTT.SetConfig",
            Some(json!({ "config": { "enable": false } })),
        )
        .await
    }

    // ── Firmware ─────────────────────────────────────────────────────

    /// `Shelly.CheckForUpdate`. Needs a generous timeout since the
    /// device consults the vendor cloud before answering.
    pub async fn check_for_update(&self, timeout: Duration) -> Result<UpdateReport, Error> {
        let value = self
            .call_query_with_timeout("Shelly.CheckForUpdate", &[], timeout)
            .await?;
        if value.is_null() {
            return Ok(UpdateReport::default());
        }
        Self::decode(value)
    }

    /// `Shelly.Update` on the given channel (`stable` only, in practice).
    pub async fn trigger_update(&self, stage: &str, timeout: Duration) -> Result<(), Error> {
        self.call_query_with_timeout(
            "Shelly.Update",
            &[("stage", Value::String(stage.to_owned()))],
            timeout,
        )
        .await?;
        Ok(())
    }

    // ── Profile and lifecycle ────────────────────────────────────────

    /// `Shelly.SetProfile`. The device reboots itself to apply.
    pub async fn set_profile(&self, name: &str) -> Result<Value, Error> {
        self.call("Shelly.SetProfile", Some(json!({ "name": name })))
            .await
    }

    /// `Shelly.Reboot`
    pub async fn reboot(&self) -> Result<(), Error> {
        self.call("Shelly.Reboot", None).await?;
        Ok(())
    }

    // ── Components ───────────────────────────────────────────────────

    /// `<Component>.GetConfig` for one channel, e.g. `Switch.GetConfig`
    /// with `{"id": 0}`.
    pub async fn component_config(&self, component: &str, id: u32) -> Result<Value, Error> {
        self.call(&format!("{component}.GetConfig"), Some(json!({ "id": id })))
            .await
    }

    /// `<Component>.SetConfig` for one channel.
    pub async fn set_component_config(
        &self,
        component: &str,
        id: u32,
        config: Value,
    ) -> Result<Value, Error> {
        self.call(
            &format!("{component}.SetConfig"),
            Some(json!({ "id": id, "config": config })),
        )
        .await
    }

    /// `Shelly.GetConfig` — the full device configuration tree.
    pub async fn full_config(&self) -> Result<Value, Error> {
        self.call("Shelly.GetConfig", None).await
    }

    /// `Shelly.GetStatus` — the full device status tree.
    pub async fn full_status(&self) -> Result<Value, Error> {
        self.call("Shelly.GetStatus", None).await
    }

    // ── Key-value store ──────────────────────────────────────────────

    /// One page of `KVS.GetMany` starting at `offset`.
    pub async fn kvs_page(&self, offset: u64) -> Result<KvsPage, Error> {
        let value = self
            .call(
                "KVS.GetMany",
                Some(json!({ "match": "*", "offset": offset })),
            )
            .await?;
        Self::decode(value)
    }

    /// All KVS entries, following pagination until exhausted.
    pub async fn kvs_all(&self) -> Result<KvsPage, Error> {
        let mut merged = KvsPage::default();
        let mut offset = 0;
        loop {
            let page = self.kvs_page(offset).await?;
            merged.total = page.total;
            offset += page.items.len() as u64;
            let before = merged.items.len();
            merged.items.extend(page.items);
            // Stop on an empty or fully-duplicate page so a firmware
            // with a broken `total` cannot loop us forever.
            if merged.items.len() == before || offset >= merged.total {
                break;
            }
        }
        Ok(merged)
    }

    /// `KVS.Get` for a single key.
    pub async fn kvs_get(&self, key: &str) -> Result<Value, Error> {
        self.call("KVS.Get", Some(json!({ "key": key }))).await
    }

    /// `KVS.Set`
    pub async fn kvs_set(&self, key: &str, value: Value) -> Result<Value, Error> {
        self.call("KVS.Set", Some(json!({ "key": key, "value": value })))
            .await
    }

    // ── Automation ───────────────────────────────────────────────────

    /// `Webhook.List`
    pub async fn webhook_list(&self) -> Result<WebhookList, Error> {
        let value = self.call("Webhook.List", None).await?;
        Self::decode(value)
    }

    /// `Schedule.List`
    pub async fn schedule_list(&self) -> Result<Value, Error> {
        self.call("Schedule.List", None).await
    }
}
