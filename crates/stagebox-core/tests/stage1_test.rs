// Stage 1 onboarding cycles with a scripted wifi station and a mock
// device behind the AP address.

use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use stagebox_core::config::{Stage1Settings, WifiProfile};
use stagebox_core::model::MacAddress;
use stagebox_core::registry::Registry;
use stagebox_core::stage::stage1::{
    ApCandidate, CycleOutcome, Stage1Runner, Stage1State, WifiStation,
};
use tokio_util::sync::CancellationToken;
use stagebox_rpc::{FixedUrlFactory, Probe, RpcOptions};
use tempfile::TempDir;

// ── Scripted doubles ────────────────────────────────────────────────

struct ScriptedStation {
    aps: Vec<ApCandidate>,
    refuse_connect: bool,
    connected: Mutex<Vec<String>>,
    disconnects: Mutex<u32>,
}

impl ScriptedStation {
    fn seeing(aps: Vec<ApCandidate>) -> Self {
        Self {
            aps,
            refuse_connect: false,
            connected: Mutex::new(Vec::new()),
            disconnects: Mutex::new(0),
        }
    }
}

#[async_trait]
impl WifiStation for ScriptedStation {
    async fn scan(&self) -> stagebox_core::Result<Vec<ApCandidate>> {
        Ok(self.aps.clone())
    }

    async fn connect(&self, ssid: &str) -> stagebox_core::Result<()> {
        if self.refuse_connect {
            return Err(stagebox_core::CoreError::Wifi {
                message: format!("association with {ssid} refused"),
            });
        }
        self.connected.lock().unwrap().push(ssid.to_owned());
        Ok(())
    }

    async fn disconnect(&self) -> stagebox_core::Result<()> {
        *self.disconnects.lock().unwrap() += 1;
        Ok(())
    }
}

struct NeverAlive;

#[async_trait]
impl Probe for NeverAlive {
    async fn is_alive(&self, _ip: Ipv4Addr) -> bool {
        false
    }
}

fn ap(ssid: &str, signal: i32) -> ApCandidate {
    ApCandidate {
        ssid: ssid.into(),
        signal: Some(signal),
    }
}

fn settings() -> Stage1Settings {
    Stage1Settings {
        wifi_profiles: vec![WifiProfile {
            ssid: "fleet-net".into(),
            password: SecretString::from("hunter2hunter2"),
        }],
        disable_mqtt: false,
        idle_delay: Duration::from_millis(10),
        ..Stage1Settings::default()
    }
}

fn factory_for(server: &MockServer) -> FixedUrlFactory {
    FixedUrlFactory {
        base_url: Url::parse(&server.uri()).unwrap(),
        options: RpcOptions::default(),
    }
}

async fn mount_fresh_device(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({ "method": "Shelly.GetDeviceInfo" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 1,
            "result": {
                "id": "shelly1pmminig3-543204aabbcc",
                "mac": "543204AABBCC",
                "model": "S3SW-001P8EU",
                "gen": 3,
                "ver": "1.4.4",
                "app": "Mini1PMG3"
            }
        })))
        .mount(server)
        .await;
    // Credential write, AP disable, cloud/ble disables and reboot all
    // answer with an empty result.
    for rpc_method in [
        "Wifi.SetConfig",
        "Cloud.SetConfig",
        "BLE.SetConfig",
        "Shelly.Reboot",
    ] {
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(body_partial_json(json!({ "method": rpc_method })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "id": 1, "result": null })),
            )
            .mount(server)
            .await;
    }
}

// ── Cycles ──────────────────────────────────────────────────────────

#[tokio::test]
async fn onboards_a_fresh_device() {
    let server = MockServer::start().await;
    mount_fresh_device(&server).await;
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).unwrap();
    let settings = settings();
    let factory = factory_for(&server);
    let station = ScriptedStation::seeing(vec![
        ap("ShellyMini1PMG3-543204AABBCC", 55),
        ap("neighbour-net", 90),
    ]);

    let runner = Stage1Runner {
        registry: &registry,
        settings: &settings,
        station: &station,
        probe: &NeverAlive,
        factory: &factory,
        dry_run: false,
        mac_filter: None,
    };

    let CycleOutcome::Provisioned(report) = runner.run_once().await.unwrap() else {
        panic!("expected a provisioned device");
    };
    assert_eq!(report.state, Stage1State::Done);
    let outcome = report.outcome;
    assert!(outcome.ok, "{}", outcome.message);
    assert!(outcome.message.contains("onboarded S3SW-001P8EU"));

    // Only the device AP was joined, and it was dropped afterwards.
    assert_eq!(
        *station.connected.lock().unwrap(),
        vec!["ShellyMini1PMG3-543204AABBCC".to_owned()]
    );
    assert_eq!(*station.disconnects.lock().unwrap(), 1);

    let mac = MacAddress::parse("543204AABBCC").unwrap();
    let record = registry.get(&mac).unwrap();
    assert_eq!(record.stage_completed, 1);
    assert_eq!(record.model.as_deref(), Some("S3SW-001P8EU"));
    assert_eq!(record.hw_model.as_deref(), Some("Mini1PMG3"));

    // The credential write carried the real profile.
    let wrote_credentials = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter_map(|r| serde_json::from_slice::<serde_json::Value>(&r.body).ok())
        .any(|body| {
            body["method"] == "Wifi.SetConfig"
                && body["params"]["config"]["sta"]["ssid"] == "fleet-net"
        });
    assert!(wrote_credentials);
}

#[tokio::test]
async fn strongest_matching_ap_is_tried_first() {
    let server = MockServer::start().await;
    mount_fresh_device(&server).await;
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).unwrap();
    let settings = settings();
    let factory = factory_for(&server);
    let station = ScriptedStation::seeing(vec![
        ap("ShellyMini1PMG3-543204AABB01", 30),
        ap("ShellyMini1PMG3-543204AABBCC", 80),
    ]);

    let runner = Stage1Runner {
        registry: &registry,
        settings: &settings,
        station: &station,
        probe: &NeverAlive,
        factory: &factory,
        dry_run: false,
        mac_filter: None,
    };

    runner.run_once().await.unwrap();
    assert_eq!(
        station.connected.lock().unwrap().first().map(String::as_str),
        Some("ShellyMini1PMG3-543204AABBCC")
    );
}

#[tokio::test]
async fn no_matching_ap_means_nothing_found() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).unwrap();
    let settings = settings();
    let factory = factory_for(&server);
    let station = ScriptedStation::seeing(vec![ap("neighbour-net", 90), ap("printer-ap", 40)]);

    let runner = Stage1Runner {
        registry: &registry,
        settings: &settings,
        station: &station,
        probe: &NeverAlive,
        factory: &factory,
        dry_run: false,
        mac_filter: None,
    };

    assert!(matches!(
        runner.run_once().await.unwrap(),
        CycleOutcome::NothingFound
    ));
    assert!(station.connected.lock().unwrap().is_empty());
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn unconnectable_aps_end_the_cycle_quietly() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).unwrap();
    let settings = settings();
    let factory = factory_for(&server);
    let mut station = ScriptedStation::seeing(vec![ap("ShellyMini1PMG3-543204AABBCC", 80)]);
    station.refuse_connect = true;

    let runner = Stage1Runner {
        registry: &registry,
        settings: &settings,
        station: &station,
        probe: &NeverAlive,
        factory: &factory,
        dry_run: false,
        mac_filter: None,
    };

    assert!(matches!(
        runner.run_once().await.unwrap(),
        CycleOutcome::NothingFound
    ));
}

#[tokio::test]
async fn dry_run_identifies_without_configuring() {
    let server = MockServer::start().await;
    mount_fresh_device(&server).await;
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).unwrap();
    let settings = settings();
    let factory = factory_for(&server);
    let station = ScriptedStation::seeing(vec![ap("ShellyMini1PMG3-543204AABBCC", 80)]);

    let runner = Stage1Runner {
        registry: &registry,
        settings: &settings,
        station: &station,
        probe: &NeverAlive,
        factory: &factory,
        dry_run: true,
        mac_filter: None,
    };

    let CycleOutcome::Provisioned(report) = runner.run_once().await.unwrap() else {
        panic!("expected a provisioned device");
    };
    assert_eq!(report.state, Stage1State::Done);
    assert!(report.outcome.ok);
    assert!(report.outcome.message.starts_with("dry-run:"));
    assert!(registry.is_empty());

    // Identification only: exactly one request, no config writes.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
}

#[tokio::test]
async fn mac_filter_skips_other_devices() {
    let server = MockServer::start().await;
    mount_fresh_device(&server).await;
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).unwrap();
    let settings = settings();
    let factory = factory_for(&server);
    let station = ScriptedStation::seeing(vec![ap("ShellyMini1PMG3-543204AABBCC", 80)]);

    let runner = Stage1Runner {
        registry: &registry,
        settings: &settings,
        station: &station,
        probe: &NeverAlive,
        factory: &factory,
        dry_run: false,
        mac_filter: Some(MacAddress::parse("543204000000").unwrap()),
    };

    let CycleOutcome::Provisioned(report) = runner.run_once().await.unwrap() else {
        panic!("expected an outcome");
    };
    assert!(report.outcome.ok);
    assert!(report.outcome.message.contains("skipped"));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn third_wifi_profile_is_dropped_not_overwritten() {
    let server = MockServer::start().await;
    mount_fresh_device(&server).await;
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).unwrap();
    let mut settings = settings();
    settings.wifi_profiles = vec![
        WifiProfile {
            ssid: "fleet-net".into(),
            password: SecretString::from("hunter2hunter2"),
        },
        WifiProfile {
            ssid: "fleet-net-fallback".into(),
            password: SecretString::from("hunter2hunter2"),
        },
        WifiProfile {
            ssid: "one-too-many".into(),
            password: SecretString::from("hunter2hunter2"),
        },
    ];
    let factory = factory_for(&server);
    let station = ScriptedStation::seeing(vec![ap("ShellyMini1PMG3-543204AABBCC", 80)]);

    let runner = Stage1Runner {
        registry: &registry,
        settings: &settings,
        station: &station,
        probe: &NeverAlive,
        factory: &factory,
        dry_run: false,
        mac_filter: None,
    };

    let CycleOutcome::Provisioned(report) = runner.run_once().await.unwrap() else {
        panic!("expected a provisioned device");
    };
    assert!(report.outcome.ok, "{}", report.outcome.message);

    // The firmware has two station slots; the first two profiles land
    // in sta and sta1 and the third is never written anywhere.
    let credential_writes: Vec<serde_json::Value> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter_map(|r| serde_json::from_slice::<serde_json::Value>(&r.body).ok())
        .filter(|body| {
            body["method"] == "Wifi.SetConfig"
                && (body["params"]["config"]["sta"].is_object()
                    || body["params"]["config"]["sta1"].is_object())
        })
        .collect();
    assert_eq!(credential_writes.len(), 2);
    assert_eq!(
        credential_writes[0]["params"]["config"]["sta"]["ssid"],
        "fleet-net"
    );
    assert_eq!(
        credential_writes[1]["params"]["config"]["sta1"]["ssid"],
        "fleet-net-fallback"
    );
    for body in &credential_writes {
        assert!(!body.to_string().contains("one-too-many"));
    }
}

#[tokio::test]
async fn cancellation_lets_the_running_cycle_finish() {
    struct CancelDuringScan {
        inner: ScriptedStation,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl WifiStation for CancelDuringScan {
        async fn scan(&self) -> stagebox_core::Result<Vec<ApCandidate>> {
            // Operator hits ctrl-c while the scan is in flight.
            self.cancel.cancel();
            self.inner.scan().await
        }

        async fn connect(&self, ssid: &str) -> stagebox_core::Result<()> {
            self.inner.connect(ssid).await
        }

        async fn disconnect(&self) -> stagebox_core::Result<()> {
            self.inner.disconnect().await
        }
    }

    let server = MockServer::start().await;
    mount_fresh_device(&server).await;
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).unwrap();
    let settings = settings();
    let factory = factory_for(&server);
    let cancel = CancellationToken::new();
    let station = CancelDuringScan {
        inner: ScriptedStation::seeing(vec![ap("ShellyMini1PMG3-543204AABBCC", 80)]),
        cancel: cancel.clone(),
    };

    let runner = Stage1Runner {
        registry: &registry,
        settings: &settings,
        station: &station,
        probe: &NeverAlive,
        factory: &factory,
        dry_run: false,
        mac_filter: None,
    };

    let reports = runner.run_loop(cancel).await.unwrap();

    // The in-flight cycle ran to completion and reached the registry;
    // the loop stopped before starting another one.
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].state, Stage1State::Done);
    assert!(reports[0].outcome.ok, "{}", reports[0].outcome.message);
    let mac = MacAddress::parse("543204AABBCC").unwrap();
    assert_eq!(registry.get(&mac).unwrap().stage_completed, 1);
}
