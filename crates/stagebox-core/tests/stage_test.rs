// Stage 2 and stage 3 behavior against a mock device, wired through
// `FixedUrlFactory` so every device address lands on the same server.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use stagebox_core::config::{
    DeviceProfile, FriendlySettings, HostnameRules, NameSource, NamingPolicy, NetworkSettings,
    OtaMode, OtaSettings, ProfileKind, Stage4Settings, WifiProfile,
};
use stagebox_core::model::{MacAddress, Stage3Status};
use stagebox_core::pool::IpPool;
use stagebox_core::registry::Registry;
use stagebox_core::scan::DiscoveredDevice;
use stagebox_core::stage::stage2::Stage2Runner;
use stagebox_core::stage::stage3::Stage3Runner;
use stagebox_core::stage::stage4::Stage4Runner;
use stagebox_rpc::types::DeviceInfo;
use stagebox_rpc::{FixedUrlFactory, Probe, RpcOptions};
use tempfile::TempDir;

// ── Helpers ─────────────────────────────────────────────────────────

struct AlwaysAlive;

#[async_trait]
impl Probe for AlwaysAlive {
    async fn is_alive(&self, _ip: Ipv4Addr) -> bool {
        true
    }
}

struct NeverAlive;

#[async_trait]
impl Probe for NeverAlive {
    async fn is_alive(&self, _ip: Ipv4Addr) -> bool {
        false
    }
}

fn mac() -> MacAddress {
    MacAddress::parse("543204AABBCC").unwrap()
}

fn factory_for(server: &MockServer) -> FixedUrlFactory {
    FixedUrlFactory {
        base_url: Url::parse(&server.uri()).unwrap(),
        options: RpcOptions::default(),
    }
}

fn network() -> NetworkSettings {
    NetworkSettings {
        cidr: "10.20.0.0/24".into(),
        gateway: Ipv4Addr::new(10, 20, 0, 1),
        netmask: Ipv4Addr::new(255, 255, 255, 0),
        nameserver: Ipv4Addr::new(10, 20, 0, 1),
        pool: IpPool::new(Ipv4Addr::new(10, 20, 0, 40), Ipv4Addr::new(10, 20, 0, 60)).unwrap(),
        dhcp_scan: None,
        scan_exclude_pool: true,
        ip_map: BTreeMap::new(),
    }
}

fn discovered(ip: Ipv4Addr) -> DiscoveredDevice {
    discovered_as(ip, "543204AABBCC")
}

fn discovered_as(ip: Ipv4Addr, mac: &str) -> DiscoveredDevice {
    DiscoveredDevice {
        ip,
        info: DeviceInfo {
            id: format!("shelly1pmminig3-{}", mac.to_ascii_lowercase()),
            mac: mac.into(),
            model: "S3SW-001P8EU".into(),
            generation: 3,
            fw_id: None,
            ver: Some("1.4.4".into()),
            app: Some("Mini1PMG3".into()),
            auth_en: false,
            profile: None,
            extra: BTreeMap::new(),
        },
    }
}

fn wifi_profiles() -> Vec<WifiProfile> {
    vec![WifiProfile {
        ssid: "fleet-net".into(),
        password: secrecy::SecretString::from("hunter2hunter2"),
    }]
}

fn hostname_rules() -> HostnameRules {
    HostnameRules {
        prefixes: BTreeMap::from([("Mini1PMG3".to_owned(), "sw".to_owned())]),
        default_prefix: "shelly".into(),
    }
}

// ── Stage 2 ─────────────────────────────────────────────────────────

#[tokio::test]
async fn stage2_adopts_device_into_pool() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).unwrap();
    let network = network();
    let profiles = wifi_profiles();
    let rules = hostname_rules();
    let factory = factory_for(&server);

    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({
            "method": "Wifi.SetConfig",
            "params": { "config": { "sta": {
                "ssid": "fleet-net",
                "ipv4mode": "static",
                "ip": "10.20.0.40",
                "gw": "10.20.0.1",
                "netmask": "255.255.255.0",
                "nameserver": "10.20.0.1",
            }}}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 1,
            "result": { "restart_required": false }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let runner = Stage2Runner {
        registry: &registry,
        network: &network,
        wifi_profiles: &profiles,
        hostname_rules: &rules,
        probe: &AlwaysAlive,
        factory: &factory,
        dry_run: false,
    };

    let device = discovered(Ipv4Addr::new(10, 20, 0, 103));
    let outcomes = runner.adopt_discovered(&[device], None).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].ok, "{}", outcomes[0].message);
    assert!(outcomes[0].message.contains("adopted at 10.20.0.40"));

    let record = registry.get(&mac()).unwrap();
    assert_eq!(record.ip, Some(Ipv4Addr::new(10, 20, 0, 40)));
    assert_eq!(record.hostname.as_deref(), Some("sw-aabbcc"));
    assert_eq!(record.model.as_deref(), Some("S3SW-001P8EU"));
    assert_eq!(record.stage_completed, 2);
    assert!(record.assigned_at.is_some());
}

#[tokio::test]
async fn stage2_already_adopted_device_is_left_alone() {
    // No mocks mounted: any RPC would fail loudly.
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).unwrap();
    let network = network();
    let profiles = wifi_profiles();
    let rules = hostname_rules();
    let factory = factory_for(&server);

    let target = Ipv4Addr::new(10, 20, 0, 41);
    registry
        .update(&mac(), |r| {
            r.ip = Some(target);
            r.hostname = Some("sw-aabbcc".into());
            r.assigned_at = Some(Utc::now());
            r.advance_stage(2);
        })
        .unwrap();
    let before = std::fs::read(dir.path().join("registry.json")).unwrap();

    let runner = Stage2Runner {
        registry: &registry,
        network: &network,
        wifi_profiles: &profiles,
        hostname_rules: &rules,
        probe: &AlwaysAlive,
        factory: &factory,
        dry_run: false,
    };

    let outcomes = runner
        .adopt_discovered(&[discovered(target)], None)
        .await
        .unwrap();
    assert!(outcomes[0].ok);
    assert!(outcomes[0].message.contains("already adopted at 10.20.0.41"));

    // Neither an RPC nor a registry write happened.
    assert!(server.received_requests().await.unwrap().is_empty());
    let after = std::fs::read(dir.path().join("registry.json")).unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn stage2_dry_run_changes_nothing() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).unwrap();
    let network = network();
    let profiles = wifi_profiles();
    let rules = hostname_rules();
    let factory = factory_for(&server);

    let runner = Stage2Runner {
        registry: &registry,
        network: &network,
        wifi_profiles: &profiles,
        hostname_rules: &rules,
        probe: &AlwaysAlive,
        factory: &factory,
        dry_run: true,
    };

    let device = discovered(Ipv4Addr::new(10, 20, 0, 99));
    let outcomes = runner.adopt_discovered(&[device], None).await.unwrap();
    assert!(outcomes[0].ok);
    assert!(outcomes[0].message.contains("would assign 10.20.0.40"));
    assert!(registry.is_empty());
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn stage2_pinned_address_wins_over_pool_order() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).unwrap();
    let mut network = network();
    let pinned = Ipv4Addr::new(10, 20, 0, 55);
    network.ip_map.insert(mac(), pinned);
    let profiles = wifi_profiles();
    let rules = hostname_rules();
    let factory = factory_for(&server);

    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({
            "method": "Wifi.SetConfig",
            "params": { "config": { "sta": { "ip": "10.20.0.55" } } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 1,
            "result": {}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let runner = Stage2Runner {
        registry: &registry,
        network: &network,
        wifi_profiles: &profiles,
        hostname_rules: &rules,
        probe: &AlwaysAlive,
        factory: &factory,
        dry_run: false,
    };

    let device = discovered(Ipv4Addr::new(10, 20, 0, 103));
    let outcomes = runner.adopt_discovered(&[device], None).await.unwrap();
    assert!(outcomes[0].ok, "{}", outcomes[0].message);
    assert_eq!(registry.get(&mac()).unwrap().ip, Some(pinned));
}

#[tokio::test]
async fn stage2_concurrent_batch_gets_distinct_addresses_and_one_save() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).unwrap();
    let network = network();
    let profiles = wifi_profiles();
    let rules = hostname_rules();
    let factory = factory_for(&server);

    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({ "method": "Wifi.SetConfig" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 1,
            "result": { "restart_required": false }
        })))
        .expect(2)
        .mount(&server)
        .await;

    let runner = Stage2Runner {
        registry: &registry,
        network: &network,
        wifi_profiles: &profiles,
        hostname_rules: &rules,
        probe: &AlwaysAlive,
        factory: &factory,
        dry_run: false,
    };

    let found = vec![
        discovered_as(Ipv4Addr::new(10, 20, 0, 103), "543204AABB01"),
        discovered_as(Ipv4Addr::new(10, 20, 0, 104), "543204AABB02"),
    ];
    let (plans, settled) = runner.plan(&found, None);
    assert!(settled.is_empty());
    assert_eq!(plans.len(), 2);

    // Both addresses are decided before any network work; even fully
    // parallel execution cannot hand out the same one twice.
    assert_ne!(plans[0].target_ip, plans[1].target_ip);

    let ((first, edit_a), (second, edit_b)) = tokio::join!(
        runner.execute_outcome(&plans[0]),
        runner.execute_outcome(&plans[1])
    );
    assert!(first.ok, "{}", first.message);
    assert!(second.ok, "{}", second.message);

    let edits: Vec<_> = edit_a.into_iter().chain(edit_b).collect();
    runner.commit(&edits).unwrap();

    let mac_a = MacAddress::parse("543204AABB01").unwrap();
    let mac_b = MacAddress::parse("543204AABB02").unwrap();
    let ip_a = registry.get(&mac_a).unwrap().ip.unwrap();
    let ip_b = registry.get(&mac_b).unwrap().ip.unwrap();
    assert_ne!(ip_a, ip_b);
    assert_eq!(
        std::collections::BTreeSet::from([ip_a, ip_b]),
        std::collections::BTreeSet::from([
            Ipv4Addr::new(10, 20, 0, 40),
            Ipv4Addr::new(10, 20, 0, 41)
        ])
    );

    // One save for the whole batch: the backup file only appears once
    // a second save replaces an existing registry file.
    assert!(dir.path().join("registry.json").exists());
    assert!(!dir.path().join("registry.json.bak").exists());
}

// ── Stage 3 ─────────────────────────────────────────────────────────

fn ota_disabled() -> OtaSettings {
    OtaSettings {
        enabled: false,
        ..OtaSettings::default()
    }
}

#[tokio::test]
async fn stage3_registry_master_overwrites_device_name() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).unwrap();
    let factory = factory_for(&server);

    registry
        .update(&mac(), |r| {
            r.ip = Some(Ipv4Addr::new(10, 20, 0, 41));
            r.friendly_name = Some("Kitchen Light".into());
            r.advance_stage(2);
        })
        .unwrap();

    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({ "method": "Sys.GetConfig" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 1,
            "result": { "device": { "name": "old-name" } }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rpc/Sys.SetConfig"))
        .and(query_param(
            "config",
            r#"{"device":{"name":"Kitchen Light"}}"#,
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(null)))
        .expect(1)
        .mount(&server)
        .await;

    let ota = ota_disabled();
    let friendly = FriendlySettings {
        enabled: true,
        policy: NamingPolicy::RegistryIsMaster,
        source: NameSource::FriendlyName,
    };
    let runner = Stage3Runner {
        registry: &registry,
        ota: &ota,
        friendly: &friendly,
        probe: &AlwaysAlive,
        factory: &factory,
        dry_run: false,
    };

    let outcomes = runner.run(None).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].ok);
    assert!(outcomes[0].message.contains("friendly=ok"));

    let record = registry.get(&mac()).unwrap();
    let status = record.stage3.unwrap();
    assert_eq!(status.friendly_status, "ok");
    assert_eq!(status.ota_status, "disabled");
    assert_eq!(record.stage_completed, 3);
}

#[tokio::test]
async fn stage3_device_master_keeps_existing_name() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).unwrap();
    let factory = factory_for(&server);

    registry
        .update(&mac(), |r| {
            r.ip = Some(Ipv4Addr::new(10, 20, 0, 41));
            r.friendly_name = Some("Kitchen Light".into());
            r.advance_stage(2);
        })
        .unwrap();

    // Only the read is mounted; a write attempt would 404 and surface
    // as an error status.
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({ "method": "Sys.GetConfig" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 1,
            "result": { "device": { "name": "hand-labelled" } }
        })))
        .mount(&server)
        .await;

    let ota = ota_disabled();
    let friendly = FriendlySettings {
        enabled: true,
        policy: NamingPolicy::DeviceIsMaster,
        source: NameSource::FriendlyName,
    };
    let runner = Stage3Runner {
        registry: &registry,
        ota: &ota,
        friendly: &friendly,
        probe: &AlwaysAlive,
        factory: &factory,
        dry_run: false,
    };

    let outcomes = runner.run(None).await.unwrap();
    assert!(outcomes[0].message.contains("friendly=kept_device_name"));
    let status = registry.get(&mac()).unwrap().stage3.unwrap();
    assert_eq!(status.friendly_status, "kept_device_name");
}

#[tokio::test]
async fn stage3_offline_device_keeps_previous_friendly_status() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).unwrap();
    let factory = factory_for(&server);

    registry
        .update(&mac(), |r| {
            r.ip = Some(Ipv4Addr::new(10, 20, 0, 41));
            r.friendly_name = Some("Kitchen Light".into());
            r.stage3 = Some(Stage3Status {
                ota_status: "up_to_date".into(),
                friendly_status: "ok".into(),
                last_run: Some(Utc::now()),
            });
            r.advance_stage(3);
        })
        .unwrap();

    let ota = OtaSettings::default();
    let friendly = FriendlySettings::default();
    let runner = Stage3Runner {
        registry: &registry,
        ota: &ota,
        friendly: &friendly,
        probe: &NeverAlive,
        factory: &factory,
        dry_run: false,
    };

    let outcomes = runner.run(None).await.unwrap();
    assert!(outcomes[0].ok, "offline is a recorded skip, not an error");
    assert!(outcomes[0].message.contains("ota=offline"));
    assert!(outcomes[0].message.contains("friendly=unchanged"));

    let status = registry.get(&mac()).unwrap().stage3.unwrap();
    assert_eq!(status.ota_status, "offline");
    assert_eq!(status.friendly_status, "ok", "previous status survives");
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn stage3_beta_only_firmware_is_skipped() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).unwrap();
    let factory = factory_for(&server);

    registry
        .update(&mac(), |r| {
            r.ip = Some(Ipv4Addr::new(10, 20, 0, 41));
            r.advance_stage(2);
        })
        .unwrap();

    Mock::given(method("GET"))
        .and(path("/rpc/Shelly.CheckForUpdate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "beta": { "version": "1.5.0-beta2", "build_id": "20250801-beta2" }
        })))
        .mount(&server)
        .await;

    let ota = OtaSettings {
        enabled: true,
        mode: OtaMode::CheckAndUpdate,
        ..OtaSettings::default()
    };
    let friendly = FriendlySettings {
        enabled: false,
        ..FriendlySettings::default()
    };
    let runner = Stage3Runner {
        registry: &registry,
        ota: &ota,
        friendly: &friendly,
        probe: &AlwaysAlive,
        factory: &factory,
        dry_run: false,
    };

    let outcomes = runner.run(None).await.unwrap();
    assert!(outcomes[0].message.contains("ota=skipped (beta only)"));
    let status = registry.get(&mac()).unwrap().stage3.unwrap();
    assert_eq!(status.ota_status, "skipped (beta only)");
}

#[tokio::test]
async fn stage3_update_available_in_check_only_mode() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).unwrap();
    let factory = factory_for(&server);

    registry
        .update(&mac(), |r| {
            r.ip = Some(Ipv4Addr::new(10, 20, 0, 41));
            r.advance_stage(2);
        })
        .unwrap();

    Mock::given(method("GET"))
        .and(path("/rpc/Shelly.CheckForUpdate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "stable": { "version": "1.5.0", "build_id": "20250810-stable" }
        })))
        .mount(&server)
        .await;

    let ota = OtaSettings::default(); // check_only
    let friendly = FriendlySettings {
        enabled: false,
        ..FriendlySettings::default()
    };
    let runner = Stage3Runner {
        registry: &registry,
        ota: &ota,
        friendly: &friendly,
        probe: &AlwaysAlive,
        factory: &factory,
        dry_run: false,
    };

    let outcomes = runner.run(None).await.unwrap();
    assert!(
        outcomes[0].message.contains("update_available (1.5.0)"),
        "{}",
        outcomes[0].message
    );
    assert!(outcomes[0].ok);
    // No Shelly.Update call was made.
    let updates = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path().contains("Shelly.Update"))
        .count();
    assert_eq!(updates, 0);
}

#[tokio::test]
async fn stage3_failed_name_write_fails_the_device() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path().join("registry.json")).unwrap();
    let factory = factory_for(&server);

    registry
        .update(&mac(), |r| {
            r.ip = Some(Ipv4Addr::new(10, 20, 0, 41));
            r.friendly_name = Some("Kitchen Light".into());
            r.advance_stage(2);
        })
        .unwrap();

    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({ "method": "Sys.GetConfig" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 1,
            "result": { "device": { "name": "old-name" } }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rpc/Sys.SetConfig"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let ota = ota_disabled();
    let friendly = FriendlySettings {
        enabled: true,
        policy: NamingPolicy::RegistryIsMaster,
        source: NameSource::FriendlyName,
    };
    let runner = Stage3Runner {
        registry: &registry,
        ota: &ota,
        friendly: &friendly,
        probe: &AlwaysAlive,
        factory: &factory,
        dry_run: false,
    };

    // A reachable device whose name write blows up is a failure, not a
    // recorded skip.
    let outcomes = runner.run(None).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].ok, "{}", outcomes[0].message);
    assert!(outcomes[0].message.contains("friendly=error:"));

    // The status is still recorded for the next run to see.
    let status = registry.get(&mac()).unwrap().stage3.unwrap();
    assert!(status.friendly_status.starts_with("error:"));
}

// ── Stage 4 ─────────────────────────────────────────────────────────

#[tokio::test]
async fn stage4_run_persists_the_whole_batch_in_one_save() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let registry_path = dir.path().join("registry.json");
    let registry = Registry::open(&registry_path).unwrap();
    let factory = factory_for(&server);

    let mac_a = MacAddress::parse("543204AABB01").unwrap();
    let mac_b = MacAddress::parse("543204AABB02").unwrap();
    for (mac, ip) in [(&mac_a, 41), (&mac_b, 42)] {
        registry
            .update(mac, |r| {
                r.ip = Some(Ipv4Addr::new(10, 20, 0, ip));
                r.hw_model = Some("Mini1PMG3".into());
                r.advance_stage(3);
            })
            .unwrap();
    }
    // Clear the seeding's backup so the backup left after the run is
    // exactly the state the run's one save snapshotted.
    std::fs::remove_file(dir.path().join("registry.json.bak")).unwrap();

    // Single-profile hardware: profile checks read device info, the
    // only write is Switch.SetConfig.
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({ "method": "Shelly.GetDeviceInfo" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 1,
            "result": {
                "id": "shelly1pmminig3-543204aabb01",
                "mac": "543204AABB01",
                "model": "S3SW-001P8EU",
                "gen": 3,
                "app": "Mini1PMG3"
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({ "method": "Switch.SetConfig" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 1,
            "result": { "restart_required": false }
        })))
        .expect(2)
        .mount(&server)
        .await;

    let settings = Stage4Settings {
        profiles: BTreeMap::from([(
            "Mini1PMG3".to_owned(),
            DeviceProfile {
                kind: ProfileKind::Switch,
                initial_state: Some("off".into()),
                auto_off_delay: None,
                auto_on_delay: None,
                input_mode: None,
                input_invert: None,
                in_mode: None,
                cover_open_secs: None,
                cover_close_secs: None,
                cover_invert_directions: None,
            },
        )]),
        ..Stage4Settings::default()
    };
    let runner = Stage4Runner {
        registry: &registry,
        settings: &settings,
        probe: &AlwaysAlive,
        factory: &factory,
        dry_run: false,
    };

    let outcomes = runner.run(None).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.ok));

    for mac in [&mac_a, &mac_b] {
        let record = registry.get(mac).unwrap();
        assert_eq!(record.stage_completed, 4);
        assert!(record.stage4.unwrap().result.starts_with("applied Mini1PMG3"));
    }

    // The backup is the pre-run state: had the run saved once per
    // device, it would hold the first device's stage 4 status.
    let backup = std::fs::read_to_string(dir.path().join("registry.json.bak")).unwrap();
    assert!(!backup.contains("stage4"));
    let primary = std::fs::read_to_string(&registry_path).unwrap();
    assert_eq!(primary.matches("applied Mini1PMG3").count(), 2);
}
