#![allow(clippy::unwrap_used)]
// Integration tests for the legacy and modern session binders against
// the mock appliance.

use std::time::Duration;

use gatepass_core::{
    AccessCredential, BindFailure, BindRequest, BindTiming, BinderConfig, BinderStrategy,
    ChannelConfig, CredentialKind, MacAddress, ModernLoginMode, bind_auto,
};
use gatepass_routeros::testing::{LoginBehavior, MockDevice, table_row};

const MAC: &str = "AA:BB:CC:11:22:33";
const HOST_IP: &str = "10.5.50.17";

// ── Helpers ─────────────────────────────────────────────────────────

fn fast_binder() -> BinderConfig {
    BinderConfig {
        channel: ChannelConfig {
            connect_timeout: Duration::from_secs(2),
            reconnect_attempts: 1,
            backoff_base: Duration::from_millis(10),
        },
        timing: BindTiming {
            verify_after: Duration::from_millis(10),
            verify_retry_after: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
            poll_attempts: 3,
            script_settle: Duration::from_millis(10),
        },
        modern_login: ModernLoginMode::Direct,
    }
}

fn request(identifier: &str) -> BindRequest {
    BindRequest {
        credential: AccessCredential {
            kind: CredentialKind::UserAndSecret,
            identifier: identifier.to_owned(),
            secret: "1234".to_owned(),
        },
        mac: MacAddress::parse(MAC).unwrap(),
        ip: None,
    }
}

// ── Legacy ──────────────────────────────────────────────────────────

#[tokio::test]
async fn legacy_bind_logs_in_and_verifies_the_session() {
    let device = MockDevice::start().await;
    device.add_user("K7Q2P9", "1234", "1_Day");
    device.add_host(MAC, HOST_IP, "hotspot1");

    let result = BinderStrategy::Legacy
        .bind(&device.endpoint(), &request("K7Q2P9"), &fast_binder())
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.authenticated);
    assert_eq!(result.method.as_deref(), Some("ip-user-password"));
    assert_eq!(result.failure, None);
    let session = result.session.unwrap();
    assert_eq!(session.user, "K7Q2P9");
    assert_eq!(session.address.as_deref(), Some(HOST_IP));

    // The client MAC gets pinned onto the user record, normalized.
    let sets = device.commands_for("/ip/hotspot/user/set");
    assert_eq!(sets.len(), 1);
    assert!(sets[0].contains("=mac-address=aa:bb:cc:11:22:33"));

    // No cookie existed, so one was issued for this client.
    assert_eq!(device.commands_for("/ip/hotspot/cookie/add").len(), 1);
    assert_eq!(device.cookie_count(), 1);
    assert_eq!(device.commands_for("/ip/hotspot/active/login").len(), 1);
}

#[tokio::test]
async fn legacy_missing_user_fails_before_any_login() {
    let device = MockDevice::start().await;
    device.add_host(MAC, HOST_IP, "hotspot1");

    let result = BinderStrategy::Legacy
        .bind(&device.endpoint(), &request("NOV1CE"), &fast_binder())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.failure, Some(BindFailure::UserNotFound));
    assert!(device.commands_for("/ip/hotspot/host/print").is_empty());
    assert!(device.commands_for("/ip/hotspot/active/login").is_empty());
}

#[tokio::test]
async fn legacy_detached_client_never_gets_a_login() {
    let device = MockDevice::start().await;
    device.add_user("K7Q2P9", "1234", "1_Day");

    let result = BinderStrategy::Legacy
        .bind(&device.endpoint(), &request("K7Q2P9"), &fast_binder())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.failure, Some(BindFailure::ClientNotOnNetwork));
    assert!(device.commands_for("/ip/hotspot/active/login").is_empty());
}

#[tokio::test]
async fn legacy_accepts_the_already_logged_in_trap() {
    let device = MockDevice::start().await;
    device.add_user("K7Q2P9", "1234", "1_Day");
    device.add_host(MAC, HOST_IP, "hotspot1");
    device.add_active("K7Q2P9", HOST_IP, "aa:bb:cc:11:22:33");
    device.set_login_behavior(LoginBehavior::TrapAlreadyLoggedIn);

    let result = BinderStrategy::Legacy
        .bind(&device.endpoint(), &request("K7Q2P9"), &fast_binder())
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.authenticated);
    let session = result.session.unwrap();
    assert_eq!(session.mac_address.as_deref(), Some("aa:bb:cc:11:22:33"));
}

#[tokio::test]
async fn legacy_stale_cookie_is_removed_not_reissued() {
    let device = MockDevice::start().await;
    device.add_user("K7Q2P9", "1234", "1_Day");
    device.add_host(MAC, HOST_IP, "hotspot1");
    device.lock().cookies.push(table_row(&[
        (".id", "*C1"),
        ("mac-address", "aa:bb:cc:11:22:33"),
        ("user", "OLDUSR"),
    ]));

    let result = BinderStrategy::Legacy
        .bind(&device.endpoint(), &request("K7Q2P9"), &fast_binder())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(device.commands_for("/ip/hotspot/cookie/remove").len(), 1);
    assert!(device.commands_for("/ip/hotspot/cookie/add").is_empty());
    assert_eq!(device.cookie_count(), 0);
}

// ── Modern ──────────────────────────────────────────────────────────

#[tokio::test]
async fn modern_bind_selected_by_firmware_probe() {
    let device = MockDevice::start().await;
    device.set_version("7.14.2 (stable)");
    device.add_user("K7Q2P9", "1234", "1_Day");
    device.add_host(MAC, HOST_IP, "hotspot1");

    let result = bind_auto(&device.endpoint(), &request("K7Q2P9"), &fast_binder())
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.authenticated);
    assert_eq!(result.method.as_deref(), Some("ip-user-password"));

    // Modern portals never touch the cookie table.
    assert!(device.commands_for("/ip/hotspot/cookie/print").is_empty());
    let logins = device.commands_for("/ip/hotspot/active/login");
    assert_eq!(logins.len(), 1);
    assert!(logins[0].contains(&format!("=ip={HOST_IP}")));
}

#[tokio::test]
async fn modern_prefers_the_supplied_client_ip() {
    let device = MockDevice::start().await;

    let mut req = request("K7Q2P9");
    req.ip = Some("10.77.0.4".to_owned());
    let result = BinderStrategy::Modern
        .bind(&device.endpoint(), &req, &fast_binder())
        .await
        .unwrap();

    assert!(result.success);
    assert!(device.commands_for("/ip/hotspot/host/print").is_empty());
    let session = result.session.unwrap();
    assert_eq!(session.address.as_deref(), Some("10.77.0.4"));
}

#[tokio::test]
async fn modern_clears_stale_sessions_first() {
    let device = MockDevice::start().await;
    device.add_host(MAC, HOST_IP, "hotspot1");
    device.add_active("K7Q2P9", "10.9.9.9", "ee:ee:ee:ee:ee:ee");

    let result = BinderStrategy::Modern
        .bind(&device.endpoint(), &request("K7Q2P9"), &fast_binder())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(device.commands_for("/ip/hotspot/active/remove").len(), 1);
    // Only the freshly created session remains.
    assert_eq!(device.active_users(), vec!["K7Q2P9".to_owned()]);
}

#[tokio::test]
async fn modern_script_mode_cleans_up_after_itself() {
    let device = MockDevice::start().await;
    device.add_host(MAC, HOST_IP, "hotspot1");
    device.lock().script_run_creates_active = Some(table_row(&[
        ("user", "K7Q2P9"),
        ("address", HOST_IP),
        ("mac-address", "aa:bb:cc:11:22:33"),
    ]));

    let mut config = fast_binder();
    config.modern_login = ModernLoginMode::Script;
    let result = BinderStrategy::Modern
        .bind(&device.endpoint(), &request("K7Q2P9"), &config)
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.authenticated);
    assert_eq!(result.method.as_deref(), Some("script"));

    // Upload, run, delete; the credential-bearing script never lingers.
    assert_eq!(device.commands_for("/system/script/add").len(), 1);
    assert_eq!(device.commands_for("/system/script/run").len(), 1);
    assert_eq!(device.commands_for("/system/script/remove").len(), 1);
    assert!(device.script_names().is_empty());
}
