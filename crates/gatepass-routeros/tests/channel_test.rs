#![allow(clippy::unwrap_used)]
// Integration tests for `Channel` against the in-process mock appliance.

use std::time::Duration;

use gatepass_routeros::testing::MockDevice;
use gatepass_routeros::{Channel, ChannelConfig, Command, DeviceEndpoint, Error};
use secrecy::SecretString;

// ── Helpers ─────────────────────────────────────────────────────────

fn fast_config() -> ChannelConfig {
    ChannelConfig {
        connect_timeout: Duration::from_secs(2),
        reconnect_attempts: 3,
        backoff_base: Duration::from_millis(10),
    }
}

async fn open(mock: &MockDevice) -> Channel {
    Channel::open(mock.endpoint(), fast_config())
        .await
        .unwrap()
}

// ── Login ───────────────────────────────────────────────────────────

#[tokio::test]
async fn login_and_execute_rows() {
    let mock = MockDevice::start().await;
    mock.add_profile("1_Day");

    let mut channel = open(&mock).await;
    let rows = channel
        .execute(&Command::new("/ip/hotspot/user/profile/print"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some("1_Day"));
    channel.close().await;
}

#[tokio::test]
async fn wrong_secret_is_an_auth_error() {
    let mock = MockDevice::start().await;
    let mut endpoint = mock.endpoint();
    endpoint.secret = SecretString::from("wrong".to_owned());

    let err = Channel::open(endpoint, fast_config()).await.unwrap_err();
    assert!(matches!(err, Error::AuthenticationFailed { .. }), "{err}");
}

#[tokio::test]
async fn pre_643_challenge_login() {
    let mock = MockDevice::start().await;
    mock.lock().challenge_login = true;

    let mut channel = open(&mock).await;
    assert!(channel.is_alive().await);
}

// ── Recovery ────────────────────────────────────────────────────────

#[tokio::test]
async fn reconnects_after_fatal_and_reissues() {
    let mock = MockDevice::start().await;
    let mut channel = open(&mock).await;
    mock.fail_next_commands(1);

    let rows = channel
        .execute(&Command::new("/system/identity/print"))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    // First dispatch got !fatal; the reissue after reopen succeeded.
    assert_eq!(mock.commands_for("/system/identity/print").len(), 2);
}

#[tokio::test]
async fn trap_still_fails_after_bounded_retries() {
    let mock = MockDevice::start().await;
    let mut channel = open(&mock).await;

    let err = channel
        .execute(&Command::new("/who/knows"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Trap { .. }), "{err}");
    // Initial attempt plus three reopen cycles.
    assert_eq!(mock.commands_for("/who/knows").len(), 4);
}

#[tokio::test]
async fn refused_connection_is_transport_class() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let endpoint =
        DeviceEndpoint::new("127.0.0.1", port, "api", SecretString::from("x".to_owned()));
    let err = Channel::open(endpoint, fast_config()).await.unwrap_err();
    assert!(err.is_transport_class(), "{err}");
}
