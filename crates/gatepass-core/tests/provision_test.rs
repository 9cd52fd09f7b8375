#![allow(clippy::unwrap_used)]
// End-to-end provisioning tests: mock appliance on one side, wiremock
// gateway on the other, the saga in between.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use secrecy::SecretString;
use serde_json::json;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gatepass_core::{
    AutoBindRequest, BindFailure, BindTiming, BinderConfig, ChannelConfig, ConektaGateway,
    CoreError, CredentialKind, CustomerInfo, LedgerStore, MacAddress, MercadoPagoGateway,
    ModernLoginMode, PaymentGateway, PaymentInstrument, PaymentState, ProductPolicy,
    SagaCoordinator, UserManagerConfig,
};
use gatepass_routeros::testing::MockDevice;

const MAC: &str = "aa:bb:cc:11:22:33";

// ── Helpers ─────────────────────────────────────────────────────────

fn fast_users() -> UserManagerConfig {
    UserManagerConfig {
        channel: fast_channel(),
        verify_retry: Duration::from_millis(20),
        delete_settle: Duration::from_millis(10),
        delete_recheck: Duration::from_millis(10),
    }
}

fn fast_channel() -> ChannelConfig {
    ChannelConfig {
        connect_timeout: Duration::from_secs(2),
        reconnect_attempts: 1,
        backoff_base: Duration::from_millis(10),
    }
}

fn fast_binder() -> BinderConfig {
    BinderConfig {
        channel: fast_channel(),
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

fn conekta(server: &MockServer) -> Arc<dyn PaymentGateway> {
    Arc::new(ConektaGateway::new(
        SecretString::from("key_test".to_owned()),
        Url::parse(&server.uri()).unwrap(),
    ))
}

fn mercado_pago(server: &MockServer) -> Arc<dyn PaymentGateway> {
    Arc::new(MercadoPagoGateway::new(
        SecretString::from("APP_USR-test".to_owned()),
        Url::parse(&server.uri()).unwrap(),
    ))
}

fn coordinator(
    device: &MockDevice,
    gateway: Arc<dyn PaymentGateway>,
) -> (Arc<LedgerStore>, SagaCoordinator) {
    let ledger = Arc::new(LedgerStore::new());
    let saga = SagaCoordinator::with_configs(
        Arc::clone(&ledger),
        gateway,
        device.endpoint(),
        fast_users(),
        fast_binder(),
    );
    (ledger, saga)
}

fn day_pass() -> ProductPolicy {
    ProductPolicy {
        profile_name: "1_Day".to_owned(),
        amount: 50.0,
        currency: "MXN".to_owned(),
        credential_kind: CredentialKind::UserAndSecret,
        description: "Acceso 1 dia".to_owned(),
    }
}

fn instrument() -> PaymentInstrument {
    PaymentInstrument {
        token: "tok_visa4242".to_owned(),
        payment_method_id: Some("visa".to_owned()),
        issuer_id: None,
        installments: None,
    }
}

fn customer() -> CustomerInfo {
    CustomerInfo {
        name: "Ana Torres".to_owned(),
        email: "ana@example.mx".to_owned(),
        phone: None,
    }
}

// ── Approved captures ───────────────────────────────────────────────

#[tokio::test]
async fn approved_purchase_provisions_and_settles() {
    let device = MockDevice::start().await;
    device.add_profile("1_Day");
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "ord_PAY123",
            "payment_status": "paid",
        })))
        .mount(&server)
        .await;

    let (ledger, saga) = coordinator(&device, conekta(&server));
    let outcome = saga
        .provision(&day_pass(), instrument(), customer(), None)
        .await
        .unwrap();

    assert_eq!(outcome.state, PaymentState::Approved);
    assert!(!outcome.pending_confirmation);
    assert_eq!(outcome.payment_id, "ord_PAY123");
    assert_eq!(outcome.credential.identifier.len(), 6);
    assert!(outcome.bind.is_none());

    assert!(device.user_names().contains(&outcome.credential.identifier));
    assert!(device.commands_for("/ip/hotspot/user/remove").is_empty());

    let entry = ledger.by_payment_id("ord_PAY123").unwrap();
    let entry = entry.lock().await;
    assert_eq!(entry.payment_state, PaymentState::Approved);
    assert!(entry.device_user_created);
    assert!(entry.settled_at.is_some());
    assert!(!entry.session_bound);
}

#[tokio::test]
async fn approved_purchase_with_auto_bind() {
    let device = MockDevice::start().await;
    device.set_version("7.14.2 (stable)");
    device.add_profile("1_Day");
    device.add_host(MAC, "10.5.50.17", "hotspot1");
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "ord_BIND01",
            "payment_status": "paid",
        })))
        .mount(&server)
        .await;

    let (ledger, saga) = coordinator(&device, conekta(&server));
    let auto = AutoBindRequest {
        mac: MacAddress::parse(MAC).unwrap(),
        ip: None,
    };
    let outcome = saga
        .provision(&day_pass(), instrument(), customer(), Some(auto))
        .await
        .unwrap();

    let bind = outcome.bind.unwrap();
    assert!(bind.success);
    assert!(bind.authenticated);
    assert_eq!(
        bind.session.unwrap().user,
        outcome.credential.identifier
    );

    let entry = ledger.by_payment_id("ord_BIND01").unwrap();
    assert!(entry.lock().await.session_bound);
}

#[tokio::test]
async fn auto_bind_failure_never_unwinds_the_sale() {
    let device = MockDevice::start().await;
    device.add_profile("1_Day");
    // No host entry: the client is not attached to the network.
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "ord_NOBIND",
            "payment_status": "paid",
        })))
        .mount(&server)
        .await;

    let (ledger, saga) = coordinator(&device, conekta(&server));
    let auto = AutoBindRequest {
        mac: MacAddress::parse(MAC).unwrap(),
        ip: None,
    };
    let outcome = saga
        .provision(&day_pass(), instrument(), customer(), Some(auto))
        .await
        .unwrap();

    assert_eq!(outcome.state, PaymentState::Approved);
    let bind = outcome.bind.unwrap();
    assert!(!bind.success);
    assert_eq!(bind.failure, Some(BindFailure::ClientNotOnNetwork));

    // The sale stands: credential disclosed, user kept.
    assert_eq!(outcome.credential.identifier.len(), 6);
    assert!(device.user_names().contains(&outcome.credential.identifier));
    let entry = ledger.by_payment_id("ord_NOBIND").unwrap();
    let entry = entry.lock().await;
    assert_eq!(entry.payment_state, PaymentState::Approved);
    assert!(!entry.session_bound);
}

// ── Non-approvals and compensation ──────────────────────────────────

#[tokio::test]
async fn declined_capture_compensates_the_device_user() {
    let device = MockDevice::start().await;
    device.add_profile("1_Day");
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(402).set_body_json(json!({
            "details": [{ "code": "card_declined", "message": "La tarjeta fue declinada" }],
        })))
        .mount(&server)
        .await;

    let (ledger, saga) = coordinator(&device, conekta(&server));
    let err = saga
        .provision(&day_pass(), instrument(), customer(), None)
        .await
        .unwrap_err();

    match err {
        CoreError::PaymentRejected { status, .. } => assert_eq!(status, "card_declined"),
        other => panic!("expected PaymentRejected, got {other:?}"),
    }

    // The user created before the capture is gone again.
    assert!(device.user_names().is_empty());
    assert_eq!(device.commands_for("/ip/hotspot/user/remove").len(), 1);

    let entries = ledger.entries();
    assert_eq!(entries.len(), 1);
    let entry = entries[0].lock().await;
    assert_eq!(entry.payment_state, PaymentState::Declined);
    assert!(!entry.device_user_created);
}

#[tokio::test]
async fn pending_conekta_capture_is_terminal() {
    let device = MockDevice::start().await;
    device.add_profile("1_Day");
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "ord_OXXO1",
            "payment_status": "pending_payment",
        })))
        .mount(&server)
        .await;

    let (ledger, saga) = coordinator(&device, conekta(&server));
    let err = saga
        .provision(&day_pass(), instrument(), customer(), None)
        .await
        .unwrap_err();

    match err {
        CoreError::PaymentRejected { status, reason } => {
            assert_eq!(status, "pending_payment");
            assert!(reason.contains("pending"), "reason: {reason}");
        }
        other => panic!("expected PaymentRejected, got {other:?}"),
    }
    assert!(device.user_names().is_empty());
    let entries = ledger.entries();
    assert_eq!(entries[0].lock().await.payment_state, PaymentState::Declined);
}

#[tokio::test]
async fn gateway_error_compensates_and_bubbles() {
    let device = MockDevice::start().await;
    device.add_profile("1_Day");
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "type": "api_error",
        })))
        .mount(&server)
        .await;

    let (ledger, saga) = coordinator(&device, conekta(&server));
    let err = saga
        .provision(&day_pass(), instrument(), customer(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::Gateway { .. }), "{err:?}");
    assert!(device.user_names().is_empty());
    let entries = ledger.entries();
    assert_eq!(entries[0].lock().await.payment_state, PaymentState::Errored);
}

// ── Provisional pending (Mercado Pago) ──────────────────────────────

#[tokio::test]
async fn pending_mercado_pago_withholds_credentials_until_settlement() {
    let device = MockDevice::start().await;
    device.add_profile("1_Day");
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/payments"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": 555,
            "status": "pending",
            "status_detail": "pending_contingency",
        })))
        .mount(&server)
        .await;

    let (ledger, saga) = coordinator(&device, mercado_pago(&server));
    let outcome = saga
        .provision(&day_pass(), instrument(), customer(), None)
        .await
        .unwrap();

    assert_eq!(outcome.state, PaymentState::Pending);
    assert!(outcome.pending_confirmation);
    assert_eq!(outcome.payment_id, "555");
    assert_eq!(outcome.status_detail.as_deref(), Some("pending_contingency"));
    // Default Mercado Pago policy: no credentials before settlement.
    assert!(outcome.credential.identifier.is_empty());
    assert!(outcome.credential.secret.is_empty());

    // The device user stays; only the buyer-facing copy is redacted.
    assert_eq!(device.user_names().len(), 1);
    let entry = ledger.by_payment_id("555").unwrap();
    let entry = entry.lock().await;
    assert_eq!(entry.payment_state, PaymentState::Pending);
    assert!(entry.device_user_created);
    assert!(entry.settled_at.is_none());
    assert_eq!(entry.credential.identifier.len(), 6);
}

// ── Device failures before money ────────────────────────────────────

#[tokio::test]
async fn missing_profile_aborts_before_any_capture() {
    let device = MockDevice::start().await;
    let server = MockServer::start().await;
    // No mock mounted: a capture attempt would 404 loudly.

    let (ledger, saga) = coordinator(&device, conekta(&server));
    let err = saga
        .provision(&day_pass(), instrument(), customer(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::ProfileNotFound { .. }), "{err:?}");
    assert!(server.received_requests().await.unwrap().is_empty());
    let entries = ledger.entries();
    assert_eq!(entries[0].lock().await.payment_state, PaymentState::Errored);
}
