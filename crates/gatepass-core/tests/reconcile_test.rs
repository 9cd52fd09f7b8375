#![allow(clippy::unwrap_used)]
// Reconciliation tests: webhook notifications against a wiremock
// gateway, exercising idempotency and the authoritative re-query.

use std::sync::Arc;

use secrecy::SecretString;
use serde_json::json;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gatepass_core::{
    AccessCredential, CoreError, CredentialKind, EntrySlot, LedgerEntry, LedgerStore,
    MercadoPagoGateway, Notification, PaymentState, ReconcileAction, Reconciler,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn reconciler(server: &MockServer, ledger: &Arc<LedgerStore>) -> Reconciler {
    let gateway = MercadoPagoGateway::new(
        SecretString::from("APP_USR-test".to_owned()),
        Url::parse(&server.uri()).unwrap(),
    );
    Reconciler::new(Arc::clone(ledger), Arc::new(gateway))
}

/// A pending sale as the saga would have left it.
fn seed_pending(ledger: &LedgerStore, reference: &str, payment_id: &str) -> EntrySlot {
    let mut entry = LedgerEntry::new(
        reference.to_owned(),
        50.0,
        "MXN",
        AccessCredential::generate(CredentialKind::UserAndSecret),
    );
    entry.external_payment_id = payment_id.to_owned();
    entry.device_user_created = true;
    let slot = ledger.create(entry);
    ledger.index_payment_id(payment_id, reference);
    slot
}

fn notification(id: &str, payment_id: &str) -> Notification {
    Notification {
        notification_id: id.to_owned(),
        payment_id: Some(payment_id.to_owned()),
        external_reference: None,
    }
}

fn approved_body() -> serde_json::Value {
    json!({ "id": 555, "status": "approved", "status_detail": "accredited" })
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn settles_a_pending_entry_exactly_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/payments/555"))
        .respond_with(ResponseTemplate::new(200).set_body_json(approved_body()))
        .expect(1)
        .mount(&server)
        .await;

    let ledger = Arc::new(LedgerStore::new());
    let slot = seed_pending(&ledger, "ref-1", "555");
    let reconciler = reconciler(&server, &ledger);

    let action = reconciler
        .reconcile(&notification("n-1", "555"))
        .await
        .unwrap();
    assert_eq!(
        action,
        ReconcileAction::Updated {
            state: PaymentState::Approved,
            changed: true,
        }
    );
    {
        let entry = slot.lock().await;
        assert_eq!(entry.payment_state, PaymentState::Approved);
        assert!(entry.settled_at.is_some());
    }

    // The same notification again never reaches the gateway; the
    // mounted expectation of one call enforces it on shutdown.
    let action = reconciler
        .reconcile(&notification("n-1", "555"))
        .await
        .unwrap();
    assert_eq!(action, ReconcileAction::Duplicate);
}

#[tokio::test]
async fn repeated_settlement_is_reported_unchanged() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/payments/555"))
        .respond_with(ResponseTemplate::new(200).set_body_json(approved_body()))
        .expect(2)
        .mount(&server)
        .await;

    let ledger = Arc::new(LedgerStore::new());
    seed_pending(&ledger, "ref-1", "555");
    let reconciler = reconciler(&server, &ledger);

    reconciler
        .reconcile(&notification("n-1", "555"))
        .await
        .unwrap();
    // A distinct notification id re-queries, then finds nothing to do.
    let action = reconciler
        .reconcile(&notification("n-2", "555"))
        .await
        .unwrap();
    assert_eq!(
        action,
        ReconcileAction::Updated {
            state: PaymentState::Approved,
            changed: false,
        }
    );
}

#[tokio::test]
async fn the_requery_is_authoritative_not_the_notification() {
    let server = MockServer::start().await;
    // Whatever the webhook implied, the gateway says rejected.
    Mock::given(method("GET"))
        .and(path("/v1/payments/556"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 556,
            "status": "rejected",
            "status_detail": "cc_rejected_other_reason",
        })))
        .mount(&server)
        .await;

    let ledger = Arc::new(LedgerStore::new());
    let slot = seed_pending(&ledger, "ref-2", "556");
    let reconciler = reconciler(&server, &ledger);

    let action = reconciler
        .reconcile(&notification("n-1", "556"))
        .await
        .unwrap();
    assert_eq!(
        action,
        ReconcileAction::Updated {
            state: PaymentState::Declined,
            changed: true,
        }
    );
    let entry = slot.lock().await;
    assert_eq!(entry.payment_state, PaymentState::Declined);
    assert!(entry.settled_at.is_none());
}

#[tokio::test]
async fn unknown_notifications_are_acked_and_dropped() {
    let server = MockServer::start().await;
    let ledger = Arc::new(LedgerStore::new());
    let reconciler = reconciler(&server, &ledger);

    let action = reconciler
        .reconcile(&notification("n-1", "does-not-exist"))
        .await
        .unwrap();
    assert_eq!(action, ReconcileAction::UnknownEntry);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn requery_failure_leaves_the_notification_unrecorded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/payments/557"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "message": "internal error",
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/payments/557"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 557,
            "status": "approved",
            "status_detail": "accredited",
        })))
        .mount(&server)
        .await;

    let ledger = Arc::new(LedgerStore::new());
    let slot = seed_pending(&ledger, "ref-3", "557");
    let reconciler = reconciler(&server, &ledger);

    let err = reconciler
        .reconcile(&notification("n-1", "557"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Gateway { .. }), "{err:?}");
    assert!(!slot.lock().await.has_seen_notification("n-1"));

    // The gateway's retry of the very same notification succeeds.
    let action = reconciler
        .reconcile(&notification("n-1", "557"))
        .await
        .unwrap();
    assert_eq!(
        action,
        ReconcileAction::Updated {
            state: PaymentState::Approved,
            changed: true,
        }
    );
}

#[tokio::test]
async fn notifications_without_any_payment_id_error() {
    let server = MockServer::start().await;
    let ledger = Arc::new(LedgerStore::new());
    // An entry resolved by reference whose capture never returned an id.
    let entry = LedgerEntry::new(
        "ref-4".to_owned(),
        50.0,
        "MXN",
        AccessCredential::generate(CredentialKind::UserAndSecret),
    );
    ledger.create(entry);
    let reconciler = reconciler(&server, &ledger);

    let incomplete = Notification {
        notification_id: "n-1".to_owned(),
        payment_id: None,
        external_reference: Some("ref-4".to_owned()),
    };
    let err = reconciler.reconcile(&incomplete).await.unwrap_err();
    assert!(matches!(err, CoreError::Gateway { .. }), "{err:?}");
}

#[tokio::test]
async fn notification_history_stays_bounded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/payments/558"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 558,
            "status": "approved",
            "status_detail": "accredited",
        })))
        .mount(&server)
        .await;

    let ledger = Arc::new(LedgerStore::new());
    let slot = seed_pending(&ledger, "ref-5", "558");
    let reconciler = reconciler(&server, &ledger);

    for n in 0..25 {
        reconciler
            .reconcile(&notification(&format!("n-{n}"), "558"))
            .await
            .unwrap();
    }

    let entry = slot.lock().await;
    assert_eq!(entry.notification_history.len(), 20);
    assert!(!entry.has_seen_notification("n-0"));
    assert!(entry.has_seen_notification("n-24"));
}
