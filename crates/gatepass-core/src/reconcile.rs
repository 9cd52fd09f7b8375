//! Settlement reconciliation.
//!
//! Gateways announce settlement through webhooks that are late,
//! repeated, out of order, and occasionally forged. The reconciler
//! treats the notification as a doorbell, not a message: it resolves
//! the ledger entry, re-queries the gateway for the authoritative
//! state, and applies it idempotently under the entry's own lock.

use std::sync::Arc;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::error::CoreError;
use crate::model::PaymentState;
use crate::payment::{GatewayStatus, PaymentGateway, value_to_string};
use crate::store::LedgerStore;

/// Event types that settle payments; anything else is acknowledged
/// and dropped without touching the ledger.
const SETTLEMENT_EVENT_TYPES: &[&str] = &["payment", "plan", "subscription", "invoice", "test"];

pub fn is_settlement_event(event_type: &str) -> bool {
    SETTLEMENT_EVENT_TYPES.contains(&event_type)
}

/// A parsed settlement notification. Carries identifiers only; any
/// state in the body is deliberately not represented here.
#[derive(Debug, Clone)]
pub struct Notification {
    pub notification_id: String,
    pub payment_id: Option<String>,
    pub external_reference: Option<String>,
}

impl Notification {
    /// Extract identifiers from a notification envelope.
    /// `fallback_data_id` covers gateways that only put `data.id` in
    /// the query string. Returns `None` when there is no notification
    /// id at all, which is the one unrecoverable shape.
    pub fn from_envelope(body: &Value, fallback_data_id: Option<&str>) -> Option<Self> {
        let notification_id = value_to_string(body.get("id"))?;
        let payment_id = value_to_string(body.pointer("/data/id"))
            .or_else(|| fallback_data_id.map(str::to_owned));
        let external_reference = value_to_string(body.get("external_reference"));
        Some(Self {
            notification_id,
            payment_id,
            external_reference,
        })
    }
}

/// What one reconcile pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Authoritative state applied; `changed` is false when the entry
    /// already carried it.
    Updated { state: PaymentState, changed: bool },
    /// Notification id seen before; nothing touched.
    Duplicate,
    /// No ledger entry matches; acknowledged and dropped.
    UnknownEntry,
}

pub struct Reconciler {
    ledger: Arc<LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
}

impl Reconciler {
    pub fn new(ledger: Arc<LedgerStore>, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self { ledger, gateway }
    }

    /// Reconcile one notification against the ledger.
    ///
    /// The entry lock is held across the whole pass, so concurrent
    /// notifications for the same sale serialize: the duplicate check,
    /// the re-query, and the state application are atomic with respect
    /// to each other. Distinct entries proceed in parallel.
    ///
    /// On a re-query error the notification id is NOT recorded, so the
    /// gateway's retry gets a clean second chance.
    pub async fn reconcile(&self, notification: &Notification) -> Result<ReconcileAction, CoreError> {
        let Some(slot) = self.ledger.resolve(
            notification.external_reference.as_deref(),
            notification.payment_id.as_deref(),
        ) else {
            tracing::warn!(
                notification = %notification.notification_id,
                "notification matches no ledger entry"
            );
            return Ok(ReconcileAction::UnknownEntry);
        };

        let mut entry = slot.lock().await;

        if entry.has_seen_notification(&notification.notification_id) {
            tracing::info!(
                notification = %notification.notification_id,
                reference = %entry.external_reference,
                "duplicate notification ignored"
            );
            return Ok(ReconcileAction::Duplicate);
        }

        let payment_id = notification
            .payment_id
            .clone()
            .unwrap_or_else(|| entry.external_payment_id.clone());
        if payment_id.is_empty() {
            return Err(CoreError::Gateway {
                message: "notification carries no payment id to re-query".to_owned(),
            });
        }

        let snapshot = self.gateway.status(&payment_id).await?;
        let state = match snapshot.status {
            GatewayStatus::Approved => PaymentState::Approved,
            GatewayStatus::Pending => PaymentState::Pending,
            GatewayStatus::Declined => PaymentState::Declined,
        };
        let changed = entry.apply_settlement(state, Utc::now());
        entry.record_notification(&notification.notification_id);
        tracing::info!(
            reference = %entry.external_reference,
            raw_status = %snapshot.raw_status,
            state = %state,
            changed,
            "settlement reconciled"
        );
        Ok(ReconcileAction::Updated { state, changed })
    }
}

// ── Signature verification ───────────────────────────────────────────

/// Policy for notifications whose signature fails to verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignaturePolicy {
    /// Refuse the notification outright.
    Reject,
    /// Log loudly and process anyway. The shipped default, inherited
    /// from deployments where gateways rotate secrets without notice;
    /// real-money deployments should run `Reject`.
    #[default]
    WarnAndProcess,
}

type HmacSha256 = Hmac<Sha256>;

/// Verify a `ts=...,v1=...` signature header against the manifest
/// `id:{data_id};request-id:{request_id};ts:{ts};` keyed with the
/// webhook secret. Any missing or malformed input fails closed.
pub fn verify_signature(
    secret: &str,
    signature_header: &str,
    data_id: &str,
    request_id: &str,
) -> bool {
    if secret.is_empty() || data_id.is_empty() || request_id.is_empty() {
        return false;
    }
    let Some((ts_part, v1_part)) = signature_header.split_once(',') else {
        return false;
    };
    if v1_part.contains(',') {
        return false;
    }
    let Some(ts) = ts_part.trim().strip_prefix("ts=") else {
        return false;
    };
    let Some(received_hex) = v1_part.trim().strip_prefix("v1=") else {
        return false;
    };
    let Ok(received) = hex::decode(received_hex) else {
        return false;
    };

    let manifest = format!("id:{data_id};request-id:{request_id};ts:{ts};");
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(manifest.as_bytes());
    mac.verify_slice(&received).is_ok()
}
