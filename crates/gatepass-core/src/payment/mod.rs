//! Payment gateways.
//!
//! One object-safe trait, two integrations, and the settlement policy
//! objects that keep per-gateway pending philosophies out of the saga.
//! The saga never matches on a gateway name; everything
//! provider-specific rides on [`PaymentGateway`] and
//! [`SettlementPolicy`].

pub mod conekta;
pub mod mercado_pago;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Tri-state classification the saga acts on. Raw gateway vocabulary
/// stays in [`CaptureOutcome::raw_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Approved,
    /// Not yet terminal; the reconciler settles it later.
    Pending,
    /// Terminal non-approval: declined, cancelled, refunded, expired.
    Declined,
}

/// Card token plus the fields gateways disagree about.
#[derive(Debug, Clone, Default)]
pub struct PaymentInstrument {
    /// Single-use card token minted by the gateway's client SDK.
    pub token: String,
    pub payment_method_id: Option<String>,
    pub issuer_id: Option<String>,
    pub installments: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct CustomerInfo {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

/// One capture attempt.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub amount: f64,
    pub currency: String,
    pub instrument: PaymentInstrument,
    pub customer: CustomerInfo,
    pub description: String,
    /// Our ledger reference; round-trips through the gateway and back
    /// in notifications.
    pub external_reference: String,
    pub metadata: Value,
}

/// What a capture reported.
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    /// Gateway-assigned payment or order id. Empty when the gateway
    /// declined before assigning one.
    pub payment_id: String,
    pub status: GatewayStatus,
    /// The gateway's own status word ("paid", "approved", ...).
    pub raw_status: String,
    /// Finer-grained detail, when the gateway provides one.
    pub status_detail: Option<String>,
    /// Buyer-facing reason for non-approvals.
    pub reason: Option<String>,
}

/// Point-in-time status from an authoritative re-query.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub status: GatewayStatus,
    pub raw_status: String,
    pub status_detail: Option<String>,
}

/// What the saga does when a capture comes back `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingHandling {
    /// Treat pending as terminal: compensate and reject the sale.
    Reject,
    /// Soft success: keep the entry pending and let settlement
    /// notifications finish the job.
    Provisional,
}

/// Per-gateway settlement philosophy, carried as data so deployments
/// can override either axis in config without touching the saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettlementPolicy {
    pub pending: PendingHandling,
    /// Whether a provisional (pending) outcome may disclose the
    /// credential to the buyer before settlement.
    pub disclose_pending_credentials: bool,
}

/// A card payment gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Capture a payment. `Err` means the attempt itself failed
    /// (transport, contract); a refusal is an `Ok` outcome with
    /// [`GatewayStatus::Declined`].
    async fn capture(&self, request: &CaptureRequest) -> Result<CaptureOutcome, CoreError>;

    /// Authoritative current status of a payment. Notification bodies
    /// are hints; this is the truth.
    async fn status(&self, payment_id: &str) -> Result<StatusSnapshot, CoreError>;

    fn settlement_policy(&self) -> SettlementPolicy;

    fn name(&self) -> &'static str;
}

pub(crate) fn gateway_transport_error(err: reqwest::Error) -> CoreError {
    CoreError::Gateway {
        message: err.to_string(),
    }
}

/// Gateways disagree on id types (strings vs numbers); normalize both.
pub(crate) fn value_to_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
