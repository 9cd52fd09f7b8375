//! Ledger entries: one per sale attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;

use super::credential::AccessCredential;

/// Payment lifecycle. `Pending` is the only non-terminal state; the
/// reconciler may still re-announce a terminal one, and applying it
/// again is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Approved,
    Declined,
    Errored,
}

/// Most recent notification ids kept per entry.
const NOTIFICATION_HISTORY_LIMIT: usize = 20;

/// One sale: the payment, the credential it bought, and what has been
/// provisioned so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Our reference, minted before the gateway sees anything.
    pub external_reference: String,
    /// The gateway's payment or order id; empty until capture returns.
    pub external_payment_id: String,
    pub amount: f64,
    pub currency: String,
    pub credential: AccessCredential,
    pub payment_state: PaymentState,
    pub device_user_created: bool,
    pub session_bound: bool,
    pub created_at: DateTime<Utc>,
    /// First time the payment reached `Approved`; never moves after.
    pub settled_at: Option<DateTime<Utc>>,
    /// Recently seen notification ids, oldest first.
    pub notification_history: Vec<String>,
}

impl LedgerEntry {
    pub fn new(
        external_reference: String,
        amount: f64,
        currency: &str,
        credential: AccessCredential,
    ) -> Self {
        Self {
            external_reference,
            external_payment_id: String::new(),
            amount,
            currency: currency.to_owned(),
            credential,
            payment_state: PaymentState::Pending,
            device_user_created: false,
            session_bound: false,
            created_at: Utc::now(),
            settled_at: None,
            notification_history: Vec::new(),
        }
    }

    pub fn has_seen_notification(&self, notification_id: &str) -> bool {
        self.notification_history
            .iter()
            .any(|id| id == notification_id)
    }

    /// Record a notification id, dropping the oldest entries beyond
    /// the history cap. Returns false when the id was already seen.
    pub fn record_notification(&mut self, notification_id: &str) -> bool {
        if self.has_seen_notification(notification_id) {
            return false;
        }
        self.notification_history.push(notification_id.to_owned());
        if self.notification_history.len() > NOTIFICATION_HISTORY_LIMIT {
            let excess = self.notification_history.len() - NOTIFICATION_HISTORY_LIMIT;
            self.notification_history.drain(..excess);
        }
        true
    }

    /// Apply an authoritative settlement state. Idempotent: re-applying
    /// the current state changes nothing, and `settled_at` is stamped
    /// only by the first transition to `Approved`. Returns whether the
    /// state actually changed.
    pub fn apply_settlement(&mut self, state: PaymentState, now: DateTime<Utc>) -> bool {
        let changed = self.payment_state != state;
        self.payment_state = state;
        if state == PaymentState::Approved && self.settled_at.is_none() {
            self.settled_at = Some(now);
        }
        changed
    }
}
