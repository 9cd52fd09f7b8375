//! The provisioning saga.
//!
//! Order of operations is the whole point:
//!
//! 1. ledger entry, so every later step has somewhere to record
//! 2. device user, before any money moves -- charging for access we
//!    could not provision is the one unforgivable failure
//! 3. payment capture
//! 4. classification against the gateway's settlement policy
//! 5. optional session bind
//!
//! A terminal non-approval (or a capture error) compensates by
//! deleting the device user. A bind failure compensates nothing: at
//! that point the buyer has paid for a working credential and merely
//! has to type it in themselves.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use gatepass_routeros::DeviceEndpoint;

use crate::device::binder::{self, BindFailure, BindRequest, BindResult, BinderConfig};
use crate::device::users::{self, CreateOptions, DeleteOutcome, UserManagerConfig};
use crate::error::CoreError;
use crate::model::{AccessCredential, CredentialKind, LedgerEntry, MacAddress, PaymentState};
use crate::payment::{
    CaptureRequest, CustomerInfo, GatewayStatus, PaymentGateway, PaymentInstrument,
    PendingHandling,
};
use crate::store::{EntrySlot, LedgerStore};

/// Product terms resolved by the caller; the catalog itself lives in
/// configuration, not here.
#[derive(Debug, Clone)]
pub struct ProductPolicy {
    pub profile_name: String,
    pub amount: f64,
    pub currency: String,
    pub credential_kind: CredentialKind,
    pub description: String,
}

/// Optional auto-bind piggybacked on a purchase.
#[derive(Debug, Clone)]
pub struct AutoBindRequest {
    pub mac: MacAddress,
    pub ip: Option<String>,
}

/// What the buyer (and the operator's logs) get back from a saga that
/// ran to completion.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningOutcome {
    pub external_reference: String,
    pub payment_id: String,
    pub state: PaymentState,
    pub status_detail: Option<String>,
    /// True while the gateway is still settling. The credential may be
    /// redacted in that case, per the gateway's policy.
    pub pending_confirmation: bool,
    pub credential: AccessCredential,
    pub bind: Option<BindResult>,
}

/// Ties the ledger, one gateway, and one appliance together.
pub struct SagaCoordinator {
    ledger: Arc<LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    endpoint: DeviceEndpoint,
    users: UserManagerConfig,
    binder: BinderConfig,
}

impl SagaCoordinator {
    pub fn new(
        ledger: Arc<LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        endpoint: DeviceEndpoint,
    ) -> Self {
        Self::with_configs(
            ledger,
            gateway,
            endpoint,
            UserManagerConfig::default(),
            BinderConfig::default(),
        )
    }

    pub fn with_configs(
        ledger: Arc<LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        endpoint: DeviceEndpoint,
        users: UserManagerConfig,
        binder: BinderConfig,
    ) -> Self {
        Self {
            ledger,
            gateway,
            endpoint,
            users,
            binder,
        }
    }

    pub fn ledger(&self) -> &Arc<LedgerStore> {
        &self.ledger
    }

    /// Run one provisioning saga to completion. Every step either
    /// finishes or compensates before this returns; there is no
    /// partially-provisioned error path.
    pub async fn provision(
        &self,
        product: &ProductPolicy,
        instrument: PaymentInstrument,
        customer: CustomerInfo,
        auto_bind: Option<AutoBindRequest>,
    ) -> Result<ProvisioningOutcome, CoreError> {
        let reference = Uuid::new_v4().to_string();
        let credential = AccessCredential::generate(product.credential_kind);
        let slot = self.ledger.create(LedgerEntry::new(
            reference.clone(),
            product.amount,
            &product.currency,
            credential.clone(),
        ));
        tracing::info!(
            reference = %reference,
            profile = %product.profile_name,
            amount = product.amount,
            "provisioning started"
        );

        // Device user before money.
        let created = users::create_user(
            &self.endpoint,
            &credential,
            &product.profile_name,
            &CreateOptions::default(),
            &self.users,
        )
        .await;
        match created {
            Ok(outcome) => {
                let mut entry = slot.lock().await;
                entry.device_user_created = true;
                drop(entry);
                tracing::info!(
                    reference = %reference,
                    verified = outcome.verified,
                    "device user provisioned"
                );
            }
            Err(err) => {
                slot.lock()
                    .await
                    .apply_settlement(PaymentState::Errored, Utc::now());
                tracing::warn!(
                    reference = %reference,
                    error = %err,
                    "user creation failed; no payment was attempted"
                );
                return Err(err);
            }
        }

        // Capture.
        let capture_request = CaptureRequest {
            amount: product.amount,
            currency: product.currency.clone(),
            instrument,
            customer,
            description: product.description.clone(),
            external_reference: reference.clone(),
            metadata: json!({
                "profile": product.profile_name,
                "credential_kind": product.credential_kind.to_string(),
            }),
        };
        let capture = match self.gateway.capture(&capture_request).await {
            Ok(capture) => capture,
            Err(err) => {
                tracing::warn!(reference = %reference, error = %err, "capture failed; compensating");
                self.compensate_user(&slot, &credential.identifier, PaymentState::Errored)
                    .await;
                return Err(err);
            }
        };

        // Classify against the gateway's settlement policy.
        let policy = self.gateway.settlement_policy();
        let (state, pending_confirmation) = match capture.status {
            GatewayStatus::Approved => (PaymentState::Approved, false),
            GatewayStatus::Pending => match policy.pending {
                PendingHandling::Provisional => (PaymentState::Pending, true),
                PendingHandling::Reject => {
                    tracing::info!(
                        reference = %reference,
                        gateway = self.gateway.name(),
                        "pending capture treated as terminal; compensating"
                    );
                    self.compensate_user(&slot, &credential.identifier, PaymentState::Declined)
                        .await;
                    return Err(CoreError::PaymentRejected {
                        status: capture.raw_status,
                        reason: capture
                            .reason
                            .unwrap_or_else(|| "the payment is still pending confirmation".to_owned()),
                    });
                }
            },
            GatewayStatus::Declined => {
                tracing::info!(
                    reference = %reference,
                    status = %capture.raw_status,
                    "payment declined; compensating"
                );
                self.compensate_user(&slot, &credential.identifier, PaymentState::Declined)
                    .await;
                return Err(CoreError::PaymentRejected {
                    status: capture.raw_status,
                    reason: capture
                        .reason
                        .unwrap_or_else(|| "the payment was not approved".to_owned()),
                });
            }
        };

        {
            let mut entry = slot.lock().await;
            entry.external_payment_id = capture.payment_id.clone();
            entry.apply_settlement(state, Utc::now());
        }
        // Indexed only after classification: racing webhooks for a
        // not-yet-recorded payment must ack as unknown, not deadlock.
        self.ledger.index_payment_id(&capture.payment_id, &reference);

        let bind = if let Some(auto) = auto_bind {
            Some(self.try_bind(&slot, &credential, auto).await)
        } else {
            None
        };

        let disclose = state == PaymentState::Approved
            || (pending_confirmation && policy.disclose_pending_credentials);
        let outcome_credential = if disclose {
            credential
        } else {
            tracing::info!(reference = %reference, "withholding credentials until settlement");
            credential.redacted()
        };

        Ok(ProvisioningOutcome {
            external_reference: reference,
            payment_id: capture.payment_id,
            state,
            status_detail: capture.status_detail,
            pending_confirmation,
            credential: outcome_credential,
            bind,
        })
    }

    /// Bind failures are reported, never unwound: the sale stands.
    async fn try_bind(
        &self,
        slot: &EntrySlot,
        credential: &AccessCredential,
        auto: AutoBindRequest,
    ) -> BindResult {
        let request = BindRequest {
            credential: credential.clone(),
            mac: auto.mac,
            ip: auto.ip,
        };
        match binder::bind_auto(&self.endpoint, &request, &self.binder).await {
            Ok(result) => {
                if result.authenticated {
                    slot.lock().await.session_bound = true;
                }
                result
            }
            Err(err) => {
                tracing::warn!(error = %err, "auto-bind failed; sale stands");
                BindResult {
                    success: false,
                    authenticated: false,
                    session: None,
                    method: None,
                    failure: Some(BindFailure::DeviceUnavailable),
                }
            }
        }
    }

    /// Terminal non-approval: the device user must not outlive the
    /// money. Deletion is attempted once, best-effort; the flag is
    /// cleared either way so a declined entry never claims a billable
    /// user.
    async fn compensate_user(&self, slot: &EntrySlot, identifier: &str, state: PaymentState) {
        let outcome = users::delete_user(&self.endpoint, identifier, &self.users).await;
        if outcome == DeleteOutcome::Failed {
            tracing::error!(
                user = identifier,
                "compensating delete failed; the user may be orphaned on the device"
            );
        }
        let mut entry = slot.lock().await;
        entry.device_user_created = false;
        entry.apply_settlement(state, Utc::now());
    }
}
