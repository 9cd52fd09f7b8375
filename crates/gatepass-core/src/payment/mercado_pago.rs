//! Mercado Pago payments integration.
//!
//! Captures go through `POST /v1/payments` with Bearer auth and an
//! idempotency key per attempt. Amounts are decimal; declines come
//! back as HTTP 201 with `status: "rejected"` plus a `cc_rejected_*`
//! detail code. Settlement is asynchronous: approved can arrive
//! minutes later through a webhook, which is why this gateway ships a
//! provisional pending policy.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use url::Url;
use uuid::Uuid;

use super::{
    CaptureOutcome, CaptureRequest, GatewayStatus, PaymentGateway, PendingHandling,
    SettlementPolicy, StatusSnapshot, gateway_transport_error, value_to_string,
};
use crate::error::CoreError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Buyer-facing messages for `status_detail` decline codes.
const DECLINE_MESSAGES: &[(&str, &str)] = &[
    (
        "cc_rejected_insufficient_amount",
        "The card has insufficient funds.",
    ),
    (
        "cc_rejected_bad_filled_security_code",
        "The security code is incorrect.",
    ),
    (
        "cc_rejected_bad_filled_date",
        "The expiration date is incorrect.",
    ),
    (
        "cc_rejected_bad_filled_other",
        "The card details are incorrect.",
    ),
    (
        "cc_rejected_call_for_authorize",
        "The issuer requires a phone authorization for this charge.",
    ),
    ("cc_rejected_card_disabled", "The card is not activated."),
    ("cc_rejected_duplicated_payment", "This payment was already made."),
    ("cc_rejected_high_risk", "The charge was flagged as high risk."),
    (
        "cc_rejected_max_attempts",
        "Too many attempts with this card; try another.",
    ),
    ("cc_rejected_other_reason", "The card issuer declined the charge."),
    ("cc_rejected_blacklist", "The card was refused."),
];

const GENERIC_DECLINE: &str = "The payment was not approved.";

pub struct MercadoPagoGateway {
    http: reqwest::Client,
    base_url: Url,
    access_token: SecretString,
    /// Webhook target the gateway should notify, when configured.
    notification_url: Option<String>,
    policy: SettlementPolicy,
}

impl MercadoPagoGateway {
    /// Mercado Pago settles asynchronously, so its shipped policy
    /// keeps pending captures provisional and withholds credentials
    /// until settlement confirms the money.
    pub fn new(access_token: SecretString, base_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            access_token,
            notification_url: None,
            policy: SettlementPolicy {
                pending: PendingHandling::Provisional,
                disclose_pending_credentials: false,
            },
        }
    }

    pub fn with_notification_url(mut self, url: String) -> Self {
        self.notification_url = Some(url);
        self
    }

    pub fn with_policy(mut self, policy: SettlementPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn payments_url(&self, suffix: &str) -> Result<Url, CoreError> {
        self.base_url.join(suffix).map_err(|err| CoreError::Gateway {
            message: format!("bad mercado pago url: {err}"),
        })
    }
}

/// `None` for vocabulary this integration does not recognize; the
/// caller treats that as a contract error rather than guessing.
fn classify(status: &str) -> Option<GatewayStatus> {
    match status {
        "approved" | "authorized" => Some(GatewayStatus::Approved),
        "pending" | "in_process" | "in_mediation" => Some(GatewayStatus::Pending),
        "rejected" | "cancelled" | "refunded" | "charged_back" => Some(GatewayStatus::Declined),
        _ => None,
    }
}

/// Exact match first, then substring in either direction (detail codes
/// grow suffixes between API versions), then the generic message.
fn decline_reason(status_detail: &str) -> &'static str {
    if status_detail.is_empty() {
        return GENERIC_DECLINE;
    }
    if let Some((_, message)) = DECLINE_MESSAGES
        .iter()
        .find(|(code, _)| *code == status_detail)
    {
        return message;
    }
    DECLINE_MESSAGES
        .iter()
        .find(|(code, _)| status_detail.contains(code) || code.contains(status_detail))
        .map_or(GENERIC_DECLINE, |(_, message)| message)
}

#[async_trait]
impl PaymentGateway for MercadoPagoGateway {
    async fn capture(&self, request: &CaptureRequest) -> Result<CaptureOutcome, CoreError> {
        let url = self.payments_url("v1/payments")?;
        let body = json!({
            "transaction_amount": request.amount,
            "token": request.instrument.token,
            "description": request.description,
            "installments": request.instrument.installments.unwrap_or(1),
            "payment_method_id": request.instrument.payment_method_id,
            "issuer_id": request.instrument.issuer_id,
            "payer": { "email": request.customer.email },
            "external_reference": request.external_reference,
            "metadata": request.metadata,
            "notification_url": self.notification_url,
        });

        let response = self
            .http
            .post(url)
            .bearer_auth(self.access_token.expose_secret())
            .header("X-Idempotency-Key", Uuid::new_v4().to_string())
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(gateway_transport_error)?;

        let http_status = response.status();
        let payload: Value = response.json().await.map_err(gateway_transport_error)?;

        if !http_status.is_success() {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("no error message");
            return Err(CoreError::Gateway {
                message: format!("mercado pago returned {http_status}: {message}"),
            });
        }

        let raw_status = payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        let status_detail = payload
            .get("status_detail")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let payment_id = value_to_string(payload.get("id")).unwrap_or_default();

        let Some(status) = classify(&raw_status) else {
            return Err(CoreError::Gateway {
                message: format!("mercado pago reported unrecognized status '{raw_status}'"),
            });
        };
        tracing::info!(payment = %payment_id, status = %raw_status, "mercado pago payment created");

        let reason = match status {
            GatewayStatus::Declined => Some(
                decline_reason(status_detail.as_deref().unwrap_or_default()).to_owned(),
            ),
            GatewayStatus::Pending => Some("the payment is pending confirmation".to_owned()),
            GatewayStatus::Approved => None,
        };
        Ok(CaptureOutcome {
            payment_id,
            status,
            raw_status,
            status_detail,
            reason,
        })
    }

    async fn status(&self, payment_id: &str) -> Result<StatusSnapshot, CoreError> {
        let url = self.payments_url(&format!("v1/payments/{payment_id}"))?;
        let response = self
            .http
            .get(url)
            .bearer_auth(self.access_token.expose_secret())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(gateway_transport_error)?;
        if !response.status().is_success() {
            return Err(CoreError::Gateway {
                message: format!("mercado pago status query returned {}", response.status()),
            });
        }
        let payload: Value = response.json().await.map_err(gateway_transport_error)?;
        let raw_status = payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        let status_detail = payload
            .get("status_detail")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let Some(status) = classify(&raw_status) else {
            return Err(CoreError::Gateway {
                message: format!("mercado pago reported unrecognized status '{raw_status}'"),
            });
        };
        Ok(StatusSnapshot {
            status,
            raw_status,
            status_detail,
        })
    }

    fn settlement_policy(&self) -> SettlementPolicy {
        self.policy
    }

    fn name(&self) -> &'static str {
        "mercado_pago"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn status_vocabulary_is_classified() {
        assert_eq!(classify("approved"), Some(GatewayStatus::Approved));
        assert_eq!(classify("in_process"), Some(GatewayStatus::Pending));
        assert_eq!(classify("in_mediation"), Some(GatewayStatus::Pending));
        assert_eq!(classify("rejected"), Some(GatewayStatus::Declined));
        assert_eq!(classify("charged_back"), Some(GatewayStatus::Declined));
        assert_eq!(classify("weird_new_state"), None);
    }

    #[test]
    fn decline_reasons_match_loosely() {
        assert_eq!(
            decline_reason("cc_rejected_insufficient_amount"),
            "The card has insufficient funds."
        );
        // Suffix added by a newer API version still matches.
        assert_eq!(
            decline_reason("cc_rejected_insufficient_amount_v2"),
            "The card has insufficient funds."
        );
        assert_eq!(decline_reason("totally_unknown"), GENERIC_DECLINE);
        assert_eq!(decline_reason(""), GENERIC_DECLINE);
    }
}
