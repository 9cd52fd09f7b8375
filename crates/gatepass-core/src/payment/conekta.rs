//! Conekta orders integration.
//!
//! Captures go through `POST /orders` with an embedded card charge.
//! Amounts are integer cents; authentication is HTTP Basic with the
//! private key as username. Declines arrive as HTTP 402 with an error
//! envelope rather than as an order status.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use url::Url;

use super::{
    CaptureOutcome, CaptureRequest, GatewayStatus, PaymentGateway, PendingHandling,
    SettlementPolicy, StatusSnapshot, gateway_transport_error,
};
use crate::error::CoreError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ACCEPT_HEADER: &str = "application/vnd.conekta-v2.1.0+json";
const DESCRIPTION_LIMIT: usize = 250;

/// Buyer-facing messages for issuer decline codes; anything unlisted
/// gets the generic one.
const DECLINE_MESSAGES: &[(&str, &str)] = &[
    ("card_declined", "The card was declined by the issuer."),
    ("insufficient_funds", "The card has insufficient funds."),
    ("expired_card", "The card is expired."),
    ("invalid_number", "The card number is invalid."),
    ("invalid_cvc", "The security code is invalid."),
    ("card_not_supported", "This card type is not supported."),
    (
        "suspected_fraud",
        "The charge was flagged as possibly fraudulent.",
    ),
    (
        "processing_error",
        "The card could not be processed. Try again.",
    ),
];

const GENERIC_DECLINE: &str = "The payment was not approved.";

pub struct ConektaGateway {
    http: reqwest::Client,
    base_url: Url,
    private_key: SecretString,
    policy: SettlementPolicy,
}

impl ConektaGateway {
    /// Conekta settles synchronously, so its shipped policy treats a
    /// pending order as a failure and discloses credentials only on
    /// approval (which, with `pending: Reject`, is the only success).
    pub fn new(private_key: SecretString, base_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            private_key,
            policy: SettlementPolicy {
                pending: PendingHandling::Reject,
                disclose_pending_credentials: true,
            },
        }
    }

    pub fn with_policy(mut self, policy: SettlementPolicy) -> Self {
        self.policy = policy;
        self
    }

    fn order_url(&self, suffix: &str) -> Result<Url, CoreError> {
        self.base_url.join(suffix).map_err(|err| CoreError::Gateway {
            message: format!("bad conekta url: {err}"),
        })
    }
}

fn classify(payment_status: &str) -> GatewayStatus {
    match payment_status {
        "paid" => GatewayStatus::Approved,
        "pending" | "pending_payment" => GatewayStatus::Pending,
        _ => GatewayStatus::Declined,
    }
}

fn decline_reason(code: &str) -> &'static str {
    DECLINE_MESSAGES
        .iter()
        .find(|(known, _)| *known == code)
        .map_or(GENERIC_DECLINE, |(_, message)| message)
}

fn is_decline_code(code: &str) -> bool {
    DECLINE_MESSAGES.iter().any(|(known, _)| *known == code)
}

fn truncate(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[async_trait]
impl PaymentGateway for ConektaGateway {
    async fn capture(&self, request: &CaptureRequest) -> Result<CaptureOutcome, CoreError> {
        let url = self.order_url("orders")?;
        #[allow(clippy::cast_possible_truncation)]
        let amount_cents = (request.amount * 100.0).round() as i64;
        let body = json!({
            "currency": request.currency.to_uppercase(),
            "customer_info": {
                "name": request.customer.name,
                "email": request.customer.email,
                "phone": request.customer.phone.as_deref().unwrap_or("0000000000"),
            },
            "line_items": [{
                "name": truncate(&request.description, DESCRIPTION_LIMIT),
                "unit_price": amount_cents,
                "quantity": 1,
            }],
            "charges": [{
                "payment_method": { "type": "card", "token_id": request.instrument.token },
            }],
            "metadata": {
                "external_reference": request.external_reference,
                "extra": request.metadata,
            },
        });

        let response = self
            .http
            .post(url)
            .basic_auth(self.private_key.expose_secret(), Some(""))
            .header(reqwest::header::ACCEPT, ACCEPT_HEADER)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(gateway_transport_error)?;

        let http_status = response.status();
        let payload: Value = response.json().await.map_err(gateway_transport_error)?;

        if http_status.is_success() {
            let raw_status = payload
                .get("payment_status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_owned();
            let order_id = payload
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            let status = classify(&raw_status);
            tracing::info!(order = %order_id, status = %raw_status, "conekta order created");
            let reason = match status {
                GatewayStatus::Declined => Some(decline_reason(&raw_status).to_owned()),
                GatewayStatus::Pending => Some("the payment is pending confirmation".to_owned()),
                GatewayStatus::Approved => None,
            };
            return Ok(CaptureOutcome {
                payment_id: order_id,
                status,
                raw_status,
                status_detail: None,
                reason,
            });
        }

        // Declines come back as HTTP errors with an error envelope.
        let code = payload
            .pointer("/details/0/code")
            .and_then(Value::as_str)
            .or_else(|| payload.get("type").and_then(Value::as_str))
            .unwrap_or("unknown")
            .to_owned();
        let detail = payload
            .pointer("/details/0/message")
            .and_then(Value::as_str)
            .map(str::to_owned);
        if http_status == StatusCode::PAYMENT_REQUIRED || is_decline_code(&code) {
            tracing::info!(code = %code, "conekta declined the charge");
            return Ok(CaptureOutcome {
                payment_id: String::new(),
                status: GatewayStatus::Declined,
                raw_status: code.clone(),
                status_detail: detail,
                reason: Some(decline_reason(&code).to_owned()),
            });
        }
        Err(CoreError::Gateway {
            message: format!("conekta returned {http_status}: {code}"),
        })
    }

    async fn status(&self, payment_id: &str) -> Result<StatusSnapshot, CoreError> {
        let url = self.order_url(&format!("orders/{payment_id}"))?;
        let response = self
            .http
            .get(url)
            .basic_auth(self.private_key.expose_secret(), Some(""))
            .header(reqwest::header::ACCEPT, ACCEPT_HEADER)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(gateway_transport_error)?;
        if !response.status().is_success() {
            return Err(CoreError::Gateway {
                message: format!("conekta status query returned {}", response.status()),
            });
        }
        let payload: Value = response.json().await.map_err(gateway_transport_error)?;
        let raw_status = payload
            .get("payment_status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        Ok(StatusSnapshot {
            status: classify(&raw_status),
            raw_status,
            status_detail: None,
        })
    }

    fn settlement_policy(&self) -> SettlementPolicy {
        self.policy
    }

    fn name(&self) -> &'static str {
        "conekta"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn payment_status_classification() {
        assert_eq!(classify("paid"), GatewayStatus::Approved);
        assert_eq!(classify("pending"), GatewayStatus::Pending);
        assert_eq!(classify("pending_payment"), GatewayStatus::Pending);
        assert_eq!(classify("declined"), GatewayStatus::Declined);
        assert_eq!(classify("expired"), GatewayStatus::Declined);
    }

    #[test]
    fn decline_codes_map_to_messages() {
        assert_eq!(
            decline_reason("insufficient_funds"),
            "The card has insufficient funds."
        );
        assert_eq!(decline_reason("never_heard_of_it"), GENERIC_DECLINE);
        assert!(is_decline_code("card_declined"));
        assert!(!is_decline_code("parameter_validation_error"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 250), "short");
        let long = "é".repeat(200);
        let cut = truncate(&long, 251);
        assert!(cut.len() <= 251);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
