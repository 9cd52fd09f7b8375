//! HTTP surface.
//!
//! Four routes: liveness, purchase, the payment webhook, and an
//! authoritative status re-query. Purchases run the provisioning saga
//! under a semaphore so a burst of buyers cannot pile onto the
//! appliance; webhooks are acknowledged immediately and reconciled on
//! a spawned task so the gateway's retry cadence never couples to
//! device or ledger latency.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Semaphore;

use gatepass_config::{Config, ConfigError, ProductConfig};
use gatepass_core::{
    AutoBindRequest, CoreError, CustomerInfo, GatewayStatus, LedgerStore, MacAddress,
    Notification, PaymentGateway, PaymentInstrument, Reconciler, SagaCoordinator,
    SignaturePolicy, is_settlement_event, verify_signature,
};

/// Largest accepted drift between the client-echoed amount and the
/// catalog price.
const AMOUNT_TOLERANCE: f64 = 0.01;

// ── State ────────────────────────────────────────────────────────────

pub struct AppState {
    saga: SagaCoordinator,
    reconciler: Reconciler,
    ledger: Arc<LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    products: Vec<ProductConfig>,
    device_permits: Semaphore,
    webhook_secret: Option<String>,
    signature_policy: SignaturePolicy,
}

impl AppState {
    pub fn from_config(config: &Config) -> Result<Arc<Self>, ConfigError> {
        let ledger = Arc::new(LedgerStore::new());
        let gateway = config.build_gateway()?;
        let saga = SagaCoordinator::with_configs(
            Arc::clone(&ledger),
            Arc::clone(&gateway),
            config.device_endpoint(),
            config.user_manager_config(),
            config.binder_config(),
        );
        let reconciler = Reconciler::new(Arc::clone(&ledger), Arc::clone(&gateway));

        Ok(Arc::new(Self {
            saga,
            reconciler,
            ledger,
            gateway,
            products: config.product.clone(),
            device_permits: Semaphore::new(config.service.device_concurrency),
            webhook_secret: config.webhook_secret().map(str::to_owned),
            signature_policy: config.signature_policy(),
        }))
    }

    fn product(&self, id: &str) -> Option<&ProductConfig> {
        self.products.iter().find(|product| product.id == id)
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/purchases", post(create_purchase))
        .route("/v1/webhooks/payments", post(payment_webhook))
        .route("/v1/payments/:payment_id", get(payment_status))
        .with_state(state)
}

// ── Error mapping ────────────────────────────────────────────────────

/// A request-time failure, already shaped for the wire.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let (status, code) = match &err {
            CoreError::Validation { .. } => (StatusCode::BAD_REQUEST, "validation"),
            CoreError::ProfileNotFound { .. } => (StatusCode::NOT_FOUND, "profile_not_found"),
            CoreError::LedgerEntryNotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            CoreError::DuplicateUser { .. } => (StatusCode::CONFLICT, "duplicate_user"),
            CoreError::PaymentRejected { .. } => {
                (StatusCode::PAYMENT_REQUIRED, "payment_rejected")
            }
            CoreError::Connection { .. } | CoreError::Device(_) => {
                (StatusCode::BAD_GATEWAY, "device_unavailable")
            }
            CoreError::Gateway { .. } => (StatusCode::BAD_GATEWAY, "gateway_error"),
        };
        Self::new(status, code, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": { "code": self.code, "message": self.message }
        });
        (self.status, Json(body)).into_response()
    }
}

// ── Request bodies ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PurchaseRequest {
    product: String,
    /// Client-echoed price; must match the catalog within one cent.
    amount: Option<f64>,
    card: CardFields,
    customer: CustomerFields,
    auto_bind: Option<AutoBindFields>,
}

#[derive(Debug, Deserialize)]
struct CardFields {
    token: String,
    payment_method_id: Option<String>,
    issuer_id: Option<String>,
    installments: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CustomerFields {
    name: String,
    email: String,
    phone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AutoBindFields {
    mac: String,
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WebhookQuery {
    /// Gateways that omit `data.id` from the body put it here.
    #[serde(rename = "data.id")]
    data_id: Option<String>,
}

fn amount_matches(echoed: f64, price: f64) -> bool {
    (echoed - price).abs() <= AMOUNT_TOLERANCE
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

// ── Handlers ─────────────────────────────────────────────────────────

#[allow(clippy::unused_async)]
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

async fn create_purchase(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PurchaseRequest>,
) -> Result<(StatusCode, Json<gatepass_core::ProvisioningOutcome>), ApiError> {
    let Some(product) = state.product(&request.product) else {
        return Err(ApiError::not_found(format!(
            "unknown product '{}'",
            request.product
        )));
    };
    if let Some(echoed) = request.amount {
        if !amount_matches(echoed, product.amount) {
            return Err(ApiError::bad_request(format!(
                "amount {echoed} does not match the price of '{}'",
                product.id
            )));
        }
    }

    let auto_bind = match request.auto_bind {
        Some(fields) => Some(AutoBindRequest {
            mac: MacAddress::parse(&fields.mac)?,
            ip: fields.ip,
        }),
        None => None,
    };
    let instrument = PaymentInstrument {
        token: request.card.token,
        payment_method_id: request.card.payment_method_id,
        issuer_id: request.card.issuer_id,
        installments: request.card.installments,
    };
    let customer = CustomerInfo {
        name: request.customer.name,
        email: request.customer.email,
        phone: request.customer.phone,
    };

    let _permit = state
        .device_permits
        .acquire()
        .await
        .map_err(|_| ApiError::internal("device queue closed"))?;

    let policy = product.policy();
    let outcome = state
        .saga
        .provision(&policy, instrument, customer, auto_bind)
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

#[allow(clippy::unused_async)]
async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let envelope: Value = serde_json::from_str(&body)
        .map_err(|err| ApiError::bad_request(format!("notification body is not JSON: {err}")))?;

    let event_type = envelope
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("payment");
    if !is_settlement_event(event_type) {
        tracing::debug!(event_type, "ignoring non-settlement notification");
        return Ok(Json(json!({ "status": "ignored" })));
    }

    let Some(notification) = Notification::from_envelope(&envelope, query.data_id.as_deref())
    else {
        return Err(ApiError::bad_request("notification carries no id"));
    };

    if let Some(secret) = &state.webhook_secret {
        let data_id = notification.payment_id.as_deref().unwrap_or_default();
        let verified = verify_signature(
            secret,
            header_str(&headers, "x-signature"),
            data_id,
            header_str(&headers, "x-request-id"),
        );
        if !verified {
            match state.signature_policy {
                SignaturePolicy::Reject => {
                    return Err(ApiError::unauthorized("notification signature rejected"));
                }
                SignaturePolicy::WarnAndProcess => {
                    tracing::warn!(
                        notification = %notification.notification_id,
                        "signature verification failed; processing anyway"
                    );
                }
            }
        }
    }

    let action = envelope
        .get("action")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let worker = Arc::clone(&state);
    tokio::spawn(async move {
        match worker.reconciler.reconcile(&notification).await {
            Ok(outcome) => tracing::debug!(?outcome, action, "reconcile pass finished"),
            Err(err) => tracing::error!(%err, action, "reconcile failed; gateway will retry"),
        }
    });

    Ok(Json(json!({ "status": "accepted" })))
}

async fn payment_status(
    State(state): State<Arc<AppState>>,
    Path(payment_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let snapshot = state.gateway.status(&payment_id).await?;
    let status = match snapshot.status {
        GatewayStatus::Approved => "approved",
        GatewayStatus::Pending => "pending",
        GatewayStatus::Declined => "declined",
    };

    let ledger = match state.ledger.by_payment_id(&payment_id) {
        Some(slot) => {
            let entry = slot.lock().await;
            json!({
                "external_reference": entry.external_reference,
                "state": entry.payment_state,
                "session_bound": entry.session_bound,
                "settled_at": entry.settled_at,
            })
        }
        None => Value::Null,
    };

    Ok(Json(json!({
        "payment_id": payment_id,
        "status": status,
        "raw_status": snapshot.raw_status,
        "status_detail": snapshot.status_detail,
        "ledger": ledger,
    })))
}
