//! Core domain for gatepass: selling timed hotspot access on
//! RouterOS-style appliances.
//!
//! The crate is organized around one flow, the provisioning saga, and
//! the pieces it coordinates:
//!
//! - **[`SagaCoordinator`]** -- runs a purchase end to end: ledger
//!   entry, device user, payment capture, policy classification,
//!   optional session bind, with compensation on terminal failures.
//! - **[`LedgerStore`]** / **[`LedgerEntry`]** -- in-memory sale
//!   ledger; one async lock per entry.
//! - **[`PaymentGateway`]** -- object-safe gateway trait with Conekta
//!   and Mercado Pago integrations and per-gateway settlement
//!   policies.
//! - **[`Reconciler`]** -- settles pending payments from webhook
//!   notifications by re-querying the gateway; idempotent and
//!   duplicate-safe.
//! - **[`device`]** -- firmware detection, hotspot user management,
//!   and the legacy/modern session binders.

pub mod device;
pub mod error;
pub mod model;
pub mod payment;
pub mod reconcile;
pub mod saga;
pub mod store;

// ── Primary re-exports ───────────────────────────────────────────────

pub use error::CoreError;
pub use model::{AccessCredential, CredentialKind, LedgerEntry, MacAddress, PaymentState};
pub use saga::{AutoBindRequest, ProductPolicy, ProvisioningOutcome, SagaCoordinator};
pub use store::{EntrySlot, LedgerStore};

// ── Device operations ────────────────────────────────────────────────

pub use device::binder::{
    ActiveSessionInfo, BindFailure, BindRequest, BindResult, BindTiming, BinderConfig,
    BinderStrategy, ModernLoginMode, bind_auto,
};
pub use device::detect::{FirmwareGeneration, detect_generation, detect_major};
pub use device::users::{
    CreateOptions, CreateOutcome, DeleteOutcome, UserManagerConfig, create_user, delete_user,
};

// ── Payments & settlement ────────────────────────────────────────────

pub use payment::conekta::ConektaGateway;
pub use payment::mercado_pago::MercadoPagoGateway;
pub use payment::{
    CaptureOutcome, CaptureRequest, CustomerInfo, GatewayStatus, PaymentGateway,
    PaymentInstrument, PendingHandling, SettlementPolicy, StatusSnapshot,
};
pub use reconcile::{
    Notification, ReconcileAction, Reconciler, SignaturePolicy, is_settlement_event,
    verify_signature,
};

// The transport endpoint type is part of this crate's public surface;
// config and the binary reach the device layer through it.
pub use gatepass_routeros::{ChannelConfig, DeviceEndpoint};
