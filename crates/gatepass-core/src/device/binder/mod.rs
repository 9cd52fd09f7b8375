//! Session binding.
//!
//! Creating a user sells access; binding starts it. A bind locates the
//! buyer's device on the hotspot network, pushes a login through the
//! captive portal on their behalf, and then watches the active table
//! until the session materializes (or doesn't).
//!
//! Two strategies cover the firmware split:
//!
//! - [`BinderStrategy::Legacy`]: pre-7 portals. MAC pinned onto the
//!   user record, cookie reconciliation, up to four login
//!   parameterizations, two long verification windows.
//! - [`BinderStrategy::Modern`]: 7+ portals. Stale-session pre-clear,
//!   IP resolution from the host table, direct or scripted login,
//!   sub-second polling.

mod legacy;
mod modern;

use std::time::Duration;

use gatepass_routeros::{ActiveRow, ChannelConfig, DeviceEndpoint};
use serde::Serialize;

use crate::device::detect::{FirmwareGeneration, detect_generation};
use crate::error::CoreError;
use crate::model::{AccessCredential, MacAddress};

/// What the caller wants bound.
#[derive(Debug, Clone)]
pub struct BindRequest {
    pub credential: AccessCredential,
    pub mac: MacAddress,
    /// Client IP when the portal already knows it; otherwise resolved
    /// from the device's host table.
    pub ip: Option<String>,
}

/// Business-level bind failures. Infrastructure failures (device
/// unreachable, channel gave up) stay `CoreError`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindFailure {
    /// No device user matches the credential identifier.
    UserNotFound,
    /// No host-table entry for the MAC: the client is not attached to
    /// the hotspot network, and no login may be attempted.
    ClientNotOnNetwork,
    /// Every login parameterization was refused.
    LoginRejected,
    /// The device dropped out mid-bind; payment and user stay put.
    DeviceUnavailable,
}

/// Session details as observed in the active table.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveSessionInfo {
    pub id: Option<String>,
    pub user: String,
    pub address: Option<String>,
    pub mac_address: Option<String>,
    pub uptime: Option<String>,
    pub server: Option<String>,
}

impl ActiveSessionInfo {
    fn from_active(row: &ActiveRow) -> Self {
        Self {
            id: row.id.clone(),
            user: row.user.clone(),
            address: row.address.clone(),
            mac_address: row.mac_address.clone(),
            uptime: row.uptime.clone(),
            server: row.server.clone(),
        }
    }
}

/// Outcome of one bind attempt.
///
/// `success` means a login command was accepted (or the portal said
/// the session already exists); `authenticated` means the session was
/// then observed in the active table. Accepted-but-unobserved is soft:
/// reported, never fatal.
#[derive(Debug, Clone, Serialize)]
pub struct BindResult {
    pub success: bool,
    pub authenticated: bool,
    pub session: Option<ActiveSessionInfo>,
    /// Which login parameterization landed.
    pub method: Option<String>,
    pub failure: Option<BindFailure>,
}

impl BindResult {
    fn failed(failure: BindFailure) -> Self {
        Self {
            success: false,
            authenticated: false,
            session: None,
            method: None,
            failure: Some(failure),
        }
    }

    fn logged_in(method: String, session: Option<ActiveSessionInfo>) -> Self {
        Self {
            success: true,
            authenticated: session.is_some(),
            session,
            method: Some(method),
            failure: None,
        }
    }
}

/// Timing knobs; defaults mirror observed appliance settle behavior.
#[derive(Debug, Clone)]
pub struct BindTiming {
    /// Legacy: wait before the first active-table check.
    pub verify_after: Duration,
    /// Legacy: wait before the second (last) check.
    pub verify_retry_after: Duration,
    /// Modern: interval between active-table polls.
    pub poll_interval: Duration,
    /// Modern: number of polls (12 x 500ms ~= a 6 second window).
    pub poll_attempts: u32,
    /// Modern, script mode: wait after running the login script.
    pub script_settle: Duration,
}

impl Default for BindTiming {
    fn default() -> Self {
        Self {
            verify_after: Duration::from_millis(2500),
            verify_retry_after: Duration::from_millis(3000),
            poll_interval: Duration::from_millis(500),
            poll_attempts: 12,
            script_settle: Duration::from_secs(3),
        }
    }
}

/// How the modern strategy pushes the login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModernLoginMode {
    /// Direct `/ip/hotspot/active/login` invocations.
    #[default]
    Direct,
    /// Upload-run-delete script. Survives portal builds that silently
    /// eat direct logins.
    Script,
}

#[derive(Debug, Clone, Default)]
pub struct BinderConfig {
    pub channel: ChannelConfig,
    pub timing: BindTiming,
    pub modern_login: ModernLoginMode,
}

/// Strategy selector. Callers depend on [`BinderStrategy::bind`] and
/// never on generation specifics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinderStrategy {
    Legacy,
    Modern,
}

impl BinderStrategy {
    pub fn for_generation(generation: FirmwareGeneration) -> Self {
        match generation {
            FirmwareGeneration::Legacy => Self::Legacy,
            FirmwareGeneration::Modern => Self::Modern,
        }
    }

    pub async fn bind(
        self,
        endpoint: &DeviceEndpoint,
        request: &BindRequest,
        config: &BinderConfig,
    ) -> Result<BindResult, CoreError> {
        match self {
            Self::Legacy => legacy::bind(endpoint, request, config).await,
            Self::Modern => modern::bind(endpoint, request, config).await,
        }
    }
}

/// Probe the firmware generation and dispatch to the right strategy.
pub async fn bind_auto(
    endpoint: &DeviceEndpoint,
    request: &BindRequest,
    config: &BinderConfig,
) -> Result<BindResult, CoreError> {
    let generation = detect_generation(endpoint).await;
    let strategy = BinderStrategy::for_generation(generation);
    tracing::debug!(?strategy, mac = %request.mac, "dispatching session bind");
    strategy.bind(endpoint, request, config).await
}

/// Portals throw a trap instead of succeeding when the session already
/// exists; for binding purposes that trap IS success. The loose form
/// additionally accepts any "already ..." phrasing and is reserved for
/// the last legacy parameterization.
pub(crate) fn trap_means_already_logged_in(message: &str, loose: bool) -> bool {
    let lowered = message.to_lowercase();
    if lowered.contains("already logged in") || lowered.contains("already authorized") {
        return true;
    }
    loose && lowered.contains("already")
}
