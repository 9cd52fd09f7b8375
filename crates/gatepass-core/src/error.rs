//! Domain error taxonomy.
//!
//! Three broad classes flow out of this crate:
//!
//! - precondition failures ([`CoreError::Validation`],
//!   [`CoreError::ProfileNotFound`], [`CoreError::DuplicateUser`]):
//!   the request can never succeed as stated
//! - payment outcomes ([`CoreError::PaymentRejected`]): the gateway
//!   said no, terminally
//! - infrastructure ([`CoreError::Connection`], [`CoreError::Gateway`],
//!   [`CoreError::Device`]): something between us and the money or the
//!   appliance broke
//!
//! The HTTP layer maps each class to a status; the saga maps them to
//! compensation decisions.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    // ── Preconditions ────────────────────────────────────────────────
    /// Caller-supplied data is structurally wrong.
    #[error("validation failed for {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// The requested hotspot profile does not exist on the appliance.
    #[error("profile '{requested}' not found on device (available: {})", .available.join(", "))]
    ProfileNotFound {
        requested: String,
        /// A few known profile names, so the operator can spot typos.
        available: Vec<String>,
    },

    /// A device user with this identifier already exists.
    #[error("user '{identifier}' already exists on device")]
    DuplicateUser { identifier: String },

    // ── Payment outcomes ─────────────────────────────────────────────
    /// The gateway terminally refused the payment.
    #[error("payment rejected ({status}): {reason}")]
    PaymentRejected { status: String, reason: String },

    // ── Infrastructure ───────────────────────────────────────────────
    /// Device unreachable, or the control channel gave up recovering.
    #[error("device connection failed: {reason}")]
    Connection { reason: String },

    /// Gateway transport or contract failure: timeouts, 5xx responses,
    /// unparseable bodies.
    #[error("payment gateway error: {message}")]
    Gateway { message: String },

    /// A device command failed in a way the domain layer cannot
    /// reinterpret.
    #[error("device command failed: {0}")]
    Device(gatepass_routeros::Error),

    // ── Lookups ──────────────────────────────────────────────────────
    /// No ledger entry under the given reference or payment id.
    #[error("no ledger entry for {reference}")]
    LedgerEntryNotFound { reference: String },
}

impl CoreError {
    /// Failures the caller caused; retrying the same request cannot
    /// succeed.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::ProfileNotFound { .. } | Self::DuplicateUser { .. }
        )
    }

    /// Transport and dependency failures, safe to retry later.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Gateway { .. } | Self::Device(_)
        )
    }
}

impl From<gatepass_routeros::Error> for CoreError {
    fn from(err: gatepass_routeros::Error) -> Self {
        if is_connection_class(&err) {
            return Self::Connection {
                reason: err.to_string(),
            };
        }
        Self::Device(err)
    }
}

/// Channel errors that mean "could not talk to the device at all", as
/// opposed to the device rejecting what we said.
fn is_connection_class(err: &gatepass_routeros::Error) -> bool {
    type Ros = gatepass_routeros::Error;
    matches!(
        err,
        Ros::MissingField { .. }
            | Ros::ConnectTimeout { .. }
            | Ros::Io(_)
            | Ros::Tls(_)
            | Ros::AuthenticationFailed { .. }
            | Ros::Closed
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn channel_errors_split_into_connection_and_device() {
        let timeout = gatepass_routeros::Error::ConnectTimeout {
            host: "10.0.0.1".to_owned(),
            port: 8728,
            timeout_secs: 10,
        };
        assert!(matches!(
            CoreError::from(timeout),
            CoreError::Connection { .. }
        ));

        let trap = gatepass_routeros::Error::Trap {
            message: "no such item".to_owned(),
            category: None,
        };
        assert!(matches!(CoreError::from(trap), CoreError::Device(_)));
    }

    #[test]
    fn profile_not_found_lists_alternatives() {
        let err = CoreError::ProfileNotFound {
            requested: "2_Hours".to_owned(),
            available: vec!["1_Day".to_owned(), "1_Week".to_owned()],
        };
        let text = err.to_string();
        assert!(text.contains("2_Hours"));
        assert!(text.contains("1_Day, 1_Week"));
        assert!(err.is_precondition());
        assert!(!err.is_infrastructure());
    }
}
