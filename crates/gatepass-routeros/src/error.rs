use thiserror::Error;

/// Top-level error type for the `gatepass-routeros` crate.
///
/// Covers every failure mode of the control channel: endpoint
/// validation, socket transport, TLS, the login handshake, and
/// protocol-level replies. `gatepass-core` maps these into its own
/// domain taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Endpoint validation ──────────────────────────────────────────
    /// A connection parameter is missing or empty. No I/O was attempted.
    #[error("missing connection parameter: {field}")]
    MissingField { field: &'static str },

    // ── Transport ───────────────────────────────────────────────────
    /// TCP connect (or TLS handshake) did not finish inside the window.
    #[error("connect to {host}:{port} timed out after {timeout_secs}s")]
    ConnectTimeout {
        host: String,
        port: u16,
        timeout_secs: u64,
    },

    /// Socket-level I/O error (refused, reset, broken pipe, ...).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS setup or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Login ───────────────────────────────────────────────────────
    /// The appliance rejected the API credentials.
    #[error("authentication failed: {message}")]
    AuthenticationFailed { message: String },

    // ── Protocol ────────────────────────────────────────────────────
    /// `!trap` reply: the command failed on the appliance but the
    /// connection survives.
    #[error("command trap: {message}")]
    Trap {
        message: String,
        category: Option<String>,
    },

    /// `!fatal` reply: the appliance is closing the connection.
    #[error("fatal reply: {message}")]
    Fatal { message: String },

    /// Malformed frame or reply word.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The channel was used after `close()` or a fatal reply.
    #[error("channel is closed")]
    Closed,
}

impl Error {
    /// Transport-class failures trigger the channel's close-and-reopen
    /// recovery; everything else propagates unchanged.
    ///
    /// Traps count as transport-class here: hotspot appliances throw
    /// them for stale sessions, and a fresh connection clears those.
    pub fn is_transport_class(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. }
                | Self::Io(_)
                | Self::Trap { .. }
                | Self::Fatal { .. }
                | Self::Closed
        )
    }

    /// The `!trap` message, if this is a trap.
    pub fn trap_message(&self) -> Option<&str> {
        match self {
            Self::Trap { message, .. } => Some(message),
            _ => None,
        }
    }
}
