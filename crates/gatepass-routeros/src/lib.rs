//! Async client for the RouterOS binary API.
//!
//! The appliance-facing half of gatepass: everything that touches a
//! hotspot device goes through a [`Channel`].
//!
//! - **[`DeviceEndpoint`]** -- where and how to reach one appliance;
//!   the port alone decides TLS (8729).
//! - **[`Channel`]** -- one authenticated connection: open, execute,
//!   close. Transport-class failures recover through a bounded
//!   close-and-reopen cycle with linear backoff.
//! - **[`Command`]** -- sentence builder (`=attr=value`, `?query=value`).
//! - **[`rows`]** -- typed views over reply rows, one per command family.
//! - **[`Error`]** -- transport and protocol taxonomy;
//!   [`Error::is_transport_class`] drives recovery.
//!
//! Channels are opened per operation sequence and never pooled: open,
//! run the commands, close (or drop).

pub mod channel;
pub mod command;
pub mod error;
pub mod proto;
pub mod rows;

#[cfg(feature = "test-support")]
pub mod testing;

// ── Primary re-exports ───────────────────────────────────────────────

// Channel and endpoint
pub use channel::{API_PORT, API_TLS_PORT, Channel, ChannelConfig, DeviceEndpoint};

// Commands and errors
pub use command::Command;
pub use error::Error;

// Typed rows
pub use rows::{ActiveRow, CookieRow, HostRow, ProfileRow, ResourceRow, Row, ScriptRow, UserRow};
