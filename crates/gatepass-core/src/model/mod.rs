//! Canonical domain model shared by the saga, the device layer, and
//! the HTTP surface.

pub mod credential;
pub mod ledger;
pub mod mac;

pub use credential::{AccessCredential, CredentialKind};
pub use ledger::{LedgerEntry, PaymentState};
pub use mac::MacAddress;
