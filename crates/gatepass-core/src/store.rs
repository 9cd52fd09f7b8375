//! In-memory provisioning ledger.
//!
//! Entries are keyed by our external reference; each sits behind its
//! own async mutex so the saga and the reconciler serialize per entry
//! without a global lock. A secondary index resolves the gateway's
//! payment id back to a reference once capture has assigned one.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::model::LedgerEntry;

/// Shared handle to one ledger entry.
pub type EntrySlot = Arc<Mutex<LedgerEntry>>;

#[derive(Default)]
pub struct LedgerStore {
    entries: DashMap<String, EntrySlot>,
    payment_index: DashMap<String, String>,
}

impl LedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh entry keyed by its external reference.
    pub fn create(&self, entry: LedgerEntry) -> EntrySlot {
        let reference = entry.external_reference.clone();
        let slot = Arc::new(Mutex::new(entry));
        self.entries.insert(reference, Arc::clone(&slot));
        slot
    }

    pub fn by_reference(&self, reference: &str) -> Option<EntrySlot> {
        self.entries.get(reference).map(|e| Arc::clone(e.value()))
    }

    pub fn by_payment_id(&self, payment_id: &str) -> Option<EntrySlot> {
        let reference = self.payment_index.get(payment_id)?.value().clone();
        self.by_reference(&reference)
    }

    /// Register the gateway's payment id for an existing entry. Empty
    /// ids (captures that failed before the gateway assigned one) are
    /// ignored.
    pub fn index_payment_id(&self, payment_id: &str, reference: &str) {
        if payment_id.is_empty() {
            return;
        }
        self.payment_index
            .insert(payment_id.to_owned(), reference.to_owned());
    }

    /// Resolve a notification to its entry: our reference wins, the
    /// gateway payment id is the fallback.
    pub fn resolve(&self, reference: Option<&str>, payment_id: Option<&str>) -> Option<EntrySlot> {
        if let Some(reference) = reference {
            if let Some(slot) = self.by_reference(reference) {
                return Some(slot);
            }
        }
        payment_id.and_then(|id| self.by_payment_id(id))
    }

    /// Snapshot of every entry slot, in no particular order.
    pub fn entries(&self) -> Vec<EntrySlot> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{AccessCredential, CredentialKind, PaymentState};

    fn entry(reference: &str) -> LedgerEntry {
        LedgerEntry::new(
            reference.to_owned(),
            99.0,
            "MXN",
            AccessCredential::generate(CredentialKind::PinOnly),
        )
    }

    #[test]
    fn resolves_by_reference_then_payment_id() {
        tokio_test::block_on(async {
            let store = LedgerStore::new();
            let slot = store.create(entry("ref-1"));
            store.index_payment_id("pay-9", "ref-1");

            {
                let mut locked = slot.lock().await;
                locked.external_payment_id = "pay-9".to_owned();
            }

            let by_ref = store.resolve(Some("ref-1"), None).unwrap();
            assert_eq!(by_ref.lock().await.external_reference, "ref-1");

            let by_payment = store.resolve(None, Some("pay-9")).unwrap();
            assert_eq!(by_payment.lock().await.external_reference, "ref-1");

            assert!(store.resolve(Some("missing"), Some("also-missing")).is_none());
        });
    }

    #[test]
    fn slots_share_state() {
        tokio_test::block_on(async {
            let store = LedgerStore::new();
            let created = store.create(entry("ref-2"));
            created
                .lock()
                .await
                .apply_settlement(PaymentState::Approved, chrono::Utc::now());

            let fetched = store.by_reference("ref-2").unwrap();
            assert_eq!(fetched.lock().await.payment_state, PaymentState::Approved);
            assert_eq!(store.len(), 1);
            assert!(!store.is_empty());
        });
    }

    #[test]
    fn empty_payment_ids_are_never_indexed() {
        let store = LedgerStore::new();
        store.create(entry("ref-3"));
        store.index_payment_id("", "ref-3");
        assert!(store.by_payment_id("").is_none());
    }
}
