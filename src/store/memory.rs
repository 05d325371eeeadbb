//! In-process [`InvoiceStore`] implementation: one [`tokio::sync::Mutex`]
//! guarding a set of `BTreeMap` tables — the one concrete backend this core
//! ships, while the trait itself is the seam a real deployment would put a
//! SQL store behind.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::{InvoiceStore, StoreError};
use crate::types::{
    ChainFamily, CryptoAddress, CryptoCache, CoinType, HdKeyRecord, Invoice, InvoiceId,
    InvoiceStatus, UserId, ViewKeyRecord, increment_indices,
};

#[derive(Default)]
struct Db {
    users: BTreeMap<Uuid, ()>,
    view_keys: BTreeMap<Uuid, ViewKeyRecord>,
    hd_keys: BTreeMap<(Uuid, u8), HdKeyRecord>,
    addresses: BTreeMap<String, CryptoAddress>,
    invoices: BTreeMap<Uuid, Invoice>,
    caches: BTreeMap<CoinType, CryptoCache>,
}

fn chain_tag(chain: ChainFamily) -> u8 {
    match chain {
        ChainFamily::Monero => 0,
        ChainFamily::Bitcoin => 1,
        ChainFamily::Litecoin => 2,
        ChainFamily::Ethereum => 3,
        ChainFamily::Bnb => 4,
        ChainFamily::Unsupported => 255,
    }
}

/// `BTreeMap`-backed [`InvoiceStore`], guarded by a single mutex.
///
/// A single mutex makes "atomic per call" trivial to argue rather than
/// requiring per-row lock bookkeeping, at the cost of serializing unrelated
/// callers. That tradeoff is recorded in `DESIGN.md`.
#[derive(Default)]
pub struct MemoryStore {
    db: tokio::sync::Mutex<Db>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }
}

impl InvoiceStore for MemoryStore {
    async fn create_user(&self, id: Option<UserId>) -> Result<UserId, StoreError> {
        let mut db = self.db.lock().await;
        let id = id.map_or_else(|| UserId(Uuid::new_v4()), |id| id);
        if db.users.contains_key(&id.0) {
            return Err(StoreError::Conflict(format!("user {id} already exists")));
        }
        db.users.insert(id.0, ());
        Ok(id)
    }

    async fn user_exists(&self, id: UserId) -> Result<bool, StoreError> {
        Ok(self.db.lock().await.users.contains_key(&id.0))
    }

    async fn upsert_view_key(
        &self,
        user_id: UserId,
        priv_view_key: String,
        pub_spend_key: String,
    ) -> Result<(), StoreError> {
        let mut db = self.db.lock().await;
        db.view_keys.insert(
            user_id.0,
            ViewKeyRecord {
                id: user_id.0,
                priv_view_key,
                pub_spend_key,
                last_major_index: 0,
                last_minor_index: -1,
            },
        );
        Ok(())
    }

    async fn upsert_hd_key(
        &self,
        user_id: UserId,
        chain: ChainFamily,
        master_pub_key: String,
    ) -> Result<(), StoreError> {
        let mut db = self.db.lock().await;
        db.hd_keys.insert(
            (user_id.0, chain_tag(chain)),
            HdKeyRecord { id: user_id.0, master_pub_key, last_major_index: 0, last_minor_index: -1 },
        );
        Ok(())
    }

    async fn lock_view_key_and_next_index(
        &self,
        user_id: UserId,
    ) -> Result<(ViewKeyRecord, i32, i32), StoreError> {
        let mut db = self.db.lock().await;
        let record = db
            .view_keys
            .get_mut(&user_id.0)
            .ok_or_else(|| StoreError::NotFound(format!("no view key for user {user_id}")))?;
        let (major, minor) = increment_indices(record.last_major_index, record.last_minor_index);
        record.last_major_index = major;
        record.last_minor_index = minor;
        Ok((record.clone(), major, minor))
    }

    async fn lock_hd_key_and_next_index(
        &self,
        user_id: UserId,
        chain: ChainFamily,
    ) -> Result<(HdKeyRecord, i32, i32), StoreError> {
        let mut db = self.db.lock().await;
        let record = db
            .hd_keys
            .get_mut(&(user_id.0, chain_tag(chain)))
            .ok_or_else(|| StoreError::NotFound(format!("no hd key for user {user_id} on {chain:?}")))?;
        let (major, minor) = increment_indices(record.last_major_index, record.last_minor_index);
        record.last_major_index = major;
        record.last_minor_index = minor;
        Ok((record.clone(), major, minor))
    }

    async fn find_view_key(&self, user_id: UserId) -> Result<Option<ViewKeyRecord>, StoreError> {
        Ok(self.db.lock().await.view_keys.get(&user_id.0).cloned())
    }

    async fn create_crypto_address(&self, address: CryptoAddress) -> Result<(), StoreError> {
        let mut db = self.db.lock().await;
        if db.addresses.contains_key(&address.address) {
            return Err(StoreError::Conflict(format!("address {} already exists", address.address)));
        }
        db.addresses.insert(address.address.clone(), address);
        Ok(())
    }

    async fn find_crypto_address(&self, address: &str) -> Result<Option<CryptoAddress>, StoreError> {
        Ok(self.db.lock().await.addresses.get(address).cloned())
    }

    async fn find_non_occupied_crypto_address_and_lock(
        &self,
        user_id: UserId,
        coin: CoinType,
    ) -> Result<Option<CryptoAddress>, StoreError> {
        let mut db = self.db.lock().await;
        let found = db
            .addresses
            .values()
            .find(|a| a.user_id == user_id && a.coin == coin && !a.is_occupied)
            .cloned();
        if let Some(address) = &found {
            db.addresses.get_mut(&address.address).expect("just found").is_occupied = true;
        }
        Ok(found)
    }

    async fn update_is_occupied(&self, address: &str, is_occupied: bool) -> Result<(), StoreError> {
        let mut db = self.db.lock().await;
        let row = db
            .addresses
            .get_mut(address)
            .ok_or_else(|| StoreError::NotFound(format!("no address {address}")))?;
        row.is_occupied = is_occupied;
        Ok(())
    }

    async fn create_invoice(&self, invoice: Invoice) -> Result<(), StoreError> {
        let mut db = self.db.lock().await;
        if db.invoices.contains_key(&invoice.id.0) {
            return Err(StoreError::Conflict(format!("invoice {} already exists", invoice.id)));
        }
        db.invoices.insert(invoice.id.0, invoice);
        Ok(())
    }

    async fn find_invoice(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        Ok(self.db.lock().await.invoices.get(&id.0).cloned())
    }

    async fn confirm_invoice_mempool(
        &self,
        id: InvoiceId,
        actual_amount: f64,
        tx_id: String,
    ) -> Result<Option<Invoice>, StoreError> {
        let mut db = self.db.lock().await;
        let Some(invoice) = db.invoices.get_mut(&id.0) else {
            return Err(StoreError::NotFound(format!("no invoice {id}")));
        };
        if invoice.status != InvoiceStatus::Pending {
            return Ok(None);
        }
        invoice.status = InvoiceStatus::PendingMempool;
        invoice.actual_amount = Some(actual_amount);
        invoice.tx_id = Some(tx_id);
        Ok(Some(invoice.clone()))
    }

    async fn confirm_invoice(
        &self,
        id: InvoiceId,
        confirmed_at: DateTime<Utc>,
    ) -> Result<Option<Invoice>, StoreError> {
        let mut db = self.db.lock().await;
        let Some(invoice) = db.invoices.get_mut(&id.0) else {
            return Err(StoreError::NotFound(format!("no invoice {id}")));
        };
        if invoice.status != InvoiceStatus::PendingMempool {
            return Ok(None);
        }
        invoice.status = InvoiceStatus::Confirmed;
        invoice.confirmed_at = Some(confirmed_at);
        Ok(Some(invoice.clone()))
    }

    async fn expire_invoice(&self, id: InvoiceId) -> Result<Option<Invoice>, StoreError> {
        let mut db = self.db.lock().await;
        let Some(invoice) = db.invoices.get_mut(&id.0) else {
            return Err(StoreError::NotFound(format!("no invoice {id}")));
        };
        if invoice.status.is_terminal() {
            return Ok(None);
        }
        invoice.status = InvoiceStatus::Expired;
        Ok(Some(invoice.clone()))
    }

    async fn find_crypto_cache(&self, coin: CoinType) -> Result<Option<CryptoCache>, StoreError> {
        Ok(self.db.lock().await.caches.get(&coin).copied())
    }

    async fn update_crypto_cache(&self, coin: CoinType, height: u64) -> Result<(), StoreError> {
        let mut db = self.db.lock().await;
        db.caches.insert(coin, CryptoCache { coin, last_synced_block_height: Some(height) });
        Ok(())
    }

    async fn shift_expires_at_for_non_confirmed_invoices(
        &self,
        shift: Duration,
    ) -> Result<Vec<Invoice>, StoreError> {
        let mut db = self.db.lock().await;
        let mut shifted = Vec::new();
        for invoice in db.invoices.values_mut() {
            if invoice.status.is_terminal() {
                continue;
            }
            invoice.expires_at += shift;
            shifted.push(invoice.clone());
        }
        Ok(shifted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserId {
        UserId(Uuid::new_v4())
    }

    #[tokio::test]
    async fn address_lock_hands_out_each_address_once() {
        let store = MemoryStore::new();
        let user_id = store.create_user(None).await.unwrap();
        store
            .create_crypto_address(CryptoAddress {
                address: "addr1".to_string(),
                coin: CoinType::BTC,
                user_id,
                is_occupied: false,
                major: 0,
                minor: 0,
            })
            .await
            .unwrap();

        let first = store
            .find_non_occupied_crypto_address_and_lock(user_id, CoinType::BTC)
            .await
            .unwrap();
        assert!(first.is_some());
        let second = store
            .find_non_occupied_crypto_address_and_lock(user_id, CoinType::BTC)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn invoice_transitions_are_guarded_by_current_status() {
        let store = MemoryStore::new();
        let user_id = user();
        let invoice = Invoice {
            id: InvoiceId(Uuid::new_v4()),
            user_id,
            coin: CoinType::BTC,
            crypto_address: "addr1".to_string(),
            required_amount: 0.01,
            actual_amount: None,
            confirmations_required: 1,
            status: InvoiceStatus::Pending,
            created_at: Utc::now(),
            expires_at: Utc::now(),
            confirmed_at: None,
            tx_id: None,
        };
        store.create_invoice(invoice.clone()).await.unwrap();

        // Confirming before a mempool sighting is a no-op.
        assert!(store.confirm_invoice(invoice.id, Utc::now()).await.unwrap().is_none());

        let mempool = store.confirm_invoice_mempool(invoice.id, 0.01, "tx1".to_string()).await.unwrap();
        assert_eq!(mempool.unwrap().status, InvoiceStatus::PendingMempool);

        let confirmed = store.confirm_invoice(invoice.id, Utc::now()).await.unwrap();
        assert_eq!(confirmed.unwrap().status, InvoiceStatus::Confirmed);

        // Terminal; further transitions are no-ops.
        assert!(store.expire_invoice(invoice.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn key_index_locking_never_repeats_an_index() {
        let store = MemoryStore::new();
        let user_id = store.create_user(None).await.unwrap();
        store.upsert_view_key(user_id, "v".to_string(), "s".to_string()).await.unwrap();

        let (_, major1, minor1) = store.lock_view_key_and_next_index(user_id).await.unwrap();
        let (_, major2, minor2) = store.lock_view_key_and_next_index(user_id).await.unwrap();
        assert_ne!((major1, minor1), (major2, minor2));
    }
}
