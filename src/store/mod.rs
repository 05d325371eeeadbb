//! Typed persistence contract for users, per-family key material, the
//! address pool, invoices, and each coin's sync cursor.
//!
//! The query surface is deliberately narrow and typed rather than a generic
//! `execute(sql)` escape hatch. This core ships one concrete implementation
//! ([`memory::MemoryStore`]): a single [`tokio::sync::Mutex`] guarding every
//! table, called directly by each method, so "atomic per call" holds without
//! a real transaction manager.

pub mod memory;

use thiserror::Error;

use crate::types::{
    ChainFamily, CryptoAddress, CryptoCache, CoinType, HdKeyRecord, Invoice, InvoiceId,
    InvoiceStatus, UserId, ViewKeyRecord,
};

/// Typed persistence contract the rest of this core is written against.
///
/// Every method is atomic for its own call; flows that need several calls to
/// agree (e.g. "lock the key record, read its indices, bump them") say so in
/// their doc comment.
pub trait InvoiceStore: Send + Sync {
    /// Registers a new user. Returns the user's id, newly-generated if `id`
    /// is `None`.
    fn create_user(
        &self,
        id: Option<UserId>,
    ) -> impl std::future::Future<Output = Result<UserId, StoreError>> + Send;

    /// Whether `id` has been registered.
    fn user_exists(&self, id: UserId) -> impl std::future::Future<Output = Result<bool, StoreError>> + Send;

    /// Replaces (or inserts) the stored Monero view key for `user_id`.
    fn upsert_view_key(
        &self,
        user_id: UserId,
        priv_view_key: String,
        pub_spend_key: String,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Replaces (or inserts) the stored BIP32 extended public key for
    /// `user_id` on `chain`.
    fn upsert_hd_key(
        &self,
        user_id: UserId,
        chain: ChainFamily,
        master_pub_key: String,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Locks `user_id`'s view key row, returns its current state together
    /// with the next `(major, minor)` pair, and persists the bumped indices
    /// before returning — the "read cursor, bump cursor" step happens
    /// atomically so two concurrent callers never receive the same index.
    fn lock_view_key_and_next_index(
        &self,
        user_id: UserId,
    ) -> impl std::future::Future<Output = Result<(ViewKeyRecord, i32, i32), StoreError>> + Send;

    /// Same as [`InvoiceStore::lock_view_key_and_next_index`] for the BIP32
    /// chain families.
    fn lock_hd_key_and_next_index(
        &self,
        user_id: UserId,
        chain: ChainFamily,
    ) -> impl std::future::Future<Output = Result<(HdKeyRecord, i32, i32), StoreError>> + Send;

    /// Reads a user's stored Monero view key, without locking or bumping its
    /// derivation cursor.
    fn find_view_key(
        &self,
        user_id: UserId,
    ) -> impl std::future::Future<Output = Result<Option<ViewKeyRecord>, StoreError>> + Send;

    /// Inserts a new address row. Fails if `address` already exists.
    fn create_crypto_address(
        &self,
        address: CryptoAddress,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Reads an address row by its address string.
    fn find_crypto_address(
        &self,
        address: &str,
    ) -> impl std::future::Future<Output = Result<Option<CryptoAddress>, StoreError>> + Send;

    /// Finds an unoccupied address of `coin` owned by `user_id` and marks it
    /// occupied in the same call, so two concurrent callers never receive the
    /// same address.
    fn find_non_occupied_crypto_address_and_lock(
        &self,
        user_id: UserId,
        coin: CoinType,
    ) -> impl std::future::Future<Output = Result<Option<CryptoAddress>, StoreError>> + Send;

    /// Sets an address's occupancy flag.
    fn update_is_occupied(
        &self,
        address: &str,
        is_occupied: bool,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Inserts a new invoice row.
    fn create_invoice(
        &self,
        invoice: Invoice,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Reads an invoice's current snapshot.
    fn find_invoice(
        &self,
        id: InvoiceId,
    ) -> impl std::future::Future<Output = Result<Option<Invoice>, StoreError>> + Send;

    /// Transitions `PENDING -> PENDING_MEMPOOL`, recording `actual_amount`
    /// and `tx_id`. A no-op (returns `None`) if the invoice is not currently
    /// `PENDING`.
    fn confirm_invoice_mempool(
        &self,
        id: InvoiceId,
        actual_amount: f64,
        tx_id: String,
    ) -> impl std::future::Future<Output = Result<Option<Invoice>, StoreError>> + Send;

    /// Transitions `PENDING_MEMPOOL -> CONFIRMED`. A no-op (returns `None`)
    /// if the invoice is not currently `PENDING_MEMPOOL`.
    fn confirm_invoice(
        &self,
        id: InvoiceId,
        confirmed_at: chrono::DateTime<chrono::Utc>,
    ) -> impl std::future::Future<Output = Result<Option<Invoice>, StoreError>> + Send;

    /// Transitions a non-terminal invoice to `EXPIRED`. A no-op (returns
    /// `None`) if the invoice is already terminal.
    fn expire_invoice(
        &self,
        id: InvoiceId,
    ) -> impl std::future::Future<Output = Result<Option<Invoice>, StoreError>> + Send;

    /// Reads `coin`'s sync cursor.
    fn find_crypto_cache(
        &self,
        coin: CoinType,
    ) -> impl std::future::Future<Output = Result<Option<CryptoCache>, StoreError>> + Send;

    /// Writes `coin`'s sync cursor.
    fn update_crypto_cache(
        &self,
        coin: CoinType,
        height: u64,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Pushes every non-confirmed invoice's `expires_at` forward by the
    /// engine's downtime (so a restart does not expire invoices that were
    /// merely waiting on a process that was down) and returns the full set,
    /// for the caller to re-enroll into its `CoinProcessor.pending` maps.
    fn shift_expires_at_for_non_confirmed_invoices(
        &self,
        shift: chrono::Duration,
    ) -> impl std::future::Future<Output = Result<Vec<Invoice>, StoreError>> + Send;
}

/// Failure talking to the invoice store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A uniqueness invariant was violated (duplicate address, duplicate
    /// user id).
    #[error("conflict: {0}")]
    Conflict(String),
    /// The caller asked for a state transition the current row does not
    /// admit (e.g. confirming an already-terminal invoice).
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
}

pub(crate) fn invoice_matches_status(invoice: &Invoice, expected: InvoiceStatus) -> bool {
    invoice.status == expected
}
