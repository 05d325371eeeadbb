//! `CoinProcessor`: the invoice state machine for one coin. Drives address
//! assignment, watches a [`ChainWatcher`] for blocks/mempool transactions,
//! verifies them against every pending invoice, and advances each invoice
//! through `PENDING -> PENDING_MEMPOOL -> {CONFIRMED, EXPIRED}`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};

use crate::daemon::{DaemonClient, DaemonError, Tx as TxTrait};
use crate::derive::{AddressDeriver, DeriveError};
use crate::store::{InvoiceStore, StoreError};
use crate::types::{
    ChainFamily, CoinType, CryptoAddress, HdKeyRecord, Invoice, InvoiceId, InvoiceStatus,
    NetworkType, UserId, ViewKeyRecord,
};
use crate::verify::{TxVerifier, VerifyError};
use crate::watcher::ChainWatcher;
use crate::pubsub::Publisher;

/// Minimum invoice lifespan, regardless of a caller's requested timeout.
pub const MIN_SYNC_TIMEOUT: Duration = Duration::from_secs(10);
/// How often `(coin, last_synced_block_height)` is persisted to the store.
pub const CACHE_PERSIST_INTERVAL: Duration = Duration::from_secs(60);

/// A caller's request to open a new invoice.
#[derive(Debug, Clone)]
pub struct NewInvoiceRequest {
    /// Owning user.
    pub user_id: UserId,
    /// Requested coin.
    pub coin: CoinType,
    /// Amount required, in the coin's display unit.
    pub amount: f64,
    /// Requested lifespan; clamped to at least [`MIN_SYNC_TIMEOUT`].
    pub timeout: Duration,
    /// Confirmations required before the invoice is considered paid.
    pub confirmations: u32,
}

/// Produces a deposit address for a user, pairing an [`AddressDeriver`] with
/// whichever store call locks that chain family's key record and bumps its
/// derivation cursor.
pub trait AddressFactory<S: InvoiceStore>: Send + Sync {
    /// Locks the user's key record, derives the next address, and returns it
    /// together with the `(major, minor)` indices it was derived at.
    fn next_address(
        &self,
        store: &S,
        user_id: UserId,
        network: NetworkType,
    ) -> impl std::future::Future<Output = Result<(String, i32, i32), ProcessorError>> + Send;
}

/// [`AddressFactory`] for the Monero family (view-key subaddresses).
pub struct MoneroAddressFactory<Drv: AddressDeriver<KeyRecord = ViewKeyRecord>>(pub Drv);

impl<S: InvoiceStore, Drv: AddressDeriver<KeyRecord = ViewKeyRecord> + Send + Sync> AddressFactory<S>
    for MoneroAddressFactory<Drv>
{
    async fn next_address(
        &self,
        store: &S,
        user_id: UserId,
        network: NetworkType,
    ) -> Result<(String, i32, i32), ProcessorError> {
        let (record, major, minor) = store.lock_view_key_and_next_index(user_id).await?;
        let address = self.0.derive(&record, network, major, minor)?;
        Ok((address, major, minor))
    }
}

/// [`AddressFactory`] for the BIP32 families (UTXO and account-based chains).
pub struct HdAddressFactory<Drv: AddressDeriver<KeyRecord = HdKeyRecord>> {
    /// Which chain family's key record to lock.
    pub chain: ChainFamily,
    /// The deriver to apply once the record is locked.
    pub deriver: Drv,
}

impl<S: InvoiceStore, Drv: AddressDeriver<KeyRecord = HdKeyRecord> + Send + Sync> AddressFactory<S>
    for HdAddressFactory<Drv>
{
    async fn next_address(
        &self,
        store: &S,
        user_id: UserId,
        network: NetworkType,
    ) -> Result<(String, i32, i32), ProcessorError> {
        let (record, major, minor) = store.lock_hd_key_and_next_index(user_id, self.chain).await?;
        let address = self.deriver.derive(&record, network, major, minor)?;
        Ok((address, major, minor))
    }
}

/// Supplies a [`TxVerifier`]'s key material for an already-assigned address.
/// Trivial for chains whose verifier needs no key material (`()`); the
/// Monero family looks up the owning user's view key and the address's
/// `(major, minor)` indices.
pub trait KeyMaterialSource<S: InvoiceStore, V: TxVerifier>: Send + Sync {
    /// Produces the key material `V::verify` needs for `address`.
    fn key_material(
        &self,
        store: &S,
        address: &CryptoAddress,
    ) -> impl std::future::Future<Output = Result<V::KeyMaterial, ProcessorError>> + Send;
}

/// [`KeyMaterialSource`] for verifiers that need no key material.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKeyMaterial;

impl<S: InvoiceStore, V: TxVerifier<KeyMaterial = ()>> KeyMaterialSource<S, V> for NoKeyMaterial {
    async fn key_material(&self, _store: &S, _address: &CryptoAddress) -> Result<(), ProcessorError> {
        Ok(())
    }
}

/// [`KeyMaterialSource`] for [`crate::verify::monero::MoneroVerifier`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MoneroKeySource;

impl<S: InvoiceStore> KeyMaterialSource<S, crate::verify::monero::MoneroVerifier> for MoneroKeySource {
    async fn key_material(
        &self,
        store: &S,
        address: &CryptoAddress,
    ) -> Result<crate::verify::monero::MoneroKeyMaterial, ProcessorError> {
        let view_key = store
            .find_view_key(address.user_id)
            .await?
            .ok_or_else(|| ProcessorError::KeyRecordMissing(address.user_id.to_string()))?;
        Ok(crate::verify::monero::MoneroKeyMaterial {
            view_key,
            major: u32::try_from(address.major).unwrap_or(0),
            minor: u32::try_from(address.minor).unwrap_or(0),
        })
    }
}

/// One invoice this process is actively observing, plus the handle to cancel
/// its expiry timer on confirmation.
struct PendingEntry {
    invoice: Invoice,
    expiry_cancel: Option<oneshot::Sender<()>>,
}

/// Drives the invoice state machine for one coin.
pub struct CoinProcessor<D, V, A, K, S>
where
    D: DaemonClient + 'static,
    V: TxVerifier<Tx = D::Tx>,
    A: AddressFactory<S>,
    K: KeyMaterialSource<S, V>,
    S: InvoiceStore + 'static,
{
    coin: CoinType,
    network: NetworkType,
    watcher: Arc<ChainWatcher<D>>,
    verifier: V,
    address_factory: A,
    key_source: K,
    store: Arc<S>,
    invoice_events: Arc<Publisher<Invoice>>,
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl<D, V, A, K, S> CoinProcessor<D, V, A, K, S>
where
    D: DaemonClient + 'static,
    V: TxVerifier<Tx = D::Tx> + Send + Sync,
    A: AddressFactory<S>,
    K: KeyMaterialSource<S, V>,
    S: InvoiceStore + 'static,
{
    /// Builds a processor for `coin`, wired to `watcher` and sharing
    /// `invoice_events` with every other processor in the engine.
    pub fn new(
        coin: CoinType,
        network: NetworkType,
        watcher: Arc<ChainWatcher<D>>,
        verifier: V,
        address_factory: A,
        key_source: K,
        store: Arc<S>,
        invoice_events: Arc<Publisher<Invoice>>,
    ) -> Self {
        CoinProcessor {
            coin,
            network,
            watcher,
            verifier,
            address_factory,
            key_source,
            store,
            invoice_events,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Opens a new invoice: assigns a free address (deriving one if the pool
    /// is exhausted), persists the invoice, and enrolls it for observation.
    pub async fn create_invoice(self: &Arc<Self>, req: NewInvoiceRequest) -> Result<Invoice, ProcessorError> {
        let address = match self.store.find_non_occupied_crypto_address_and_lock(req.user_id, req.coin).await? {
            Some(address) => address,
            None => {
                let (rendered, major, minor) =
                    self.address_factory.next_address(&self.store, req.user_id, self.network).await?;
                let address = CryptoAddress {
                    address: rendered,
                    coin: req.coin,
                    user_id: req.user_id,
                    is_occupied: true,
                    major,
                    minor,
                };
                self.store.create_crypto_address(address.clone()).await?;
                address
            }
        };

        let timeout = req.timeout.max(MIN_SYNC_TIMEOUT);
        let now = Utc::now();
        let confirmations_required = i16::try_from(req.confirmations)
            .map_err(|_| ProcessorError::InvalidInput("confirmations out of range".to_string()))?;
        let invoice = Invoice {
            id: InvoiceId(uuid::Uuid::new_v4()),
            user_id: req.user_id,
            coin: req.coin,
            crypto_address: address.address.clone(),
            required_amount: req.amount,
            actual_amount: None,
            confirmations_required,
            status: InvoiceStatus::Pending,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(10)),
            confirmed_at: None,
            tx_id: None,
        };
        self.store.create_invoice(invoice.clone()).await?;
        self.enroll(invoice.clone()).await;
        info!("{}: opened invoice {} on address {}", self.coin, invoice.id, invoice.crypto_address);
        self.invoice_events.publish(invoice.clone()).await;
        Ok(invoice)
    }

    /// Subscribes to the watcher's block/mempool channels, starts cache
    /// persistence, and starts the watcher from the last persisted height (or
    /// the current tip if none is cached).
    pub async fn load(self: &Arc<Self>) -> Result<(), ProcessorError> {
        let from_height = match self.store.find_crypto_cache(self.coin).await? {
            Some(cache) => cache.last_synced_block_height.unwrap_or(self.watcher.daemon().last_block_height().await?),
            None => self.watcher.daemon().last_block_height().await?,
        };

        let mut blocks = self.watcher.subscribe_blocks();
        let mut mempool = self.watcher.subscribe_mempool();

        let block_processor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(block) = blocks.recv().await {
                block_processor.on_new_block(block).await;
            }
        });

        let mempool_processor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(tx) = mempool.recv().await {
                mempool_processor.on_mempool_tx(tx).await;
            }
        });

        let cache_processor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CACHE_PERSIST_INTERVAL);
            loop {
                ticker.tick().await;
                let height = cache_processor.watcher.last_synced_block_height();
                if let Err(e) = cache_processor.store.update_crypto_cache(cache_processor.coin, height).await {
                    warn!("{}: failed to persist sync cache: {e}", cache_processor.coin);
                }
            }
        });

        self.watcher.start(from_height).await;
        Ok(())
    }

    /// Re-enrolls an invoice recovered at startup (already persisted, not
    /// terminal) without re-touching the address pool.
    pub async fn enroll(self: &Arc<Self>, invoice: Invoice) {
        let address = invoice.crypto_address.clone();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(address.clone(), PendingEntry { invoice: invoice.clone(), expiry_cancel: Some(cancel_tx) });
        }
        self.spawn_expiry_timer(address, invoice.expires_at, cancel_rx);
    }

    fn spawn_expiry_timer(
        self: &Arc<Self>,
        address: String,
        expires_at: chrono::DateTime<Utc>,
        mut cancel: oneshot::Receiver<()>,
    ) {
        let processor = Arc::clone(self);
        tokio::spawn(async move {
            let remaining = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                () = tokio::time::sleep(remaining) => {
                    processor.expire(&address).await;
                }
                _ = &mut cancel => {}
            }
        });
    }

    async fn on_mempool_tx(&self, tx: D::Tx) {
        if tx.is_double_spend() {
            debug!("{}: skipping double-spend-flagged tx {}", self.coin, tx.tx_id());
            return;
        }
        let addresses: Vec<String> = self.pending.lock().await.keys().cloned().collect();
        let tasks = addresses.into_iter().map(|address| {
            let tx = tx.clone();
            async move {
                self.process_tx_for_address(&address, &tx).await;
            }
        });
        futures::future::join_all(tasks).await;
    }

    async fn process_tx_for_address(&self, address: &str, tx: &D::Tx) {
        let Some(invoice) = self.pending.lock().await.get(address).map(|e| e.invoice.clone()) else {
            return;
        };
        if invoice.status != InvoiceStatus::Pending {
            return;
        }
        let key_material = match self.lookup_key_material(address).await {
            Ok(material) => material,
            Err(e) => {
                error!("{}: failed to resolve key material for {address}: {e}", self.coin);
                return;
            }
        };
        let credited = match self.verifier.verify(&invoice, tx, &key_material) {
            Ok(credited) => credited,
            Err(e) => {
                error!("{}: verification failed for {address}: {e}", self.coin);
                return;
            }
        };
        if credited < invoice.required_amount {
            return;
        }
        match self.store.confirm_invoice_mempool(invoice.id, credited, tx.tx_id().to_string()).await {
            Ok(Some(updated)) => {
                self.update_pending(address, updated.clone()).await;
                self.invoice_events.publish(updated).await;
                self.confirm_if_mature(address, tx.confirmations()).await;
            }
            Ok(None) => {}
            Err(e) => error!("{}: failed to record mempool match for {address}: {e}", self.coin),
        }
    }

    async fn lookup_key_material(&self, address: &str) -> Result<V::KeyMaterial, ProcessorError> {
        let row = self
            .store
            .find_crypto_address(address)
            .await?
            .ok_or_else(|| ProcessorError::KeyRecordMissing(address.to_string()))?;
        self.key_source.key_material(&self.store, &row).await
    }

    async fn on_new_block(&self, block: <D as DaemonClient>::Block) {
        use crate::daemon::Block as BlockTrait;
        let addresses: Vec<String> = self.pending.lock().await.keys().cloned().collect();
        let maturity_checks = addresses.into_iter().map(|address| async move {
            self.confirm_if_mature(&address, 0).await;
        });
        futures::future::join_all(maturity_checks).await;

        match self.watcher.daemon().fetch_transactions(block.tx_ids()).await {
            Ok(txs) => {
                for tx in txs {
                    self.on_mempool_tx(tx).await;
                }
            }
            Err(e) => warn!("{}: failed to fetch block transactions: {e}", self.coin),
        }
    }

    /// Confirms `address`'s invoice if its recorded transaction has accrued
    /// enough confirmations, re-fetching it from the daemon to check for
    /// rejection first. `hint_confirmations` lets `on_mempool_tx` skip an
    /// extra round-trip when it already knows the tx's confirmation count.
    async fn confirm_if_mature(&self, address: &str, hint_confirmations: u64) {
        let Some(invoice) = self.pending.lock().await.get(address).map(|e| e.invoice.clone()) else {
            return;
        };
        let Some(tx_id) = invoice.tx_id.clone() else {
            return;
        };

        let confirmations = if hint_confirmations > 0 {
            hint_confirmations
        } else {
            match self.watcher.daemon().fetch_transactions(&[tx_id.clone()]).await {
                Ok(txs) => match txs.into_iter().next() {
                    Some(tx) if tx.is_double_spend() => {
                        self.expire(address).await;
                        return;
                    }
                    Some(tx) => tx.confirmations(),
                    None => {
                        self.expire(address).await;
                        return;
                    }
                },
                Err(e) => {
                    warn!("{}: could not refetch tx {tx_id} to check maturity: {e}", self.coin);
                    return;
                }
            }
        };

        if confirmations < u64::try_from(invoice.confirmations_required).unwrap_or(u64::MAX) {
            return;
        }

        let Some(entry) = self.pending.lock().await.remove(address) else {
            return;
        };
        if let Some(cancel) = entry.expiry_cancel {
            let _ = cancel.send(());
        }

        let confirmed_at = Utc::now();
        match self.store.confirm_invoice(invoice.id, confirmed_at).await {
            Ok(Some(confirmed)) => {
                if let Err(e) = self.store.update_is_occupied(address, false).await {
                    error!("{}: failed to release address {address}: {e}", self.coin);
                }
                self.invoice_events.publish(confirmed).await;
            }
            Ok(None) => {}
            Err(e) => error!("{}: failed to confirm invoice {}: {e}", self.coin, invoice.id),
        }
    }

    /// Expires `address`'s invoice: removes it from `pending`, marks it
    /// `EXPIRED` unless it already confirmed, and releases the address.
    async fn expire(&self, address: &str) {
        let Some(entry) = self.pending.lock().await.remove(address) else {
            return;
        };
        if let Some(cancel) = entry.expiry_cancel {
            let _ = cancel.send(());
        }
        match self.store.expire_invoice(entry.invoice.id).await {
            Ok(Some(expired)) => {
                if let Err(e) = self.store.update_is_occupied(address, false).await {
                    error!("{}: failed to release address {address}: {e}", self.coin);
                }
                self.invoice_events.publish(expired).await;
            }
            Ok(None) => {}
            Err(e) => error!("{}: failed to expire invoice {}: {e}", self.coin, entry.invoice.id),
        }
    }

    async fn update_pending(&self, address: &str, invoice: Invoice) {
        if let Some(entry) = self.pending.lock().await.get_mut(address) {
            entry.invoice = invoice;
        }
    }
}

/// Failure in a [`CoinProcessor`] operation.
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// A request field was out of range or otherwise malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// A key record expected to exist for a user/address was not found.
    #[error("key record missing: {0}")]
    KeyRecordMissing(String),
    /// Address or index derivation failed.
    #[error("derivation failed: {0}")]
    Derive(#[from] DeriveError),
    /// Transaction verification failed.
    #[error("verification failed: {0}")]
    Verify(#[from] VerifyError),
    /// The persistence layer failed or rejected a transition.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// The daemon could not be reached.
    #[error("daemon unavailable: {0}")]
    Daemon(#[from] DaemonError),
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    use super::*;
    use crate::daemon::utxo::{MockUtxoClient, UtxoChain, UtxoOutput, UtxoTx};
    use crate::derive::utxo::UtxoDeriver;
    use crate::store::memory::MemoryStore;
    use crate::verify::utxo::UtxoVerifier;

    type TestProcessor =
        CoinProcessor<MockUtxoClient, UtxoVerifier, HdAddressFactory<UtxoDeriver>, NoKeyMaterial, MemoryStore>;

    fn build(mock: MockUtxoClient, store: Arc<MemoryStore>) -> Arc<TestProcessor> {
        let watcher = Arc::new(ChainWatcher::new(mock));
        let address_factory =
            HdAddressFactory { chain: ChainFamily::Bitcoin, deriver: UtxoDeriver::new(UtxoChain::Bitcoin) };
        Arc::new(CoinProcessor::new(
            CoinType::BTC,
            NetworkType::BitcoinMainnet,
            watcher,
            UtxoVerifier,
            address_factory,
            NoKeyMaterial,
            store,
            Arc::new(Publisher::new()),
        ))
    }

    async fn seed_address(store: &MemoryStore, address: &str) -> UserId {
        let user_id = store.create_user(None).await.unwrap();
        store
            .create_crypto_address(CryptoAddress {
                address: address.to_string(),
                coin: CoinType::BTC,
                user_id,
                is_occupied: true,
                major: 0,
                minor: 0,
            })
            .await
            .unwrap();
        user_id
    }

    fn invoice_for(user_id: UserId, address: &str, status: InvoiceStatus, expires_at: chrono::DateTime<Utc>) -> Invoice {
        Invoice {
            id: InvoiceId(Uuid::new_v4()),
            user_id,
            coin: CoinType::BTC,
            crypto_address: address.to_string(),
            required_amount: 0.5,
            actual_amount: if status == InvoiceStatus::PendingMempool { Some(0.5) } else { None },
            confirmations_required: 1,
            status,
            created_at: Utc::now(),
            expires_at,
            confirmed_at: None,
            tx_id: if status == InvoiceStatus::PendingMempool { Some("deadbeef".to_string()) } else { None },
        }
    }

    #[tokio::test]
    async fn vanished_mempool_tx_expires_invoice_and_releases_address() {
        let store = Arc::new(MemoryStore::new());
        let address = "addr1";
        let user_id = seed_address(&store, address).await;
        let invoice = invoice_for(
            user_id,
            address,
            InvoiceStatus::PendingMempool,
            Utc::now() + ChronoDuration::minutes(10),
        );
        store.create_invoice(invoice.clone()).await.unwrap();

        let processor = build(MockUtxoClient::new(UtxoChain::Bitcoin), Arc::clone(&store));
        processor.enroll(invoice.clone()).await;

        // The recorded tx is gone from both mempool and any block: the daemon
        // has never heard of it.
        processor.confirm_if_mature(address, 0).await;

        let updated = store.find_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(updated.status, InvoiceStatus::Expired);
        let row = store.find_crypto_address(address).await.unwrap().unwrap();
        assert!(!row.is_occupied);
    }

    #[tokio::test]
    async fn expiry_timer_expires_a_stale_pending_invoice() {
        let store = Arc::new(MemoryStore::new());
        let address = "addr2";
        let user_id = seed_address(&store, address).await;
        let invoice = invoice_for(
            user_id,
            address,
            InvoiceStatus::Pending,
            Utc::now() + ChronoDuration::milliseconds(50),
        );
        store.create_invoice(invoice.clone()).await.unwrap();

        let processor = build(MockUtxoClient::new(UtxoChain::Bitcoin), Arc::clone(&store));
        processor.enroll(invoice.clone()).await;

        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        let updated = store.find_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(updated.status, InvoiceStatus::Expired);
        let row = store.find_crypto_address(address).await.unwrap().unwrap();
        assert!(!row.is_occupied);
    }

    #[tokio::test]
    async fn matching_tx_with_enough_confirmations_confirms_in_one_pass() {
        let store = Arc::new(MemoryStore::new());
        let address = "addr3";
        let user_id = seed_address(&store, address).await;
        let invoice =
            invoice_for(user_id, address, InvoiceStatus::Pending, Utc::now() + ChronoDuration::minutes(10));
        store.create_invoice(invoice.clone()).await.unwrap();

        let processor = build(MockUtxoClient::new(UtxoChain::Bitcoin), Arc::clone(&store));
        processor.enroll(invoice.clone()).await;

        let tx = UtxoTx {
            txid: "txid1".to_string(),
            confirmations: 1,
            outputs: vec![UtxoOutput { address: Some(address.to_string()), value: 0.5 }],
        };
        processor.on_mempool_tx(tx).await;

        let updated = store.find_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(updated.status, InvoiceStatus::Confirmed);
        assert_eq!(updated.tx_id.as_deref(), Some("txid1"));
        let row = store.find_crypto_address(address).await.unwrap().unwrap();
        assert!(!row.is_occupied);
    }

    #[tokio::test]
    async fn underpaid_tx_leaves_invoice_pending() {
        let store = Arc::new(MemoryStore::new());
        let address = "addr4";
        let user_id = seed_address(&store, address).await;
        let invoice =
            invoice_for(user_id, address, InvoiceStatus::Pending, Utc::now() + ChronoDuration::minutes(10));
        store.create_invoice(invoice.clone()).await.unwrap();

        let processor = build(MockUtxoClient::new(UtxoChain::Bitcoin), Arc::clone(&store));
        processor.enroll(invoice.clone()).await;

        let tx = UtxoTx {
            txid: "txid2".to_string(),
            confirmations: 1,
            outputs: vec![UtxoOutput { address: Some(address.to_string()), value: 0.1 }],
        };
        processor.on_mempool_tx(tx).await;

        let updated = store.find_invoice(invoice.id).await.unwrap().unwrap();
        assert_eq!(updated.status, InvoiceStatus::Pending);
    }
}
