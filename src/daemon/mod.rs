//! Read-only daemon access: the contract every chain family's RPC client
//! implements, and the capability types [`ChainWatcher`](crate::watcher::ChainWatcher)
//! and [`CoinProcessor`](crate::processor::CoinProcessor) are built against.
//!
//! This crate never holds a spend key or signs a transaction; every client
//! under this module talks to a daemon's read-only (or, for monerod,
//! restricted) RPC surface.

mod auth;
pub mod evm;
pub mod monero;
mod transport;
pub mod utxo;

use std::fmt::Debug;
use std::future::Future;

use thiserror::Error;

use crate::types::{CoinType, NetworkType};

/// A daemon-reported block, reduced to what a [`ChainWatcher`](crate::watcher::ChainWatcher)
/// needs: the set of transaction ids it introduced.
pub trait Block: Debug + Clone + Send + Sync {
    /// Height of this block.
    fn height(&self) -> u64;

    /// Ids of every transaction this block contains, in daemon order.
    fn tx_ids(&self) -> &[String];
}

/// A daemon-reported transaction, reduced to what a [`TxVerifier`](crate::verify::TxVerifier)
/// needs to decide whether it pays an invoice.
pub trait Tx: Debug + Clone + Send + Sync {
    /// The chain-native transaction id (hash).
    fn tx_id(&self) -> &str;

    /// Confirmations the daemon currently reports for this transaction.
    /// Daemons report `0` for an unconfirmed (mempool) transaction.
    fn confirmations(&self) -> u64;

    /// Whether the daemon flagged this transaction as a double-spend (seen
    /// but rejected, e.g. conflicting with an already-mined transaction).
    /// A double-spent transaction can never confirm and should fail any
    /// invoice it was provisionally matched against.
    fn is_double_spend(&self) -> bool;
}

/// Read-only access to one blockchain daemon.
///
/// Every method is read-only: nothing under this trait can move funds. RPITIT
/// (`impl Future` in the return position) is used instead of `async-trait` so
/// implementors avoid an unnecessary heap allocation per call.
pub trait DaemonClient: Send + Sync {
    /// Concrete block type this daemon reports.
    type Block: Block;
    /// Concrete transaction type this daemon reports.
    type Tx: Tx;

    /// The coin this client watches.
    fn coin_type(&self) -> CoinType;

    /// The network (mainnet/testnet/...) this client is configured against.
    fn network_type(&self) -> NetworkType;

    /// Height of the daemon's current chain tip.
    fn last_block_height(&self) -> impl Future<Output = Result<u64, DaemonError>> + Send;

    /// Fetches one block (and its transactions) by height.
    fn block_by_height(
        &self,
        height: u64,
    ) -> impl Future<Output = Result<Self::Block, DaemonError>> + Send;

    /// Ids of every transaction currently sitting in the daemon's mempool.
    fn mempool_tx_ids(&self) -> impl Future<Output = Result<Vec<String>, DaemonError>> + Send;

    /// Fetches full transaction bodies for the given ids. A missing id is
    /// silently dropped from the result rather than failing the whole call,
    /// since a mempool transaction can be mined (and evicted from the
    /// mempool) between listing ids and fetching them.
    fn fetch_transactions(
        &self,
        ids: &[String],
    ) -> impl Future<Output = Result<Vec<Self::Tx>, DaemonError>> + Send;
}

/// Failure talking to a daemon's RPC surface.
#[derive(Error, Debug)]
pub enum DaemonError {
    /// The underlying HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] hyper::Error),
    /// The HTTP request could not even be constructed.
    #[error("failed to build HTTP request: {0}")]
    Request(#[from] hyper::http::Error),
    /// The request did not complete before the configured timeout.
    #[error("daemon request timed out: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),
    /// Hex-encoded data in a response did not decode.
    #[error("hex decoding failed: {0}")]
    HexDecode(#[from] hex::FromHexError),
    /// Expected data was missing from an RPC response.
    #[error("expected data was not present in RPC response: {0}")]
    MissingData(String),
    /// A JSON value was present but of the wrong shape.
    #[error("failed to interpret json value \"{found}\" from RPC response as {expected}")]
    DataType {
        /// The value actually returned.
        found: serde_json::Value,
        /// What the caller expected it to look like.
        expected: &'static str,
    },
    /// The response body was not valid JSON.
    #[error("failed to interpret response body as json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// Monero consensus (de)serialization of a block/transaction blob failed.
    #[error("monero (de)serialization failed: {0}")]
    MoneroSerialization(#[from] ::monero::consensus::encode::Error),
    /// Digest authentication with the daemon failed.
    #[error("authentication error: {0}")]
    Auth(#[from] auth::AuthError),
    /// The daemon returned a JSON-RPC error object.
    #[error("daemon returned RPC error: {0}")]
    RpcError(String),
}
