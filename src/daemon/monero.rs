//! monerod restricted-RPC client: digest auth, `json_rpc` batching at 100
//! hashes per request.

use std::collections::HashMap;
use std::time::Duration;

use monero::consensus::deserialize;
use serde_json::json;

use super::transport::RpcTransport;
use super::{Block as BlockTrait, DaemonError, DaemonClient, Tx as TxTrait};
use crate::types::{CoinType, NetworkType};

const MAX_REQUESTED_TRANSACTIONS: usize = 100;

/// A monerod block, reduced to its height and the transaction ids it
/// introduced (miner transaction included).
#[derive(Debug, Clone)]
pub struct MoneroBlock {
    height: u64,
    tx_ids: Vec<String>,
}

impl BlockTrait for MoneroBlock {
    fn height(&self) -> u64 {
        self.height
    }

    fn tx_ids(&self) -> &[String] {
        &self.tx_ids
    }
}

/// A monerod transaction plus the daemon metadata (`confirmations`,
/// `double_spend_seen`) `get_transactions` reports alongside the raw blob.
#[derive(Debug, Clone)]
pub struct MoneroTx {
    hash: String,
    confirmations: u64,
    double_spend_seen: bool,
    /// Parsed transaction body, used by [`crate::verify::monero`] to scan
    /// outputs against a subaddress key.
    pub transaction: monero::Transaction,
}

impl TxTrait for MoneroTx {
    fn tx_id(&self) -> &str {
        &self.hash
    }

    fn confirmations(&self) -> u64 {
        self.confirmations
    }

    fn is_double_spend(&self) -> bool {
        self.double_spend_seen
    }
}

/// Read-only client for monerod's restricted RPC.
pub struct MoneroDaemonClient {
    transport: RpcTransport,
    network: NetworkType,
}

impl MoneroDaemonClient {
    /// Builds a client pointed at `url`, optionally authenticating with
    /// digest auth if `username`/`password` are set.
    #[must_use]
    pub fn new(
        url: hyper::Uri,
        network: NetworkType,
        username: Option<String>,
        password: Option<String>,
    ) -> MoneroDaemonClient {
        MoneroDaemonClient {
            transport: RpcTransport::new(
                url,
                Duration::from_secs(30),
                Duration::from_secs(10),
                username,
                password,
                true,
            ),
            network,
        }
    }

    async fn transactions_by_hashes(&self, hashes: &[String]) -> Result<Vec<MoneroTx>, DaemonError> {
        let mut transactions = Vec::new();
        if hashes.is_empty() {
            return Ok(transactions);
        }
        for chunk in hashes.chunks(MAX_REQUESTED_TRANSACTIONS) {
            let body = json!({ "txs_hashes": chunk }).to_string();
            let res = self.transport.post(body, "get_transactions").await?;

            let hexes = res["txs_as_hex"]
                .as_array()
                .ok_or_else(|| DaemonError::MissingData("{ txs_as_hex: [...] }".to_string()))?;
            let metadata = res["txs"].as_array();

            for (i, tx_hex_json) in hexes.iter().enumerate() {
                let tx_str = tx_hex_json.as_str().ok_or_else(|| DaemonError::DataType {
                    found: tx_hex_json.clone(),
                    expected: "&str",
                })?;
                let tx_bytes = hex::decode(tx_str)?;
                let transaction: monero::Transaction = deserialize(&tx_bytes)?;

                let entry = metadata.and_then(|m| m.get(i));
                let confirmations = entry
                    .and_then(|e| e["block_height"].as_u64())
                    .map_or(0, |_| entry.and_then(|e| e["confirmations"].as_u64()).unwrap_or(0));
                let double_spend_seen = entry
                    .and_then(|e| e["double_spend_seen"].as_bool())
                    .unwrap_or(false);

                transactions.push(MoneroTx {
                    hash: chunk[i].clone(),
                    confirmations,
                    double_spend_seen,
                    transaction,
                });
            }
        }
        Ok(transactions)
    }
}

impl DaemonClient for MoneroDaemonClient {
    type Block = MoneroBlock;
    type Tx = MoneroTx;

    fn coin_type(&self) -> CoinType {
        CoinType::XMR
    }

    fn network_type(&self) -> NetworkType {
        self.network
    }

    async fn last_block_height(&self) -> Result<u64, DaemonError> {
        let body = r#"{"jsonrpc":"2.0","id":"0","method":"get_block_count"}"#.to_string();
        let res = self.transport.post(body, "json_rpc").await?;
        res["result"]["count"]
            .as_u64()
            .ok_or_else(|| DaemonError::MissingData("{ result: { count: ... } }".to_string()))
    }

    async fn block_by_height(&self, height: u64) -> Result<MoneroBlock, DaemonError> {
        let body = format!(
            r#"{{"jsonrpc":"2.0","id":"0","method":"get_block","params":{{"height":{height}}}}}"#
        );
        let res = self.transport.post(body, "json_rpc").await?;

        let tx_hashes = res["result"]["tx_hashes"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        Ok(MoneroBlock { height, tx_ids: tx_hashes })
    }

    async fn mempool_tx_ids(&self) -> Result<Vec<String>, DaemonError> {
        let res = self.transport.post(String::new(), "get_transaction_pool_hashes").await?;
        let Some(hashes) = res["tx_hashes"].as_array() else {
            return Ok(Vec::new());
        };
        hashes
            .iter()
            .map(|h| {
                h.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| DaemonError::DataType { found: h.clone(), expected: "&str" })
            })
            .collect()
    }

    async fn fetch_transactions(&self, ids: &[String]) -> Result<Vec<MoneroTx>, DaemonError> {
        self.transactions_by_hashes(ids).await
    }
}

/// In-memory [`DaemonClient`] used by tests; never makes a network call.
#[derive(Default)]
pub struct MockMoneroClient {
    blocks: HashMap<u64, MoneroBlock>,
    mempool: Vec<String>,
    transactions: HashMap<String, MoneroTx>,
    height: u64,
}

impl MockMoneroClient {
    /// Creates an empty mock at height 0 with no mempool activity.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `transaction` to the mock's mempool and transaction table.
    pub fn push_mempool_tx(&mut self, tx: MoneroTx) {
        self.mempool.push(tx.hash.clone());
        self.transactions.insert(tx.hash.clone(), tx);
    }

    /// Mines a block containing `tx_ids`, advancing the mock's tip height and
    /// clearing those ids from the mempool.
    pub fn mine_block(&mut self, tx_ids: Vec<String>) {
        self.height += 1;
        self.mempool.retain(|id| !tx_ids.contains(id));
        self.blocks.insert(self.height, MoneroBlock { height: self.height, tx_ids });
    }
}

impl DaemonClient for MockMoneroClient {
    type Block = MoneroBlock;
    type Tx = MoneroTx;

    fn coin_type(&self) -> CoinType {
        CoinType::XMR
    }

    fn network_type(&self) -> NetworkType {
        NetworkType::MoneroTestnet
    }

    async fn last_block_height(&self) -> Result<u64, DaemonError> {
        Ok(self.height)
    }

    async fn block_by_height(&self, height: u64) -> Result<MoneroBlock, DaemonError> {
        self.blocks
            .get(&height)
            .cloned()
            .ok_or_else(|| DaemonError::MissingData(format!("no mock block at height {height}")))
    }

    async fn mempool_tx_ids(&self) -> Result<Vec<String>, DaemonError> {
        Ok(self.mempool.clone())
    }

    async fn fetch_transactions(&self, ids: &[String]) -> Result<Vec<MoneroTx>, DaemonError> {
        Ok(ids.iter().filter_map(|id| self.transactions.get(id).cloned()).collect())
    }
}
