//! JSON-RPC client shared by the UTXO chain family (Bitcoin Core / Litecoin
//! Core use the same `getblock`/`getrawtransaction` surface), authenticated
//! with HTTP basic auth (`rpcuser`/`rpcpassword`) rather than monerod's
//! digest scheme.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;

use super::transport::RpcTransport;
use super::{Block as BlockTrait, DaemonClient, DaemonError, Tx as TxTrait};
use crate::types::{CoinType, NetworkType};

/// One output of a [`UtxoTx`].
#[derive(Debug, Clone)]
pub struct UtxoOutput {
    /// Destination address, as reported by `scriptPubKey.address`.
    pub address: Option<String>,
    /// Value, in the chain's display unit (BTC, LTC).
    pub value: f64,
}

/// A Bitcoin/Litecoin block, reduced to height and contained txids.
#[derive(Debug, Clone)]
pub struct UtxoBlock {
    height: u64,
    tx_ids: Vec<String>,
}

impl BlockTrait for UtxoBlock {
    fn height(&self) -> u64 {
        self.height
    }

    fn tx_ids(&self) -> &[String] {
        &self.tx_ids
    }
}

/// A Bitcoin/Litecoin transaction, reduced to what [`crate::verify::utxo`]
/// needs to match it against an invoice's deposit address.
#[derive(Debug, Clone)]
pub struct UtxoTx {
    pub(crate) txid: String,
    pub(crate) confirmations: u64,
    pub(crate) outputs: Vec<UtxoOutput>,
}

impl TxTrait for UtxoTx {
    fn tx_id(&self) -> &str {
        &self.txid
    }

    fn confirmations(&self) -> u64 {
        self.confirmations
    }

    fn is_double_spend(&self) -> bool {
        // A UTXO chain has no daemon-side double-spend flag; a transaction
        // either ends up mined or its mempool entry vanishes without
        // confirming. `CoinProcessor::expire` handles the latter case by
        // timeout rather than an explicit signal.
        false
    }
}

/// Which UTXO chain this client talks to. Only affects which `CoinType` it
/// reports; the RPC surface is identical.
#[derive(Debug, Clone, Copy)]
pub enum UtxoChain {
    /// Bitcoin Core.
    Bitcoin,
    /// Litecoin Core.
    Litecoin,
}

/// Read-only Bitcoin Core / Litecoin Core JSON-RPC client.
pub struct UtxoDaemonClient {
    transport: RpcTransport,
    chain: UtxoChain,
    network: NetworkType,
}

impl UtxoDaemonClient {
    /// Builds a client pointed at `url`, using HTTP basic auth if
    /// `username`/`password` are set.
    #[must_use]
    pub fn new(
        url: hyper::Uri,
        chain: UtxoChain,
        network: NetworkType,
        username: Option<String>,
        password: Option<String>,
    ) -> UtxoDaemonClient {
        UtxoDaemonClient {
            transport: RpcTransport::new(
                url,
                Duration::from_secs(30),
                Duration::from_secs(10),
                username,
                password,
                false,
            ),
            chain,
            network,
        }
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, DaemonError> {
        let body = json!({ "jsonrpc": "1.0", "id": "paygate", "method": method, "params": params })
            .to_string();
        let res = self.transport.post(body, "").await?;
        if !res["error"].is_null() {
            return Err(DaemonError::RpcError(res["error"].to_string()));
        }
        Ok(res["result"].clone())
    }
}

impl DaemonClient for UtxoDaemonClient {
    type Block = UtxoBlock;
    type Tx = UtxoTx;

    fn coin_type(&self) -> CoinType {
        match self.chain {
            UtxoChain::Bitcoin => CoinType::BTC,
            UtxoChain::Litecoin => CoinType::LTC,
        }
    }

    fn network_type(&self) -> NetworkType {
        self.network
    }

    async fn last_block_height(&self) -> Result<u64, DaemonError> {
        let result = self.call("getblockcount", json!([])).await?;
        result
            .as_u64()
            .ok_or_else(|| DaemonError::DataType { found: result, expected: "u64" })
    }

    async fn block_by_height(&self, height: u64) -> Result<UtxoBlock, DaemonError> {
        let hash = self.call("getblockhash", json!([height])).await?;
        let hash = hash
            .as_str()
            .ok_or_else(|| DaemonError::DataType { found: hash.clone(), expected: "&str" })?;
        let block = self.call("getblock", json!([hash, 1])).await?;
        let tx_ids = block["tx"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        Ok(UtxoBlock { height, tx_ids })
    }

    async fn mempool_tx_ids(&self) -> Result<Vec<String>, DaemonError> {
        let result = self.call("getrawmempool", json!([false])).await?;
        let Some(ids) = result.as_array() else {
            return Ok(Vec::new());
        };
        ids.iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| DaemonError::DataType { found: v.clone(), expected: "&str" })
            })
            .collect()
    }

    async fn fetch_transactions(&self, ids: &[String]) -> Result<Vec<UtxoTx>, DaemonError> {
        let mut transactions = Vec::with_capacity(ids.len());
        for txid in ids {
            let raw = match self.call("getrawtransaction", json!([txid, true])).await {
                Ok(raw) => raw,
                // The transaction may have left the mempool (mined, or
                // evicted) between the id listing and this fetch.
                Err(DaemonError::RpcError(_)) => continue,
                Err(e) => return Err(e),
            };
            let confirmations = raw["confirmations"].as_u64().unwrap_or(0);
            let outputs = raw["vout"]
                .as_array()
                .map(|vouts| {
                    vouts
                        .iter()
                        .map(|vout| UtxoOutput {
                            address: vout["scriptPubKey"]["address"].as_str().map(str::to_string),
                            value: vout["value"].as_f64().unwrap_or(0.0),
                        })
                        .collect()
                })
                .unwrap_or_default();
            transactions.push(UtxoTx { txid: txid.clone(), confirmations, outputs });
        }
        Ok(transactions)
    }
}

/// In-memory [`DaemonClient`] used by tests.
#[derive(Default)]
pub struct MockUtxoClient {
    blocks: HashMap<u64, UtxoBlock>,
    mempool: Vec<String>,
    transactions: HashMap<String, UtxoTx>,
    height: u64,
    chain: Option<UtxoChain>,
}

impl MockUtxoClient {
    /// Creates an empty mock for `chain` at height 0.
    #[must_use]
    pub fn new(chain: UtxoChain) -> Self {
        MockUtxoClient { chain: Some(chain), ..Self::default() }
    }

    /// Adds a transaction to the mock's mempool.
    pub fn push_mempool_tx(&mut self, txid: String, outputs: Vec<UtxoOutput>) {
        self.mempool.push(txid.clone());
        self.transactions.insert(txid.clone(), UtxoTx { txid, confirmations: 0, outputs });
    }

    /// Mines a block containing `tx_ids`, bumping every mined transaction's
    /// reported confirmation count and clearing them from the mempool.
    pub fn mine_block(&mut self, tx_ids: Vec<String>) {
        self.height += 1;
        self.mempool.retain(|id| !tx_ids.contains(id));
        for id in &tx_ids {
            if let Some(tx) = self.transactions.get_mut(id) {
                tx.confirmations = 1;
            }
        }
        self.blocks.insert(self.height, UtxoBlock { height: self.height, tx_ids });
    }

    /// Advances every already-mined transaction's confirmation count by one,
    /// simulating further blocks being mined on top without introducing new
    /// transactions.
    pub fn bump_confirmations(&mut self) {
        self.height += 1;
        for tx in self.transactions.values_mut() {
            if tx.confirmations > 0 {
                tx.confirmations += 1;
            }
        }
    }
}

impl DaemonClient for MockUtxoClient {
    type Block = UtxoBlock;
    type Tx = UtxoTx;

    fn coin_type(&self) -> CoinType {
        match self.chain {
            Some(UtxoChain::Litecoin) => CoinType::LTC,
            _ => CoinType::BTC,
        }
    }

    fn network_type(&self) -> NetworkType {
        NetworkType::BitcoinRegtest
    }

    async fn last_block_height(&self) -> Result<u64, DaemonError> {
        Ok(self.height)
    }

    async fn block_by_height(&self, height: u64) -> Result<UtxoBlock, DaemonError> {
        self.blocks
            .get(&height)
            .cloned()
            .ok_or_else(|| DaemonError::MissingData(format!("no mock block at height {height}")))
    }

    async fn mempool_tx_ids(&self) -> Result<Vec<String>, DaemonError> {
        Ok(self.mempool.clone())
    }

    async fn fetch_transactions(&self, ids: &[String]) -> Result<Vec<UtxoTx>, DaemonError> {
        Ok(ids.iter().filter_map(|id| self.transactions.get(id).cloned()).collect())
    }
}
