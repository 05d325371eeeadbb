//! Bitcoin Core-shaped mock daemon for the integration test: one JSON-RPC
//! endpoint at `/`, matching requests by their exact body the way
//! `UtxoDaemonClient` builds them (jsonrpc 1.0, id `"paygate"`, positional
//! params).

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Mutex;

use httpmock::{Mock, MockServer};
use serde_json::{json, Value};

pub struct MockDaemon {
    server: MockServer,
    block_count_id: Mutex<Option<usize>>,
    mempool_id: Mutex<Option<usize>>,
    tx_ids: Mutex<HashMap<String, usize>>,
}

impl Deref for MockDaemon {
    type Target = MockServer;

    fn deref(&self) -> &MockServer {
        &self.server
    }
}

impl MockDaemon {
    /// Starts a mock daemon at an empty chain tip with an empty mempool.
    pub fn start() -> MockDaemon {
        let daemon = MockDaemon {
            server: MockServer::start(),
            block_count_id: Mutex::new(None),
            mempool_id: Mutex::new(None),
            tx_ids: Mutex::new(HashMap::new()),
        };
        daemon.set_block_count(100);
        daemon.set_mempool(&[]);
        daemon
    }

    fn request_body(method: &str, params: Value) -> String {
        json!({ "jsonrpc": "1.0", "id": "paygate", "method": method, "params": params }).to_string()
    }

    fn response_body(result: &Value) -> Value {
        json!({ "id": "paygate", "jsonrpc": "1.0", "error": Value::Null, "result": result })
    }

    /// Replaces the `getblockcount` mock, so the watcher's next poll sees a
    /// new tip.
    pub fn set_block_count(&self, height: u64) {
        if let Some(id) = self.block_count_id.lock().unwrap().take() {
            Mock::new(id, &self.server).delete();
        }
        let body = Self::request_body("getblockcount", json!([]));
        let result = json!(height);
        let mock = self.server.mock(|when, then| {
            when.path("/").body(body.clone());
            then.status(200).json_body(Self::response_body(&result));
        });
        *self.block_count_id.lock().unwrap() = Some(mock.id);
    }

    /// Replaces the `getrawmempool` mock with `txids`.
    pub fn set_mempool(&self, txids: &[&str]) {
        if let Some(id) = self.mempool_id.lock().unwrap().take() {
            Mock::new(id, &self.server).delete();
        }
        let body = Self::request_body("getrawmempool", json!([false]));
        let result = json!(txids);
        let mock = self.server.mock(|when, then| {
            when.path("/").body(body.clone());
            then.status(200).json_body(Self::response_body(&result));
        });
        *self.mempool_id.lock().unwrap() = Some(mock.id);
    }

    /// Registers or replaces the `getrawtransaction` mock for `txid`, with a
    /// single output paying `address` with `value`, at `confirmations`.
    pub fn set_transaction(&self, txid: &str, confirmations: u64, address: &str, value: f64) {
        let mut ids = self.tx_ids.lock().unwrap();
        if let Some(id) = ids.remove(txid) {
            Mock::new(id, &self.server).delete();
        }
        let body = Self::request_body("getrawtransaction", json!([txid, true]));
        let result = json!({
            "confirmations": confirmations,
            "vout": [{ "scriptPubKey": { "address": address }, "value": value }],
        });
        let mock = self.server.mock(|when, then| {
            when.path("/").body(body.clone());
            then.status(200).json_body(Self::response_body(&result));
        });
        ids.insert(txid.to_string(), mock.id);
    }

    /// Mines an empty block at `height` (the next height the watcher's
    /// catch-up loop will actually fetch, i.e. its current
    /// `last_synced_block_height`) and bumps the reported chain tip to
    /// `height + 1`, so the watcher observes the new block and re-checks
    /// every pending invoice's recorded transaction for fresh confirmations.
    pub fn mine_empty_block(&self, height: u64) {
        let hash = format!("{height:064x}");
        let hash_body = Self::request_body("getblockhash", json!([height]));
        let hash_result = json!(hash);
        self.server.mock(|when, then| {
            when.path("/").body(hash_body.clone());
            then.status(200).json_body(Self::response_body(&hash_result));
        });
        let block_body = Self::request_body("getblock", json!([hash, 1]));
        let block_result = json!({ "tx": Vec::<String>::new() });
        self.server.mock(|when, then| {
            when.path("/").body(block_body.clone());
            then.status(200).json_body(Self::response_body(&block_result));
        });
        self.set_block_count(height + 1);
    }
}
