mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Runtime;

use paygate_core::config::LoggingConfig;
use paygate_core::store::memory::MemoryStore;
use paygate_core::types::{CryptoAddress, NetworkType};
use paygate_core::{
    CoinConfig, CoinType, EngineConfig, InvoiceStatus, InvoiceStore, NewInvoiceRequest, PaymentEngine,
};

use common::MockDaemon;

const DEPOSIT_ADDRESS: &str = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4";

fn btc_config(mock: &MockDaemon, poll_interval: Duration) -> EngineConfig {
    let mut coins = HashMap::new();
    coins.insert(
        CoinType::BTC,
        CoinConfig {
            url: mock.url("").parse().expect("mock server url is a valid uri"),
            network: NetworkType::BitcoinRegtest,
            login: None,
            rpc_timeout: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(5),
            poll_interval,
        },
    );
    EngineConfig { coins, logging: LoggingConfig::default() }
}

/// Drives a full invoice lifecycle against a mocked Bitcoin Core daemon: a
/// matching mempool transaction moves the invoice to `PENDING_MEMPOOL`, and a
/// block mined on top of it moves it to `CONFIRMED` once it has accrued
/// enough confirmations.
#[test]
fn invoice_confirms_after_mempool_match_and_a_block() {
    let mock = MockDaemon::start();
    let rt = Runtime::new().expect("failed to create tokio runtime");

    rt.block_on(async {
        let store = Arc::new(MemoryStore::new());
        let user_id = store.create_user(None).await.expect("failed to create user");
        store
            .create_crypto_address(CryptoAddress {
                address: DEPOSIT_ADDRESS.to_string(),
                coin: CoinType::BTC,
                user_id,
                is_occupied: false,
                major: 0,
                minor: 0,
            })
            .await
            .expect("failed to seed deposit address");

        let config = btc_config(&mock, Duration::from_millis(50));
        let engine = PaymentEngine::new(&config, Arc::clone(&store)).expect("failed to build engine");
        engine.load().await.expect("failed to load engine");

        let mut invoice_events = engine.subscribe_invoice_events();

        let invoice = engine
            .create_invoice(NewInvoiceRequest {
                user_id,
                coin: CoinType::BTC,
                amount: 0.01,
                timeout: Duration::from_secs(600),
                confirmations: 1,
            })
            .await
            .expect("failed to create invoice");
        assert_eq!(invoice.status, InvoiceStatus::Pending);
        assert_eq!(invoice.crypto_address, DEPOSIT_ADDRESS);

        // Creation itself is published; drain that update before waiting for
        // the mempool match below.
        let created = invoice_events
            .recv_timeout(Duration::from_secs(5))
            .await
            .expect("timed out waiting for creation event")
            .expect("invoice event channel closed");
        assert_eq!(created.id, invoice.id);

        // A matching transaction shows up in the mempool, unconfirmed.
        mock.set_transaction("txid-1", 0, DEPOSIT_ADDRESS, invoice.required_amount);
        mock.set_mempool(&["txid-1"]);

        let mempool_matched = invoice_events
            .recv_timeout(Duration::from_secs(5))
            .await
            .expect("timed out waiting for mempool match")
            .expect("invoice event channel closed");
        assert_eq!(mempool_matched.id, invoice.id);
        assert_eq!(mempool_matched.status, InvoiceStatus::PendingMempool);
        assert_eq!(mempool_matched.tx_id.as_deref(), Some("txid-1"));

        // The transaction gets mined; its confirmation count now satisfies
        // the invoice's single required confirmation.
        mock.set_transaction("txid-1", 1, DEPOSIT_ADDRESS, invoice.required_amount);
        mock.mine_empty_block(100);

        let confirmed = invoice_events
            .recv_timeout(Duration::from_secs(5))
            .await
            .expect("timed out waiting for confirmation")
            .expect("invoice event channel closed");
        assert_eq!(confirmed.id, invoice.id);
        assert_eq!(confirmed.status, InvoiceStatus::Confirmed);

        let stored = store
            .find_invoice(invoice.id)
            .await
            .expect("failed to read back invoice")
            .expect("invoice missing from store");
        assert_eq!(stored.status, InvoiceStatus::Confirmed);

        let address = store
            .find_crypto_address(DEPOSIT_ADDRESS)
            .await
            .expect("failed to read back address")
            .expect("address missing from store");
        assert!(!address.is_occupied);
    });
}
