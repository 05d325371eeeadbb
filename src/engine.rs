//! `PaymentEngine`: aggregates one [`CoinProcessor`] per enabled chain family,
//! routes invoice creation by [`CoinType`], and fans out invoice state
//! transitions to every subscriber.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use log::{info, warn};
use secrecy::ExposeSecret;
use thiserror::Error;

use crate::config::{CoinConfig, ConfigError, EngineConfig};
use crate::daemon::evm::{EvmChain, EvmDaemonClient};
use crate::daemon::monero::MoneroDaemonClient;
use crate::daemon::utxo::{UtxoChain as DaemonUtxoChain, UtxoDaemonClient};
use crate::daemon::DaemonError;
use crate::derive::evm::EvmDeriver;
use crate::derive::monero::MoneroDeriver;
use crate::derive::utxo::{UtxoChain as DeriveUtxoChain, UtxoDeriver};
use crate::processor::{
    CoinProcessor, HdAddressFactory, MoneroAddressFactory, MoneroKeySource, NewInvoiceRequest,
    NoKeyMaterial, ProcessorError,
};
use crate::pubsub::{Publisher, Subscriber};
use crate::store::memory::MemoryStore;
use crate::store::{InvoiceStore, StoreError};
use crate::types::{tokens_on_chain, CoinType, Invoice, UserId};
use crate::verify::evm::EvmVerifier;
use crate::verify::monero::MoneroVerifier;
use crate::verify::utxo::UtxoVerifier;

/// Grace period a non-terminal invoice's deadline is pushed forward by on
/// restart, so its expiry timer has time to re-arm before the original
/// deadline would otherwise have already passed.
#[must_use]
pub fn startup_grace() -> ChronoDuration {
    ChronoDuration::minutes(10)
}

type MoneroProcessor = CoinProcessor<
    MoneroDaemonClient,
    MoneroVerifier,
    MoneroAddressFactory<MoneroDeriver>,
    MoneroKeySource,
    MemoryStore,
>;
type UtxoProcessor = CoinProcessor<
    UtxoDaemonClient,
    UtxoVerifier,
    HdAddressFactory<UtxoDeriver>,
    NoKeyMaterial,
    MemoryStore,
>;
type EvmProcessor =
    CoinProcessor<EvmDaemonClient, EvmVerifier, HdAddressFactory<EvmDeriver>, NoKeyMaterial, MemoryStore>;

/// One running chain-family processor. A single handle serves every
/// [`CoinType`] hosted on its chain family — a native coin and its tokens
/// share a watcher, pending map, and address pool namespace, distinguished
/// only by the `coin` field each invoice carries.
#[derive(Clone)]
enum ProcessorHandle {
    Monero(Arc<MoneroProcessor>),
    Utxo(Arc<UtxoProcessor>),
    Evm(Arc<EvmProcessor>),
}

impl ProcessorHandle {
    async fn create_invoice(&self, req: NewInvoiceRequest) -> Result<Invoice, ProcessorError> {
        match self {
            ProcessorHandle::Monero(p) => p.create_invoice(req).await,
            ProcessorHandle::Utxo(p) => p.create_invoice(req).await,
            ProcessorHandle::Evm(p) => p.create_invoice(req).await,
        }
    }

    async fn enroll(&self, invoice: Invoice) {
        match self {
            ProcessorHandle::Monero(p) => p.enroll(invoice).await,
            ProcessorHandle::Utxo(p) => p.enroll(invoice).await,
            ProcessorHandle::Evm(p) => p.enroll(invoice).await,
        }
    }

    async fn load(&self) -> Result<(), ProcessorError> {
        match self {
            ProcessorHandle::Monero(p) => p.load().await,
            ProcessorHandle::Utxo(p) => p.load().await,
            ProcessorHandle::Evm(p) => p.load().await,
        }
    }
}

/// Aggregates every enabled coin's [`CoinProcessor`] and exposes the single
/// entry point an RPC surface (out of scope here) would call into.
pub struct PaymentEngine {
    processors: HashMap<CoinType, ProcessorHandle>,
    store: Arc<MemoryStore>,
    invoice_events: Arc<Publisher<Invoice>>,
}

impl PaymentEngine {
    /// Builds an engine from `config`: one chain-family processor per
    /// configured native coin, sharing `store` and a single invoice-events
    /// channel. Does not start polling; call [`PaymentEngine::load`] for
    /// that.
    pub fn new(config: &EngineConfig, store: Arc<MemoryStore>) -> Result<PaymentEngine, EngineError> {
        config.validate();
        let invoice_events = Arc::new(Publisher::new());
        let mut processors = HashMap::new();

        for (&coin, coin_config) in &config.coins {
            let handle = build_handle(coin, coin_config, Arc::clone(&store), Arc::clone(&invoice_events))?;
            let Some(handle) = handle else { continue };
            processors.insert(coin, handle.clone());
            for token in tokens_on_chain(coin.chain()) {
                processors.insert(token, handle.clone());
            }
        }

        Ok(PaymentEngine { processors, store, invoice_events })
    }

    /// Starts every processor's watcher and recovers invoices left
    /// non-terminal by a prior run: pushes their deadlines forward by
    /// [`startup_grace`] and re-enrolls them for observation.
    pub async fn load(&self) -> Result<(), EngineError> {
        let recovered = self.store.shift_expires_at_for_non_confirmed_invoices(startup_grace()).await?;
        for invoice in recovered {
            let Some(handle) = self.processors.get(&invoice.coin) else {
                warn!("recovered invoice {} for unconfigured coin {}", invoice.id, invoice.coin);
                continue;
            };
            handle.enroll(invoice).await;
        }

        let mut started = std::collections::HashSet::new();
        for handle in self.processors.values() {
            let tag = match handle {
                ProcessorHandle::Monero(p) => Arc::as_ptr(p) as usize,
                ProcessorHandle::Utxo(p) => Arc::as_ptr(p) as usize,
                ProcessorHandle::Evm(p) => Arc::as_ptr(p) as usize,
            };
            if !started.insert(tag) {
                continue;
            }
            handle.load().await?;
        }
        Ok(())
    }

    /// Opens a new invoice on the processor registered for `req.coin`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::CoinUnsupported`] if no processor is
    /// registered for `req.coin`, [`EngineError::UserNotFound`] if
    /// `req.user_id` was never registered, or
    /// [`EngineError::AmountBelowZero`] if `req.amount` is not positive.
    pub async fn create_invoice(&self, req: NewInvoiceRequest) -> Result<Invoice, EngineError> {
        if req.amount <= 0.0 {
            return Err(EngineError::AmountBelowZero);
        }
        if !self.store.user_exists(req.user_id).await? {
            return Err(EngineError::UserNotFound(req.user_id));
        }
        let handle = self.processors.get(&req.coin).ok_or(EngineError::CoinUnsupported(req.coin))?;
        let invoice = handle.create_invoice(req).await?;
        info!("engine: created invoice {} for coin {}", invoice.id, invoice.coin);
        Ok(invoice)
    }

    /// Subscribes to every invoice state transition across every coin.
    #[must_use]
    pub fn subscribe_invoice_events(&self) -> Subscriber<Invoice> {
        self.invoice_events.subscribe()
    }
}

fn build_handle(
    coin: CoinType,
    config: &CoinConfig,
    store: Arc<MemoryStore>,
    invoice_events: Arc<Publisher<Invoice>>,
) -> Result<Option<ProcessorHandle>, EngineError> {
    let username = config.login.as_ref().map(|l| l.username.clone());
    let password = config
        .login
        .as_ref()
        .and_then(|l| l.password.as_ref())
        .map(|p| p.expose_secret().clone());

    let handle = match coin {
        CoinType::XMR => {
            let daemon = MoneroDaemonClient::new(config.url.clone(), config.network, username, password);
            let watcher = Arc::new(crate::watcher::ChainWatcher::with_poll_interval(daemon, config.poll_interval));
            let processor = Arc::new(CoinProcessor::new(
                coin,
                config.network,
                watcher,
                MoneroVerifier,
                MoneroAddressFactory(MoneroDeriver),
                MoneroKeySource,
                store,
                invoice_events,
            ));
            Some(ProcessorHandle::Monero(processor))
        }
        CoinType::BTC | CoinType::LTC => {
            let daemon_chain = match coin {
                CoinType::BTC => DaemonUtxoChain::Bitcoin,
                CoinType::LTC => DaemonUtxoChain::Litecoin,
                _ => unreachable!(),
            };
            let derive_chain = match coin {
                CoinType::BTC => DeriveUtxoChain::Bitcoin,
                CoinType::LTC => DeriveUtxoChain::Litecoin,
                _ => unreachable!(),
            };
            let daemon =
                UtxoDaemonClient::new(config.url.clone(), daemon_chain, config.network, username, password);
            let watcher = Arc::new(crate::watcher::ChainWatcher::with_poll_interval(daemon, config.poll_interval));
            let processor = Arc::new(CoinProcessor::new(
                coin,
                config.network,
                watcher,
                UtxoVerifier,
                HdAddressFactory { chain: coin.chain(), deriver: UtxoDeriver::new(derive_chain) },
                NoKeyMaterial,
                store,
                invoice_events,
            ));
            Some(ProcessorHandle::Utxo(processor))
        }
        CoinType::ETH | CoinType::BNB => {
            let chain = match coin {
                CoinType::ETH => EvmChain::Ethereum,
                CoinType::BNB => EvmChain::Bnb,
                _ => unreachable!(),
            };
            let daemon = EvmDaemonClient::new(config.url.clone(), chain, config.network, username, password);
            let watcher = Arc::new(crate::watcher::ChainWatcher::with_poll_interval(daemon, config.poll_interval));
            let processor = Arc::new(CoinProcessor::new(
                coin,
                config.network,
                watcher,
                EvmVerifier,
                HdAddressFactory { chain: coin.chain(), deriver: EvmDeriver },
                NoKeyMaterial,
                store,
                invoice_events,
            ));
            Some(ProcessorHandle::Evm(processor))
        }
        _ => {
            warn!("{coin} is not a native chain coin; ignoring its config entry");
            None
        }
    };
    Ok(handle)
}

/// Failure building or operating a [`PaymentEngine`].
#[derive(Error, Debug)]
pub enum EngineError {
    /// `req.coin` has no registered processor (absent from [`EngineConfig`],
    /// or a coin with no chain family implemented, e.g. `TON`).
    #[error("coin not enabled: {0}")]
    CoinUnsupported(CoinType),
    /// `req.user_id` was never registered.
    #[error("user not found: {0}")]
    UserNotFound(UserId),
    /// `req.amount` was not strictly positive.
    #[error("amount must be greater than zero")]
    AmountBelowZero,
    /// A processor operation failed.
    #[error("processor error: {0}")]
    Processor(#[from] ProcessorError),
    /// The invoice store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// A daemon could not be reached while building or starting a processor.
    #[error("daemon error: {0}")]
    Daemon(#[from] DaemonError),
    /// Configuration failed to load.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoggingConfig;
    use crate::types::NetworkType;

    fn config_for(coin: CoinType, network: NetworkType) -> EngineConfig {
        let mut coins = HashMap::new();
        coins.insert(
            coin,
            CoinConfig {
                url: "http://127.0.0.1:18081".parse().unwrap(),
                network,
                login: None,
                rpc_timeout: std::time::Duration::from_secs(30),
                connection_timeout: std::time::Duration::from_secs(10),
                poll_interval: crate::watcher::SYNC_INTERVAL,
            },
        );
        EngineConfig { coins, logging: LoggingConfig::default() }
    }

    #[tokio::test]
    async fn unconfigured_coin_is_rejected_as_unsupported() {
        let config = config_for(CoinType::XMR, NetworkType::MoneroMainnet);
        let store = Arc::new(MemoryStore::new());
        let engine = PaymentEngine::new(&config, store).unwrap();

        let user_id = UserId(uuid::Uuid::new_v4());
        let req = NewInvoiceRequest {
            user_id,
            coin: CoinType::BTC,
            amount: 1.0,
            timeout: std::time::Duration::from_secs(600),
            confirmations: 1,
        };
        let err = engine.create_invoice(req).await.unwrap_err();
        assert!(matches!(err, EngineError::CoinUnsupported(CoinType::BTC)));
    }

    #[tokio::test]
    async fn unregistered_user_is_rejected() {
        let config = config_for(CoinType::XMR, NetworkType::MoneroMainnet);
        let store = Arc::new(MemoryStore::new());
        let engine = PaymentEngine::new(&config, store).unwrap();

        let req = NewInvoiceRequest {
            user_id: UserId(uuid::Uuid::new_v4()),
            coin: CoinType::XMR,
            amount: 1.0,
            timeout: std::time::Duration::from_secs(600),
            confirmations: 10,
        };
        let err = engine.create_invoice(req).await.unwrap_err();
        assert!(matches!(err, EngineError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn non_positive_amount_is_rejected() {
        let config = config_for(CoinType::XMR, NetworkType::MoneroMainnet);
        let store = Arc::new(MemoryStore::new());
        let user_id = store.create_user(None).await.unwrap();
        let engine = PaymentEngine::new(&config, store).unwrap();

        let req = NewInvoiceRequest {
            user_id,
            coin: CoinType::XMR,
            amount: 0.0,
            timeout: std::time::Duration::from_secs(600),
            confirmations: 10,
        };
        let err = engine.create_invoice(req).await.unwrap_err();
        assert!(matches!(err, EngineError::AmountBelowZero));
    }

    #[tokio::test]
    async fn a_token_routes_to_its_host_chains_processor() {
        let config = config_for(CoinType::ETH, NetworkType::EthereumMainnet);
        let store = Arc::new(MemoryStore::new());
        let engine = PaymentEngine::new(&config, store).unwrap();
        assert!(engine.processors.contains_key(&CoinType::UsdtErc20));
    }
}
