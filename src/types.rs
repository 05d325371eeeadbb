//! Core data model: coins, networks, users, keys, addresses and invoices.
//!
//! These types mirror the relational rows an [`InvoiceStore`](crate::store::InvoiceStore)
//! is expected to persist, without committing to any particular schema.

use std::fmt;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Closed set of assets this engine can watch for.
///
/// Native chain coins (`XMR`, `BTC`, `LTC`, `ETH`, `BNB`) each have a full
/// [`DaemonClient`](crate::daemon::DaemonClient)/[`AddressDeriver`](crate::derive::AddressDeriver)/
/// [`TxVerifier`](crate::verify::TxVerifier) triple. Token variants are
/// hosted on a chain and resolved through [`token_info`] rather than carrying
/// their contract address/decimals as enum data, so that new tokens are a
/// registry addition rather than a new variant (see `DESIGN.md`).
///
/// `TON` is part of the wire-stable enum but has no chain family assigned to
/// it in this core; [`PaymentEngine::create_invoice`](crate::engine::PaymentEngine::create_invoice)
/// rejects it with `CoinUnsupported`, the same as any coin absent from
/// [`EngineConfig`](crate::config::EngineConfig).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString)]
#[derive(Serialize, Deserialize)]
pub enum CoinType {
    /// Monero.
    XMR,
    /// Bitcoin.
    BTC,
    /// Litecoin.
    LTC,
    /// Ether.
    ETH,
    /// BNB (BNB Smart Chain native coin).
    BNB,
    /// The Open Network. Wire-stable, unsupported by this core.
    TON,
    /// Tether on Ethereum (ERC-20).
    #[strum(serialize = "USDT_ERC20")]
    UsdtErc20,
    /// USD Coin on Ethereum (ERC-20).
    #[strum(serialize = "USDC_ERC20")]
    UsdcErc20,
    /// Dai on Ethereum (ERC-20).
    #[strum(serialize = "DAI_ERC20")]
    DaiErc20,
    /// Wrapped Bitcoin on Ethereum (ERC-20).
    #[strum(serialize = "WBTC_ERC20")]
    WbtcErc20,
    /// Binance-Peg BSC-USD on BNB Smart Chain (BEP-20).
    #[strum(serialize = "BSCUSD_BEP20")]
    BscUsdBep20,
    /// USD Coin on BNB Smart Chain (BEP-20).
    #[strum(serialize = "USDC_BEP20")]
    UsdcBep20,
    /// Dai on BNB Smart Chain (BEP-20).
    #[strum(serialize = "DAI_BEP20")]
    DaiBep20,
    /// Binance-Peg BTCB on BNB Smart Chain (BEP-20).
    #[strum(serialize = "BTCB_BEP20")]
    BtcbBep20,
}

impl CoinType {
    /// The native chain family this coin settles on.
    #[must_use]
    pub fn chain(self) -> ChainFamily {
        match self {
            CoinType::XMR => ChainFamily::Monero,
            CoinType::BTC => ChainFamily::Bitcoin,
            CoinType::LTC => ChainFamily::Litecoin,
            CoinType::ETH
            | CoinType::UsdtErc20
            | CoinType::UsdcErc20
            | CoinType::DaiErc20
            | CoinType::WbtcErc20 => ChainFamily::Ethereum,
            CoinType::BNB
            | CoinType::BscUsdBep20
            | CoinType::UsdcBep20
            | CoinType::DaiBep20
            | CoinType::BtcbBep20 => ChainFamily::Bnb,
            CoinType::TON => ChainFamily::Unsupported,
        }
    }

    /// Whether this coin is the native asset of its chain, as opposed to a
    /// token hosted on it.
    #[must_use]
    pub fn is_native(self) -> bool {
        matches!(
            self,
            CoinType::XMR | CoinType::BTC | CoinType::LTC | CoinType::ETH | CoinType::BNB
        )
    }
}

/// Chain family a [`CoinType`] settles on. Distinct from [`CoinType`] because
/// several tokens share a chain family with each other and with their host
/// coin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainFamily {
    /// Monero.
    Monero,
    /// Bitcoin.
    Bitcoin,
    /// Litecoin.
    Litecoin,
    /// Ethereum (mainnet or a testnet).
    Ethereum,
    /// BNB Smart Chain (mainnet or testnet).
    Bnb,
    /// No chain family is implemented for this coin.
    Unsupported,
}

/// `(host_chain, contract_address, decimals)` for a token [`CoinType`].
#[derive(Debug, Clone, Copy)]
pub struct TokenInfo {
    /// Chain the token contract lives on.
    pub chain: ChainFamily,
    /// Checksummed contract address, lowercase-compared by callers.
    pub contract_address: &'static str,
    /// Number of decimals the token's `Transfer` amounts are scaled by.
    pub decimals: u32,
}

/// Data-driven token registry resolving Open Question 2: rather than every
/// token carrying its contract address and decimals as enum payload, the
/// registry is the single source of truth and new tokens are a table entry.
static TOKEN_REGISTRY: Lazy<Vec<(CoinType, TokenInfo)>> = Lazy::new(|| {
    vec![
        (
            CoinType::UsdtErc20,
            TokenInfo {
                chain: ChainFamily::Ethereum,
                contract_address: "0xdAC17F958D2ee523a2206206994597C13D831ec7",
                decimals: 6,
            },
        ),
        (
            CoinType::UsdcErc20,
            TokenInfo {
                chain: ChainFamily::Ethereum,
                contract_address: "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
                decimals: 6,
            },
        ),
        (
            CoinType::DaiErc20,
            TokenInfo {
                chain: ChainFamily::Ethereum,
                contract_address: "0x6B175474E89094C44Da98b954EedeAC495271d0F",
                decimals: 18,
            },
        ),
        (
            CoinType::WbtcErc20,
            TokenInfo {
                chain: ChainFamily::Ethereum,
                contract_address: "0x2260FAC5E5542a773Aa44fBCfeDf7C193bc2C599",
                decimals: 8,
            },
        ),
        (
            CoinType::BscUsdBep20,
            TokenInfo {
                chain: ChainFamily::Bnb,
                contract_address: "0x55d398326f99059fF775485246999027B3197955",
                decimals: 18,
            },
        ),
        (
            CoinType::UsdcBep20,
            TokenInfo {
                chain: ChainFamily::Bnb,
                contract_address: "0x8AC76a51cc950d9822D68b83fE1Ad97B32Cd580d",
                decimals: 18,
            },
        ),
        (
            CoinType::DaiBep20,
            TokenInfo {
                chain: ChainFamily::Bnb,
                contract_address: "0x1AF3F329e8BE154074D8769D1FFa4eE058B1DBc3",
                decimals: 18,
            },
        ),
        (
            CoinType::BtcbBep20,
            TokenInfo {
                chain: ChainFamily::Bnb,
                contract_address: "0x7130d2A12B9BCbFAe4f2634d864A1Ee1Ce3Ead9c",
                decimals: 18,
            },
        ),
    ]
});

/// Looks up a token's chain/contract/decimals triple. Returns `None` for
/// native coins and for coins with no registry entry (`TON`).
#[must_use]
pub fn token_info(coin: CoinType) -> Option<TokenInfo> {
    TOKEN_REGISTRY
        .iter()
        .find(|(candidate, _)| *candidate == coin)
        .map(|(_, info)| *info)
}

/// Every token `CoinType` hosted on `chain`, in registry order. Used to route
/// a token to the same running processor as its host chain's native coin.
#[must_use]
pub fn tokens_on_chain(chain: ChainFamily) -> Vec<CoinType> {
    TOKEN_REGISTRY.iter().filter(|(_, info)| info.chain == chain).map(|(coin, _)| *coin).collect()
}

/// Looks up which token (if any) on `chain` is hosted at `contract_address`.
/// Comparison is case-insensitive, since EIP-55 checksum casing is a display
/// convention rather than a semantic part of the address.
#[must_use]
pub fn token_by_contract(chain: ChainFamily, contract_address: &str) -> Option<(CoinType, TokenInfo)> {
    TOKEN_REGISTRY
        .iter()
        .find(|(_, info)| info.chain == chain && info.contract_address.eq_ignore_ascii_case(contract_address))
        .copied()
}

/// Per-chain network selector. Not every variant is meaningful for every
/// chain; [`AddressDeriver`](crate::derive::AddressDeriver) implementations
/// reject combinations that do not apply to their chain family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkType {
    /// Monero mainnet.
    MoneroMainnet,
    /// Monero stagenet.
    MoneroStagenet,
    /// Monero testnet.
    MoneroTestnet,
    /// Bitcoin mainnet.
    BitcoinMainnet,
    /// Bitcoin testnet3.
    BitcoinTestnet,
    /// Bitcoin signet.
    BitcoinSignet,
    /// Bitcoin regtest.
    BitcoinRegtest,
    /// Litecoin mainnet.
    LitecoinMainnet,
    /// Litecoin testnet.
    LitecoinTestnet,
    /// Litecoin regtest.
    LitecoinRegtest,
    /// Ethereum mainnet (`net_version` 1).
    EthereumMainnet,
    /// Ethereum Goerli testnet (`net_version` 5).
    EthereumGoerli,
    /// Ethereum Sepolia testnet (`net_version` 11155111).
    EthereumSepolia,
    /// BNB Smart Chain mainnet (`net_version` 56).
    BnbMainnet,
    /// BNB Smart Chain testnet (`net_version` 97).
    BnbTestnet,
    /// Any `net_version` not recognized above, for EVM chains run privately.
    EthereumPrivate,
}

/// Identity anchor for owned crypto data. Never destroyed once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monero view-key material sufficient to derive and scan subaddresses for
/// one user's account, plus the account's derivation cursor.
#[derive(Debug, Clone)]
pub struct ViewKeyRecord {
    /// Opaque record id.
    pub id: Uuid,
    /// Private view key, hex-encoded.
    pub priv_view_key: String,
    /// Public spend key, hex-encoded.
    pub pub_spend_key: String,
    /// Last major subaddress index handed out.
    pub last_major_index: i32,
    /// Last minor subaddress index handed out.
    pub last_minor_index: i32,
}

/// BIP32 extended public key material for a UTXO or account-based chain,
/// plus its derivation cursor. Shared shape for BTC, LTC, ETH, and BNB.
#[derive(Debug, Clone)]
pub struct HdKeyRecord {
    /// Opaque record id.
    pub id: Uuid,
    /// Extended public key, base58check-encoded (e.g. `xpub...`/`tpub...`).
    pub master_pub_key: String,
    /// Last major child index handed out.
    pub last_major_index: i32,
    /// Last minor child index handed out.
    pub last_minor_index: i32,
}

/// Applies the shared index-increment rule from the derivation contract:
/// minor increments first; the post-increment sign test on minor detects the
/// `i32::MAX -> i32::MIN` wrap and carries into major.
#[must_use]
pub fn increment_indices(major: i32, minor: i32) -> (i32, i32) {
    let next_minor = minor.wrapping_add(1);
    if next_minor <= 0 {
        (major.wrapping_add(1), 0)
    } else {
        (major, next_minor)
    }
}

/// A derived deposit address, exclusively owned by at most one non-terminal
/// invoice at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoAddress {
    /// The address string in chain-native encoding.
    pub address: String,
    /// Which coin this address was derived for.
    pub coin: CoinType,
    /// Owning user.
    pub user_id: UserId,
    /// Whether a non-terminal invoice currently holds this address.
    pub is_occupied: bool,
    /// Major derivation index this address was derived at.
    pub major: i32,
    /// Minor derivation index this address was derived at.
    pub minor: i32,
}

/// Lifecycle status of an [`Invoice`]. `CONFIRMED` and `EXPIRED` are
/// absorbing: once reached, no further transition is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvoiceStatus {
    /// Created, not yet observed on-chain.
    Pending,
    /// A qualifying transaction has been seen in the mempool or a block, but
    /// has not yet accrued the required confirmations.
    PendingMempool,
    /// Accrued the required confirmations. Terminal.
    Confirmed,
    /// Expired before confirming, or the observed transaction was rejected
    /// (double-spent or vanished). Terminal.
    Expired,
}

impl InvoiceStatus {
    /// Whether this status admits no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, InvoiceStatus::Confirmed | InvoiceStatus::Expired)
    }
}

/// Uniquely identifies an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvoiceId(pub Uuid);

impl fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A payment request tracked through its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    /// Unique id.
    pub id: InvoiceId,
    /// Owning user.
    pub user_id: UserId,
    /// Requested coin.
    pub coin: CoinType,
    /// Deposit address assigned to this invoice.
    pub crypto_address: String,
    /// Amount required, in the coin's display unit (XMR, BTC, ETH, ...).
    pub required_amount: f64,
    /// Amount observed credited so far, once any transfer has matched.
    pub actual_amount: Option<f64>,
    /// Confirmations required before the invoice is considered paid.
    pub confirmations_required: i16,
    /// Current lifecycle status.
    pub status: InvoiceStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiration deadline; after this, a non-terminal invoice expires.
    pub expires_at: DateTime<Utc>,
    /// Time the invoice reached `CONFIRMED`, if it has.
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Transaction id credited to this invoice, once one has been observed.
    pub tx_id: Option<String>,
}

impl Invoice {
    /// Returns `true` if `status == CONFIRMED`.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.status == InvoiceStatus::Confirmed
    }

    /// Returns `true` if `status == EXPIRED`.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.status == InvoiceStatus::Expired
    }

    /// Returns `true` if the invoice has reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Per-coin sync cursor, persisted so a restart resumes scanning rather than
/// re-synchronizing from the chain's genesis.
#[derive(Debug, Clone, Copy)]
pub struct CryptoCache {
    /// Coin this cursor tracks.
    pub coin: CoinType,
    /// Last block height this process fully processed for `coin`.
    pub last_synced_block_height: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0, 0 => (0, 1))]
    #[test_case(0, i32::MAX => (1, 0))]
    #[test_case(5, 9 => (5, 10))]
    #[test_case(i32::MAX, i32::MAX => (i32::MIN, 0))]
    fn index_increment_follows_minor_first_rule(major: i32, minor: i32) -> (i32, i32) {
        increment_indices(major, minor)
    }

    #[test]
    fn token_registry_resolves_both_directions() {
        let info = token_info(CoinType::UsdtErc20).expect("usdt erc20 registered");
        assert_eq!(info.chain, ChainFamily::Ethereum);
        let (coin, _) = token_by_contract(ChainFamily::Ethereum, info.contract_address)
            .expect("contract address resolves back to a coin");
        assert_eq!(coin, CoinType::UsdtErc20);
    }

    #[test]
    fn native_coins_have_no_token_info() {
        assert!(token_info(CoinType::BTC).is_none());
        assert!(token_info(CoinType::TON).is_none());
    }

    #[test]
    fn tokens_on_chain_only_returns_that_chains_tokens() {
        let eth_tokens = tokens_on_chain(ChainFamily::Ethereum);
        assert!(eth_tokens.contains(&CoinType::UsdtErc20));
        assert!(!eth_tokens.contains(&CoinType::BTC));
        assert!(tokens_on_chain(ChainFamily::Monero).is_empty());
    }
}
