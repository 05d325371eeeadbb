//! # `paygate-core`: multi-chain payment processing engine
//!
//! This crate is the core of a cryptocurrency payment processor: it assigns
//! deterministically derived deposit addresses, watches multiple blockchains
//! concurrently for qualifying deposits, and drives each invoice through a
//! status lifecycle (`PENDING` -> `PENDING_MEMPOOL` -> `CONFIRMED`/`EXPIRED`)
//! with strict ordering, timeout, and confirmation semantics.
//!
//! ## Supported chains
//!
//! * Monero (subaddress derivation, view-key output scanning)
//! * Bitcoin / Litecoin (BIP32 non-hardened derivation, native SegWit P2WPKH)
//! * Ethereum / BNB Smart Chain (BIP32 -> secp256k1 -> Keccak-256, EIP-55) plus
//!   ERC-20/BEP-20 tokens via a data-driven token registry
//!
//! ## Key advantages
//!
//! * Read-only daemon access; no hot wallet, no spend key ever touches this
//!   crate.
//! * Address pool with exclusive occupancy: a deposit address is never shared
//!   between two non-terminal invoices.
//! * Concurrent, per-chain blockchain watchers with slow-subscriber eviction.
//!
//! ## What this crate does not do
//!
//! Sending transactions, wallet spend operations, fee estimation, fiat
//! conversion, webhook delivery, and multi-tenant authentication are all out
//! of scope; see [`PaymentEngine`] for the surface this crate exposes to a
//! caller that wants to build those on top.

#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![warn(clippy::cargo)]
#![warn(clippy::panic)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod daemon;
pub mod derive;
pub mod engine;
pub mod processor;
pub mod pubsub;
pub mod store;
pub mod types;
pub mod verify;
pub mod watcher;

pub use config::{CoinConfig, EngineConfig};
pub use engine::{EngineError, PaymentEngine};
pub use processor::{CoinProcessor, NewInvoiceRequest, ProcessorError};
pub use pubsub::{Subscriber, SubscriberError};
pub use store::{InvoiceStore, StoreError};
pub use types::{
    CoinType, CryptoAddress, Invoice, InvoiceId, InvoiceStatus, NetworkType, TokenInfo,
};
