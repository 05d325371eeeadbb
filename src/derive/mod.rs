//! Deterministic derivation of the next deposit address from stored master
//! key material plus a `(major, minor)` index pair.
//!
//! Incrementing and persisting the index pair is the job of whoever holds the
//! key record's store row (see [`crate::processor::CoinProcessor::create_invoice`]);
//! [`AddressDeriver::derive`] is a pure function of its four inputs, matching
//! testable property 4 ("for a fixed (key_record, network, major, minor),
//! `AddressDeriver` yields a fixed address string").

pub mod evm;
pub mod monero;
pub mod utxo;

use thiserror::Error;

use crate::types::NetworkType;

/// Computes the deposit address for one `(major, minor)` index pair from
/// stored master key material.
pub trait AddressDeriver {
    /// The stored key record this deriver reads from (`ViewKeyRecord` for
    /// Monero, `HdKeyRecord` for the BIP32 chains).
    type KeyRecord;

    /// Derives the address for `(major, minor)` under `network`.
    ///
    /// # Errors
    ///
    /// Returns an error if `key_record` is malformed, `network` does not
    /// apply to this chain family, or the index pair is out of the chain's
    /// derivable range.
    fn derive(
        &self,
        key_record: &Self::KeyRecord,
        network: NetworkType,
        major: i32,
        minor: i32,
    ) -> Result<String, DeriveError>;
}

/// Failure deriving a deposit address.
#[derive(Error, Debug)]
pub enum DeriveError {
    /// Stored key material did not parse (corrupt row, or wrong chain
    /// family's key record handed to this deriver).
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
    /// `network` is not meaningful for this chain family.
    #[error("network {0:?} does not apply to this chain family")]
    UnsupportedNetwork(NetworkType),
    /// The requested index is outside BIP32's non-hardened child range.
    #[error("index out of range: {0}")]
    IndexOutOfRange(String),
    /// Elliptic-curve derivation failed.
    #[error("key derivation failed: {0}")]
    Secp256k1(String),
}
