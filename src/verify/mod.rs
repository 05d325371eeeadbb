//! Computing how much of an invoice's required amount a transaction credits.
//!
//! `verify` is deliberately synchronous and side-effect free: any I/O needed
//! to gather key material (e.g. a user's Monero view key) happens in
//! [`CoinProcessor`](crate::processor::CoinProcessor) before calling in, so
//! the verification itself stays a pure function of its three inputs.

pub mod evm;
pub mod monero;
pub mod utxo;

use thiserror::Error;

use crate::types::Invoice;

/// Computes the amount of `invoice.required_amount`'s unit that `tx` credits
/// to `invoice`, if any.
pub trait TxVerifier {
    /// The chain-specific transaction type this verifier reads.
    type Tx;
    /// Extra per-invoice material the verifier needs beyond the transaction
    /// itself (a Monero view key; `()` for chains where address comparison
    /// alone is sufficient).
    type KeyMaterial;

    /// Returns the amount credited to `invoice` by `tx`, or `0.0` if `tx`
    /// does not pay this invoice's address at all.
    ///
    /// # Errors
    ///
    /// Returns an error if `tx` or `key_material` cannot be interpreted
    /// (malformed transaction data, corrupt key material).
    fn verify(
        &self,
        invoice: &Invoice,
        tx: &Self::Tx,
        key_material: &Self::KeyMaterial,
    ) -> Result<f64, VerifyError>;
}

/// Failure verifying whether a transaction pays an invoice.
#[derive(Error, Debug)]
pub enum VerifyError {
    /// Key material needed to scan the transaction (a view key, an xpub) was
    /// malformed.
    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),
    /// The transaction body could not be interpreted.
    #[error("malformed transaction data: {0}")]
    MalformedTx(String),
}
