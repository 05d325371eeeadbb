//! Monero output verification: scope a `SubKeyChecker` to exactly the
//! invoice's own subaddress index and sum the owned outputs
//! `check_outputs_with` finds.

use std::str::FromStr;

use monero::cryptonote::onetime_key::SubKeyChecker;
use monero::util::amount::Amount;
use monero::{PrivateKey, PublicKey, ViewPair};

use super::{TxVerifier, VerifyError};
use crate::daemon::monero::MoneroTx;
use crate::types::{Invoice, ViewKeyRecord};

/// The view key plus the exact `(major, minor)` subaddress index the
/// invoice's deposit address was derived at. The processor looks this index
/// up at the time it assigned the address and carries it alongside the
/// pending entry, since [`Invoice`] itself stores only the rendered address
/// string.
#[derive(Debug, Clone)]
pub struct MoneroKeyMaterial {
    /// The account's view key record.
    pub view_key: ViewKeyRecord,
    /// Major subaddress index of `invoice.crypto_address`.
    pub major: u32,
    /// Minor subaddress index of `invoice.crypto_address`.
    pub minor: u32,
}

/// Scans a transaction's outputs for ones owned by one Monero subaddress.
#[derive(Debug, Clone, Copy, Default)]
pub struct MoneroVerifier;

impl TxVerifier for MoneroVerifier {
    type Tx = MoneroTx;
    type KeyMaterial = MoneroKeyMaterial;

    fn verify(
        &self,
        _invoice: &Invoice,
        tx: &MoneroTx,
        key_material: &MoneroKeyMaterial,
    ) -> Result<f64, VerifyError> {
        let view = PrivateKey::from_str(&key_material.view_key.priv_view_key)
            .map_err(|e| VerifyError::InvalidKeyMaterial(e.to_string()))?;
        let spend = PublicKey::from_str(&key_material.view_key.pub_spend_key)
            .map_err(|e| VerifyError::InvalidKeyMaterial(e.to_string()))?;
        let viewpair = ViewPair { view, spend };

        let checker = SubKeyChecker::new(
            &viewpair,
            key_material.major..key_material.major.saturating_add(1),
            key_material.minor..key_material.minor.saturating_add(1),
        );

        let owned_outputs = tx
            .transaction
            .check_outputs_with(&checker)
            .map_err(|e| VerifyError::MalformedTx(e.to_string()))?;

        let total_piconero: u64 = owned_outputs
            .iter()
            .filter_map(monero::cryptonote::onetime_key::OwnedTxOut::amount)
            .map(Amount::as_pico)
            .sum();

        Ok(total_piconero as f64 / 1e12)
    }
}
