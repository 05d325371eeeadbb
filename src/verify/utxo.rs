//! Bitcoin/Litecoin verification: sum every output paying the invoice's
//! address. No extra key material is needed since UTXO addresses are public.

use super::{TxVerifier, VerifyError};
use crate::daemon::utxo::UtxoTx;
use crate::types::Invoice;

/// Sums a UTXO transaction's outputs paying an invoice's deposit address.
#[derive(Debug, Clone, Copy, Default)]
pub struct UtxoVerifier;

impl TxVerifier for UtxoVerifier {
    type Tx = UtxoTx;
    type KeyMaterial = ();

    fn verify(&self, invoice: &Invoice, tx: &UtxoTx, (): &()) -> Result<f64, VerifyError> {
        Ok(tx
            .outputs
            .iter()
            .filter(|output| output.address.as_deref() == Some(invoice.crypto_address.as_str()))
            .map(|output| output.value)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::daemon::utxo::UtxoOutput;
    use crate::types::{CoinType, InvoiceId, InvoiceStatus, UserId};

    fn invoice(address: &str) -> Invoice {
        Invoice {
            id: InvoiceId(Uuid::nil()),
            user_id: UserId(Uuid::nil()),
            coin: CoinType::BTC,
            crypto_address: address.to_string(),
            required_amount: 0.001,
            actual_amount: None,
            confirmations_required: 1,
            status: InvoiceStatus::Pending,
            created_at: Utc::now(),
            expires_at: Utc::now(),
            confirmed_at: None,
            tx_id: None,
        }
    }

    #[test]
    fn sums_only_matching_outputs() {
        let tx = UtxoTx {
            outputs: vec![
                UtxoOutput { address: Some("bc1qtarget".to_string()), value: 0.0006 },
                UtxoOutput { address: Some("bc1qtarget".to_string()), value: 0.0005 },
                UtxoOutput { address: Some("bc1qother".to_string()), value: 1.0 },
            ],
            ..test_tx()
        };
        let verifier = UtxoVerifier;
        let credited = verifier.verify(&invoice("bc1qtarget"), &tx, &()).unwrap();
        assert!((credited - 0.0011).abs() < 1e-12);
    }

    fn test_tx() -> UtxoTx {
        UtxoTx { txid: "deadbeef".to_string(), confirmations: 0, outputs: vec![] }
    }
}
