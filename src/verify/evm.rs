//! Ethereum/BNB Smart Chain verification: native value transfers match by
//! `to` address; token transfers are recovered from a `Transfer(address,
//! address,uint256)` log rather than re-deriving contract state.

use super::{TxVerifier, VerifyError};
use crate::daemon::evm::EvmTx;
use crate::types::{token_by_contract, token_info, Invoice};

/// `keccak256("Transfer(address,address,uint256)")`.
const TRANSFER_TOPIC0: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// Resolves a native or ERC-20/BEP-20 EVM transfer against an invoice.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvmVerifier;

impl TxVerifier for EvmVerifier {
    type Tx = EvmTx;
    type KeyMaterial = ();

    fn verify(&self, invoice: &Invoice, tx: &EvmTx, (): &()) -> Result<f64, VerifyError> {
        if invoice.coin.is_native() {
            return verify_native(invoice, tx);
        }
        verify_token(invoice, tx)
    }
}

fn verify_native(invoice: &Invoice, tx: &EvmTx) -> Result<f64, VerifyError> {
    let target = invoice.crypto_address.to_lowercase();
    if tx.to.as_deref() != Some(target.as_str()) {
        return Ok(0.0);
    }
    let wei: u128 = tx
        .value_wei
        .parse()
        .map_err(|_| VerifyError::MalformedTx(format!("invalid wei value {}", tx.value_wei)))?;
    Ok(wei as f64 / 1e18)
}

fn verify_token(invoice: &Invoice, tx: &EvmTx) -> Result<f64, VerifyError> {
    let info = token_info(invoice.coin)
        .ok_or_else(|| VerifyError::MalformedTx(format!("{} is not a registered token", invoice.coin)))?;
    let target = invoice.crypto_address.to_lowercase();

    let mut credited = 0.0;
    for log in &tx.logs {
        if log.topics.first().map(String::as_str) != Some(TRANSFER_TOPIC0) {
            continue;
        }
        let Some((coin, log_info)) = token_by_contract(invoice.coin.chain(), &log.address) else {
            continue;
        };
        if coin != invoice.coin || log_info.contract_address != info.contract_address {
            continue;
        }
        let Some(recipient_topic) = log.topics.get(2) else { continue };
        if !topic_is_address(recipient_topic, &target) {
            continue;
        }
        let amount = parse_u256_decimal_data(&log.data, info.decimals)?;
        credited += amount;
    }
    Ok(credited)
}

/// An indexed `address` topic is a 32-byte word with the address
/// right-aligned in the low 20 bytes.
fn topic_is_address(topic: &str, address_lowercase: &str) -> bool {
    let topic = topic.trim_start_matches("0x");
    if topic.len() < 40 {
        return false;
    }
    format!("0x{}", &topic[topic.len() - 40..]).eq_ignore_ascii_case(address_lowercase)
}

fn parse_u256_decimal_data(data: &str, decimals: u32) -> Result<f64, VerifyError> {
    let hex = data.trim_start_matches("0x");
    let raw = u128::from_str_radix(hex, 16)
        .map_err(|_| VerifyError::MalformedTx(format!("invalid Transfer log data: {data}")))?;
    Ok(raw as f64 / 10f64.powi(decimals as i32))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::daemon::evm::EvmLog;
    use crate::types::{CoinType, InvoiceId, InvoiceStatus, UserId};

    fn base_invoice(coin: CoinType, address: &str, required: f64) -> Invoice {
        Invoice {
            id: InvoiceId(Uuid::nil()),
            user_id: UserId(Uuid::nil()),
            coin,
            crypto_address: address.to_string(),
            required_amount: required,
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
    fn native_value_matches_recipient() {
        let invoice = base_invoice(CoinType::ETH, "0xabc0000000000000000000000000000000000d", 1.0);
        let tx = EvmTx {
            hash: "0x1".to_string(),
            confirmations: 1,
            reverted: false,
            to: Some("0xabc0000000000000000000000000000000000d".to_string()),
            value_wei: "1000000000000000000".to_string(),
            logs: vec![],
        };
        let verifier = EvmVerifier;
        let credited = verifier.verify(&invoice, &tx, &()).unwrap();
        assert!((credited - 1.0).abs() < 1e-12);
    }

    #[test]
    fn erc20_transfer_log_decodes_scaled_amount() {
        let invoice = base_invoice(
            CoinType::UsdtErc20,
            "0x35df6c0eca8ae63d489cd28ecfea811fa8fc5bb1",
            2169.080917,
        );
        let info = token_info(CoinType::UsdtErc20).unwrap();
        let tx = EvmTx {
            hash: "0x7f3cf60bc9b3".to_string(),
            confirmations: 1,
            reverted: false,
            to: Some(info.contract_address.to_lowercase()),
            value_wei: "0".to_string(),
            logs: vec![EvmLog {
                address: info.contract_address.to_lowercase(),
                topics: vec![
                    TRANSFER_TOPIC0.to_string(),
                    "0x0".to_string(),
                    format!("0x000000000000000000000000{}", "35df6c0eca8ae63d489cd28ecfea811fa8fc5bb1"),
                ],
                data: format!("{:#066x}", 2_169_080_917u128),
            }],
        };
        let verifier = EvmVerifier;
        let credited = verifier.verify(&invoice, &tx, &()).unwrap();
        assert!((credited - 2169.080917).abs() < 1e-6);
    }
}
