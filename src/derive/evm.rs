//! BIP32 -> secp256k1 -> Keccak-256 derivation for Ethereum and BNB Smart
//! Chain, with EIP-55 checksum casing applied to the rendered address.
//!
//! Reuses `bitcoin::bip32`/`bitcoin::secp256k1` for the curve arithmetic
//! rather than adding a second secp256k1 crate (`k256`) alongside the one the
//! UTXO deriver already pulls in for the same curve.

use bitcoin::bip32::{ChildNumber, Xpub};
use sha3::{Digest, Keccak256};

use super::{AddressDeriver, DeriveError};
use crate::types::HdKeyRecord;

/// Derives Ethereum/BNB Smart Chain deposit addresses from a BIP32 extended
/// public key. EVM addresses carry no network prefix, so every
/// [`NetworkType`](crate::types::NetworkType) EVM variant derives the same
/// address; `network` is accepted only for interface symmetry with the other
/// [`AddressDeriver`] implementations.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvmDeriver;

impl AddressDeriver for EvmDeriver {
    type KeyRecord = HdKeyRecord;

    fn derive(
        &self,
        key_record: &HdKeyRecord,
        _network: crate::types::NetworkType,
        major: i32,
        minor: i32,
    ) -> Result<String, DeriveError> {
        let xpub: Xpub = key_record
            .master_pub_key
            .parse()
            .map_err(|e: bitcoin::bip32::Error| DeriveError::InvalidKeyMaterial(e.to_string()))?;

        let secp = bitcoin::secp256k1::Secp256k1::verification_only();
        let major_child = ChildNumber::from_normal_idx(
            u32::try_from(major).map_err(|_| DeriveError::IndexOutOfRange(major.to_string()))?,
        )
        .map_err(|e| DeriveError::IndexOutOfRange(e.to_string()))?;
        let minor_child = ChildNumber::from_normal_idx(
            u32::try_from(minor).map_err(|_| DeriveError::IndexOutOfRange(minor.to_string()))?,
        )
        .map_err(|e| DeriveError::IndexOutOfRange(e.to_string()))?;
        let child = xpub
            .derive_pub(&secp, &[major_child, minor_child])
            .map_err(|e| DeriveError::Secp256k1(e.to_string()))?;

        let uncompressed = child.public_key.serialize_uncompressed();
        // Ethereum addresses are the last 20 bytes of Keccak-256(pubkey),
        // over the 64-byte X||Y pair (the leading 0x04 tag is dropped).
        let hash = Keccak256::digest(&uncompressed[1..]);
        let address_bytes = &hash[12..];

        Ok(eip55_checksum(address_bytes))
    }
}

/// Applies EIP-55 mixed-case checksum encoding to a 20-byte address.
fn eip55_checksum(address: &[u8]) -> String {
    let hex_lower = hex::encode(address);
    let hash = Keccak256::digest(hex_lower.as_bytes());
    let hash_hex = hex::encode(hash);

    let mut out = String::from("0x");
    for (c, hash_nibble) in hex_lower.chars().zip(hash_hex.chars()) {
        if c.is_ascii_alphabetic() && hash_nibble.to_digit(16).unwrap_or(0) >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}
