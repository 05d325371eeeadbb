//! Monero subaddress derivation: build a `ViewPair` from the stored
//! view/spend keys, then call `monero::subaddress::get_subaddress` for the
//! requested index.

use std::str::FromStr;

use monero::cryptonote::subaddress::{self, Index};
use monero::{Network, PrivateKey, PublicKey, ViewPair};

use super::{AddressDeriver, DeriveError};
use crate::types::{NetworkType, ViewKeyRecord};

/// Derives Monero subaddresses from a user's stored view/spend key pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct MoneroDeriver;

fn network_of(network: NetworkType) -> Result<Network, DeriveError> {
    match network {
        NetworkType::MoneroMainnet => Ok(Network::Mainnet),
        NetworkType::MoneroStagenet => Ok(Network::Stagenet),
        NetworkType::MoneroTestnet => Ok(Network::Testnet),
        other => Err(DeriveError::UnsupportedNetwork(other)),
    }
}

impl AddressDeriver for MoneroDeriver {
    type KeyRecord = ViewKeyRecord;

    fn derive(
        &self,
        key_record: &ViewKeyRecord,
        network: NetworkType,
        major: i32,
        minor: i32,
    ) -> Result<String, DeriveError> {
        let net = network_of(network)?;

        let view = PrivateKey::from_str(&key_record.priv_view_key)
            .map_err(|e| DeriveError::InvalidKeyMaterial(e.to_string()))?;
        let spend = PublicKey::from_str(&key_record.pub_spend_key)
            .map_err(|e| DeriveError::InvalidKeyMaterial(e.to_string()))?;
        let viewpair = ViewPair { view, spend };

        let index = Index {
            major: major.try_into().map_err(|_| DeriveError::IndexOutOfRange(major.to_string()))?,
            minor: minor.try_into().map_err(|_| DeriveError::IndexOutOfRange(minor.to_string()))?,
        };

        let address = subaddress::get_subaddress(&viewpair, index, Some(net));
        Ok(address.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_index_yields_the_primary_address() {
        // (0, 0) is defined to be the account's primary address, not a
        // subaddress, for every Monero account.
        let key_record = ViewKeyRecord {
            id: uuid::Uuid::nil(),
            priv_view_key: "7791696d0cd56ed1920aef6ca56d8a41bac915b68e4c46a589e0956e27a7b77"
                .to_string(),
            pub_spend_key: "3bc4151ef63742afd7e8c7acfe52ba4dbd4d5634e3624e3cafe22a0c3b4a8b7".to_string(),
            last_major_index: 0,
            last_minor_index: 0,
        };
        let deriver = MoneroDeriver;
        let primary = deriver.derive(&key_record, NetworkType::MoneroMainnet, 0, 0);
        let sub = deriver.derive(&key_record, NetworkType::MoneroMainnet, 0, 1);
        assert!(primary.is_ok());
        assert!(sub.is_ok());
        assert_ne!(primary.unwrap(), sub.unwrap());
    }

    #[test]
    fn stagenet_subaddresses_are_deterministic() {
        let key_record = ViewKeyRecord {
            id: uuid::Uuid::nil(),
            priv_view_key: "7791696d0cd56ed1920aef6ca56d8a41bac915b68e4c46a589e0956e27a7b77"
                .to_string(),
            pub_spend_key: "3bc4151ef63742afd7e8c7acfe52ba4dbd4d5634e3624e3cafe22a0c3b4a8b7".to_string(),
            last_major_index: 0,
            last_minor_index: 0,
        };
        let deriver = MoneroDeriver;
        let first = deriver.derive(&key_record, NetworkType::MoneroStagenet, 0, 1).unwrap();
        let second = deriver.derive(&key_record, NetworkType::MoneroStagenet, 0, 1).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn unsupported_network_is_rejected() {
        let key_record = ViewKeyRecord {
            id: uuid::Uuid::nil(),
            priv_view_key: "7791696d0cd56ed1920aef6ca56d8a41bac915b68e4c46a589e0956e27a7b77"
                .to_string(),
            pub_spend_key: "3bc4151ef63742afd7e8c7acfe52ba4dbd4d5634e3624e3cafe22a0c3b4a8b7".to_string(),
            last_major_index: 0,
            last_minor_index: 0,
        };
        let deriver = MoneroDeriver;
        let result = deriver.derive(&key_record, NetworkType::BitcoinMainnet, 0, 0);
        assert!(matches!(result, Err(DeriveError::UnsupportedNetwork(_))));
    }
}
