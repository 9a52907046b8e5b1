//! Descriptor helpers: parsing, private-key splitting, derivation, and
//! the seed-to-descriptor-pair construction used by hot wallets.

use std::str::FromStr;

use bitcoin::{
    bip32::Xpriv,
    secp256k1::{All, Secp256k1},
    Address, Network, ScriptBuf,
};
use miniscript::{
    descriptor::{DescriptorSecretKey, KeyMap},
    Descriptor, DescriptorPublicKey,
};
use spectrum_common::hex;

#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("invalid descriptor: {0}")]
    Parse(String),
    #[error("descriptor cannot be derived at index {0}: {1}")]
    Derive(u32, String),
}

/// A parsed descriptor: the public-only form plus any private keys that
/// were split out of the original string.
pub struct ParsedDescriptor {
    pub public: Descriptor<DescriptorPublicKey>,
    pub keymap: KeyMap,
}

impl ParsedDescriptor {
    /// Parse a descriptor string, splitting private keys out into the
    /// keymap and recomputing the public-only form.
    pub fn parse(
        secp: &Secp256k1<All>,
        descriptor: &str,
    ) -> Result<Self, DescriptorError> {
        let (public, keymap) =
            Descriptor::parse_descriptor(secp, descriptor)
                .map_err(|e| DescriptorError::Parse(e.to_string()))?;
        Ok(Self { public, keymap })
    }

    pub fn has_private_keys(&self) -> bool {
        !self.keymap.is_empty()
    }

    /// The public descriptor string, checksum included.
    pub fn public_string(&self) -> String {
        self.public.to_string()
    }

    /// The script-pubkey at a derivation index.
    pub fn script_pubkey_at(
        &self,
        index: u32,
    ) -> Result<ScriptBuf, DescriptorError> {
        let definite = self
            .public
            .at_derivation_index(index)
            .map_err(|e| DescriptorError::Derive(index, e.to_string()))?;
        Ok(definite.script_pubkey())
    }

    /// The definite descriptor at an index, for PSBT scope enrichment.
    pub fn at_index(
        &self,
        index: u32,
    ) -> Result<
        Descriptor<miniscript::descriptor::DefiniteDescriptorKey>,
        DescriptorError,
    > {
        self.public
            .at_derivation_index(index)
            .map_err(|e| DescriptorError::Derive(index, e.to_string()))
    }

    /// The extended private keys usable for signing.
    pub fn signing_keys(&self) -> Vec<Xpriv> {
        self.keymap
            .values()
            .filter_map(|sk| match sk {
                DescriptorSecretKey::XPrv(xkey) => Some(xkey.xkey),
                _ => None,
            })
            .collect()
    }
}

/// The external/internal `wpkh` descriptor pair for a hot-wallet seed,
/// as descriptor strings carrying the private key.
pub fn seed_descriptor_pair(
    secp: &Secp256k1<All>,
    seed: &[u8; 32],
    network: Network,
) -> Result<(String, String), DescriptorError> {
    let root = Xpriv::new_master(network, seed)
        .map_err(|e| DescriptorError::Parse(e.to_string()))?;
    let fingerprint = root.fingerprint(secp);
    let external = format!("wpkh([{fingerprint}]{root}/0h/0/*)");
    let internal = format!("wpkh([{fingerprint}]{root}/0h/1/*)");
    Ok((external, internal))
}

/// Hex script bytes -> address, for the detected network.
pub fn address_from_spk_hex(
    spk_hex: &str,
    network: Network,
) -> Result<Address, DescriptorError> {
    let bytes = hex::decode(spk_hex)
        .map_err(|e| DescriptorError::Parse(e.to_string()))?;
    let script = ScriptBuf::from_bytes(bytes);
    Address::from_script(&script, network)
        .map_err(|e| DescriptorError::Parse(e.to_string()))
}

/// Address string -> hex script bytes, validating the network.
pub fn spk_hex_from_address(
    address: &str,
    network: Network,
) -> Result<String, DescriptorError> {
    let address = Address::from_str(address)
        .map_err(|e| DescriptorError::Parse(e.to_string()))?
        .require_network(network)
        .map_err(|e| DescriptorError::Parse(e.to_string()))?;
    Ok(hex::encode(address.script_pubkey().as_bytes()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn splits_private_keys_and_derives() {
        let secp = Secp256k1::new();
        let seed = [7u8; 32];
        let (external, _internal) =
            seed_descriptor_pair(&secp, &seed, Network::Regtest).unwrap();

        let parsed = ParsedDescriptor::parse(&secp, &external).unwrap();
        assert!(parsed.has_private_keys());
        assert_eq!(parsed.signing_keys().len(), 1);

        // The public form carries no private material and derives the
        // same scripts.
        let public_str = parsed.public_string();
        assert!(!public_str.contains("prv"));
        let reparsed =
            ParsedDescriptor::parse(&secp, &public_str).unwrap();
        assert!(!reparsed.has_private_keys());
        assert_eq!(
            parsed.script_pubkey_at(0).unwrap(),
            reparsed.script_pubkey_at(0).unwrap(),
        );
        assert_ne!(
            parsed.script_pubkey_at(0).unwrap(),
            parsed.script_pubkey_at(1).unwrap(),
        );
    }

    #[test]
    fn address_spk_roundtrip() {
        let secp = Secp256k1::new();
        let seed = [9u8; 32];
        let (external, _) =
            seed_descriptor_pair(&secp, &seed, Network::Regtest).unwrap();
        let parsed = ParsedDescriptor::parse(&secp, &external).unwrap();
        let spk = parsed.script_pubkey_at(0).unwrap();
        let spk_hex = hex::encode(spk.as_bytes());

        let address =
            address_from_spk_hex(&spk_hex, Network::Regtest).unwrap();
        // bech32 for a wpkh descriptor on regtest
        assert!(address.to_string().starts_with("bcrt1"));
        let roundtrip =
            spk_hex_from_address(&address.to_string(), Network::Regtest)
                .unwrap();
        assert_eq!(roundtrip, spk_hex);

        // Wrong network is rejected.
        assert!(
            spk_hex_from_address(&address.to_string(), Network::Bitcoin)
                .is_err()
        );
    }
}
