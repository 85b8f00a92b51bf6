//! ANS-104 data items: wire codec, server-side assembly and signing, and the
//! detached upload receipts handed back to clients.

pub mod bundle;
pub mod codec;
pub mod deep_hash;
pub mod receipt;
pub mod sign;

use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

/// Signature schemes a data item may carry. The discriminant is the 16-bit
/// little-endian prefix of the serialized item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    Arweave = 1,
    Ed25519 = 2,
    Ethereum = 3,
    Solana = 4,
    InjectedAptos = 5,
    MultiAptos = 6,
    TypedEthereum = 7,
    Kyve = 101,
}

impl SignatureType {
    pub fn from_u16(v: u16) -> Result<Self> {
        match v {
            1 => Ok(Self::Arweave),
            2 => Ok(Self::Ed25519),
            3 => Ok(Self::Ethereum),
            4 => Ok(Self::Solana),
            5 => Ok(Self::InjectedAptos),
            6 => Ok(Self::MultiAptos),
            7 => Ok(Self::TypedEthereum),
            101 => Ok(Self::Kyve),
            other => anyhow::bail!("unknown signature type: {other}"),
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn signature_len(self) -> usize {
        match self {
            Self::Arweave => 512,
            Self::Ed25519 | Self::Solana | Self::InjectedAptos => 64,
            Self::Ethereum | Self::Kyve => 65,
            Self::MultiAptos => 64 * 32 + 4,
            Self::TypedEthereum => 65,
        }
    }

    pub fn owner_len(self) -> usize {
        match self {
            Self::Arweave => 512,
            Self::Ed25519 | Self::Solana | Self::InjectedAptos => 32,
            Self::Ethereum | Self::Kyve => 65,
            Self::MultiAptos => 32 * 32 + 1,
            Self::TypedEthereum => 42,
        }
    }
}

/// A name/value pair attached to a data item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub value: String,
}

impl Tag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

pub fn b64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn b64url_decode(s: &str) -> Result<Vec<u8>> {
    Ok(URL_SAFE_NO_PAD.decode(s.trim())?)
}

/// Content address of a signed item: base64url(SHA-256(signature)), 43 chars.
pub fn data_item_id(signature: &[u8]) -> String {
    b64url(&Sha256::digest(signature))
}

/// Native address form for an owner key of any signature scheme:
/// base64url(SHA-256(owner_bytes)).
pub fn owner_address(owner: &[u8]) -> String {
    b64url(&Sha256::digest(owner))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_type_roundtrips_known_discriminants() {
        for v in [1u16, 2, 3, 4, 5, 6, 7, 101] {
            let ty = SignatureType::from_u16(v).expect("known type");
            assert_eq!(ty.as_u16(), v);
        }
        assert!(SignatureType::from_u16(0).is_err());
        assert!(SignatureType::from_u16(8).is_err());
        assert!(SignatureType::from_u16(100).is_err());
    }

    #[test]
    fn data_item_id_is_43_chars_base64url() {
        let id = data_item_id(&[7u8; 65]);
        assert_eq!(id.len(), 43);
        assert!(!id.contains('='));
        assert!(!id.contains('+'));
        assert!(!id.contains('/'));
    }

    #[test]
    fn owner_address_is_stable() {
        let a = owner_address(b"owner-key");
        let b = owner_address(b"owner-key");
        assert_eq!(a, b);
        assert_ne!(a, owner_address(b"other-key"));
    }
}
