//! Server-side data-item assembly: wrap raw payload bytes in a signed
//! ANS-104 envelope under the service's long-lived secp256k1 wallet.

use crate::codec::{encode_data_item, encode_tags};
use crate::deep_hash::{DeepHashChunk, blob, deep_hash};
use crate::{SignatureType, Tag, data_item_id, owner_address};
use alloy::primitives::Address;
use alloy::signers::SignerSync;
use alloy::signers::local::PrivateKeySigner;
use anyhow::{Context, Result};
use k256::elliptic_curve::sec1::ToEncodedPoint;

/// The long-lived service key. Signs assembled data items and receipts as
/// signature type ETHEREUM (secp256k1 over an EIP-191 message).
#[derive(Debug, Clone)]
pub struct ServerWallet {
    signer: PrivateKeySigner,
    owner: Vec<u8>,
}

impl ServerWallet {
    pub fn from_private_key(key: [u8; 32]) -> Result<Self> {
        let signer =
            PrivateKeySigner::from_bytes(&key.into()).context("load server wallet key")?;
        let owner = signer
            .credential()
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec();
        Ok(Self { signer, owner })
    }

    /// Uncompressed SEC1 public key (65 bytes), the owner field of signed items.
    pub fn owner(&self) -> &[u8] {
        &self.owner
    }

    pub fn owner_address(&self) -> String {
        owner_address(&self.owner)
    }

    pub fn evm_address(&self) -> Address {
        self.signer.address()
    }

    pub fn sign_digest(&self, digest: &[u8]) -> Result<[u8; 65]> {
        let sig = self
            .signer
            .sign_message_sync(digest)
            .context("sign with server wallet")?;
        Ok(sig.as_bytes())
    }
}

/// Payment context stamped onto server-signed uploads.
#[derive(Debug, Clone, Default)]
pub struct PaymentTags {
    pub payer_address: Option<String>,
    pub tx_hash: Option<String>,
    pub payment_id: Option<String>,
    pub network: Option<String>,
}

/// Tags in canonical order: Content-Type first when present, then caller
/// tags, then the system tags.
pub fn canonical_tags(
    content_type: Option<&str>,
    caller_tags: &[Tag],
    bundler: &str,
    payment: &PaymentTags,
    timestamp_ms: u64,
) -> Vec<Tag> {
    let mut tags = Vec::with_capacity(caller_tags.len() + 8);
    if let Some(ct) = content_type {
        tags.push(Tag::new("Content-Type", ct));
    }
    tags.extend(caller_tags.iter().cloned());
    tags.push(Tag::new("Bundler", bundler));
    tags.push(Tag::new("Upload-Type", "raw-data-x402"));
    if let Some(payer) = &payment.payer_address {
        tags.push(Tag::new("Payer-Address", payer.clone()));
    }
    if let Some(tx) = &payment.tx_hash {
        tags.push(Tag::new("X402-TX-Hash", tx.clone()));
    }
    if let Some(id) = &payment.payment_id {
        tags.push(Tag::new("X402-Payment-ID", id.clone()));
    }
    if let Some(net) = &payment.network {
        tags.push(Tag::new("X402-Network", net.clone()));
    }
    tags.push(Tag::new("Upload-Timestamp", timestamp_ms.to_string()));
    tags
}

#[derive(Debug, Clone)]
pub struct SignedDataItem {
    pub id: String,
    pub owner_address: String,
    pub bytes: Vec<u8>,
    pub payload_data_start: usize,
    pub byte_count: usize,
    pub signature_type: SignatureType,
}

/// Digest that the item signature commits to. Shared between assembly here
/// and signature verification of incoming ETHEREUM-type items.
pub fn signing_digest(
    signature_type: SignatureType,
    owner: &[u8],
    target: Option<&[u8; 32]>,
    anchor: Option<&[u8; 32]>,
    tag_bytes: &[u8],
    payload: &[u8],
) -> [u8; 48] {
    let type_str = signature_type.as_u16().to_string();
    let chunks = vec![
        blob(b"dataitem"),
        blob(b"1"),
        blob(type_str.as_bytes()),
        blob(owner),
        blob(target.map(|t| t.as_slice()).unwrap_or(&[])),
        blob(anchor.map(|a| a.as_slice()).unwrap_or(&[])),
        blob(tag_bytes),
        blob(payload),
    ];
    deep_hash(&DeepHashChunk::List(chunks))
}

pub fn build_signed_item(
    wallet: &ServerWallet,
    payload: &[u8],
    tags: &[Tag],
) -> Result<SignedDataItem> {
    let tag_bytes = encode_tags(tags)?;
    let digest = signing_digest(
        SignatureType::Ethereum,
        wallet.owner(),
        None,
        None,
        &tag_bytes,
        payload,
    );
    let signature = wallet.sign_digest(&digest)?;

    let bytes = encode_data_item(
        SignatureType::Ethereum,
        &signature,
        wallet.owner(),
        None,
        None,
        tags.len() as u64,
        &tag_bytes,
        payload,
    )?;
    let payload_data_start = bytes.len() - payload.len();

    Ok(SignedDataItem {
        id: data_item_id(&signature),
        owner_address: wallet.owner_address(),
        byte_count: bytes.len(),
        bytes,
        payload_data_start,
        signature_type: SignatureType::Ethereum,
    })
}

/// Checks an ETHEREUM-type item signature by recovering the EIP-191 signer
/// and comparing against the address implied by the owner key.
pub fn verify_ethereum_item(
    signature: &[u8],
    owner: &[u8],
    target: Option<&[u8; 32]>,
    anchor: Option<&[u8; 32]>,
    tag_bytes: &[u8],
    payload: &[u8],
) -> Result<()> {
    let digest = signing_digest(
        SignatureType::Ethereum,
        owner,
        target,
        anchor,
        tag_bytes,
        payload,
    );
    let sig: [u8; 65] = signature
        .try_into()
        .map_err(|_| anyhow::anyhow!("ethereum signature must be 65 bytes"))?;
    let sig = alloy::primitives::Signature::from_raw_array(&sig)
        .context("decode ethereum item signature")?;
    let recovered = sig
        .recover_address_from_msg(digest)
        .context("recover item signer")?;
    let expected = eth_owner_to_address(owner)?;
    if recovered != expected {
        anyhow::bail!("item signer mismatch: recovered {recovered}, owner implies {expected}");
    }
    Ok(())
}

/// EVM address implied by a 65-byte uncompressed SEC1 owner key.
pub fn eth_owner_to_address(owner: &[u8]) -> Result<Address> {
    if owner.len() != 65 || owner[0] != 0x04 {
        anyhow::bail!("owner is not an uncompressed secp256k1 key");
    }
    Ok(Address::from_raw_public_key(&owner[1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::parse_data_item;

    fn test_wallet() -> ServerWallet {
        ServerWallet::from_private_key([0x42; 32]).unwrap()
    }

    #[test]
    fn canonical_tags_order_is_content_type_caller_system() {
        let payment = PaymentTags {
            payer_address: Some("0xabc".into()),
            tx_hash: Some("0xdead".into()),
            payment_id: Some("pid".into()),
            network: Some("base".into()),
        };
        let tags = canonical_tags(
            Some("image/png"),
            &[Tag::new("App-Name", "MyApp")],
            "bundler.example",
            &payment,
            1_700_000_000_000,
        );
        let names: Vec<&str> = tags.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Content-Type",
                "App-Name",
                "Bundler",
                "Upload-Type",
                "Payer-Address",
                "X402-TX-Hash",
                "X402-Payment-ID",
                "X402-Network",
                "Upload-Timestamp",
            ]
        );
        assert_eq!(tags.last().unwrap().value, "1700000000000");
    }

    #[test]
    fn canonical_tags_omits_absent_payment_fields() {
        let tags = canonical_tags(None, &[], "b", &PaymentTags::default(), 1);
        let names: Vec<&str> = tags.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Bundler", "Upload-Type", "Upload-Timestamp"]);
    }

    #[test]
    fn signed_item_parses_back_and_verifies() {
        let wallet = test_wallet();
        let payload = b"the payload";
        let tags = canonical_tags(
            Some("text/plain"),
            &[],
            "bundler.example",
            &PaymentTags::default(),
            1_700_000_000_000,
        );
        let item = build_signed_item(&wallet, payload, &tags).unwrap();

        let parsed = parse_data_item(&item.bytes).unwrap();
        assert_eq!(parsed.signature_type, SignatureType::Ethereum);
        assert_eq!(parsed.id(), item.id);
        assert_eq!(parsed.owner_address, wallet.owner_address());
        assert_eq!(parsed.payload_data_start, item.payload_data_start);
        assert_eq!(&item.bytes[parsed.payload_data_start..], payload);
        assert_eq!(parsed.content_type(), Some("text/plain"));

        verify_ethereum_item(
            &parsed.signature,
            &parsed.owner,
            parsed.target.as_ref(),
            parsed.anchor.as_ref(),
            &parsed.tag_bytes,
            payload,
        )
        .unwrap();
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let wallet = test_wallet();
        let tags = canonical_tags(None, &[], "b", &PaymentTags::default(), 1);
        let item = build_signed_item(&wallet, b"original", &tags).unwrap();
        let parsed = parse_data_item(&item.bytes).unwrap();
        assert!(
            verify_ethereum_item(
                &parsed.signature,
                &parsed.owner,
                None,
                None,
                &parsed.tag_bytes,
                b"tampered",
            )
            .is_err()
        );
    }

    #[test]
    fn identical_inputs_land_at_the_same_content_address() {
        let wallet = test_wallet();
        let tags = canonical_tags(None, &[], "b", &PaymentTags::default(), 7);
        let a = build_signed_item(&wallet, b"same-bytes", &tags).unwrap();
        let b = build_signed_item(&wallet, b"same-bytes", &tags).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.bytes, b.bytes);
    }
}
