//! Signed upload receipts: a detached signature over the tuple
//! (domain, version, id, deadline height, timestamp) under the deep-hash
//! construction, returned to uploaders as proof of admission.

use crate::deep_hash::{DeepHashChunk, blob, deep_hash};
use crate::sign::{ServerWallet, eth_owner_to_address};
use crate::{b64url, b64url_decode};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const RECEIPT_DOMAIN: &str = "Bundlr";
pub const RECEIPT_VERSION: &str = "0.2.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub id: String,
    pub timestamp: u64,
    pub version: String,
    pub deadline_height: u64,
    pub data_caches: Vec<String>,
    pub fast_finality_indexes: Vec<String>,
    pub winc: String,
    pub public: String,
    pub signature: String,
}

fn receipt_digest(version: &str, id: &str, deadline_height: u64, timestamp: u64) -> [u8; 48] {
    let deadline = deadline_height.to_string();
    let ts = timestamp.to_string();
    deep_hash(&DeepHashChunk::List(vec![
        blob(RECEIPT_DOMAIN.as_bytes()),
        blob(version.as_bytes()),
        blob(id.as_bytes()),
        blob(deadline.as_bytes()),
        blob(ts.as_bytes()),
    ]))
}

pub struct ReceiptParams {
    pub id: String,
    pub timestamp: u64,
    pub deadline_height: u64,
    pub data_caches: Vec<String>,
    pub fast_finality_indexes: Vec<String>,
    pub winc: String,
}

pub fn sign_receipt(wallet: &ServerWallet, params: ReceiptParams) -> Result<Receipt> {
    let digest = receipt_digest(
        RECEIPT_VERSION,
        &params.id,
        params.deadline_height,
        params.timestamp,
    );
    let signature = wallet.sign_digest(&digest)?;
    Ok(Receipt {
        id: params.id,
        timestamp: params.timestamp,
        version: RECEIPT_VERSION.to_string(),
        deadline_height: params.deadline_height,
        data_caches: params.data_caches,
        fast_finality_indexes: params.fast_finality_indexes,
        winc: params.winc,
        public: b64url(wallet.owner()),
        signature: b64url(&signature),
    })
}

pub fn verify_receipt(receipt: &Receipt) -> Result<()> {
    let owner = b64url_decode(&receipt.public).context("decode receipt public key")?;
    let expected = eth_owner_to_address(&owner)?;
    let signature = b64url_decode(&receipt.signature).context("decode receipt signature")?;
    let sig: [u8; 65] = signature
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("receipt signature must be 65 bytes"))?;
    let sig =
        alloy::primitives::Signature::from_raw_array(&sig).context("parse receipt signature")?;

    let digest = receipt_digest(
        &receipt.version,
        &receipt.id,
        receipt.deadline_height,
        receipt.timestamp,
    );
    let recovered = sig
        .recover_address_from_msg(digest)
        .context("recover receipt signer")?;
    if recovered != expected {
        anyhow::bail!("receipt signer mismatch: recovered {recovered}, expected {expected}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_receipt() -> Receipt {
        let wallet = ServerWallet::from_private_key([0x55; 32]).unwrap();
        sign_receipt(
            &wallet,
            ReceiptParams {
                id: "Jpu-iLk24l1jJgwpCXYYnT1cKB-Yw6bPSuSA_IWnfyY".into(),
                timestamp: 1_700_000_123_456,
                deadline_height: 1_400_200,
                data_caches: vec!["gw.example".into()],
                fast_finality_indexes: vec!["gw.example".into()],
                winc: "1234567890".into(),
            },
        )
        .unwrap()
    }

    #[test]
    fn receipt_roundtrips_signature_verification() {
        let receipt = sample_receipt();
        assert_eq!(receipt.version, RECEIPT_VERSION);
        verify_receipt(&receipt).unwrap();
    }

    #[test]
    fn tampered_fields_break_verification() {
        let mut r = sample_receipt();
        r.deadline_height += 1;
        assert!(verify_receipt(&r).is_err());

        let mut r = sample_receipt();
        r.timestamp += 1;
        assert!(verify_receipt(&r).is_err());

        let mut r = sample_receipt();
        r.id = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".into();
        assert!(verify_receipt(&r).is_err());
    }

    #[test]
    fn receipt_serializes_camel_case() {
        let receipt = sample_receipt();
        let json = serde_json::to_value(&receipt).unwrap();
        assert!(json.get("deadlineHeight").is_some());
        assert!(json.get("dataCaches").is_some());
        assert!(json.get("fastFinalityIndexes").is_some());
        assert!(json.get("deadline_height").is_none());
    }
}
