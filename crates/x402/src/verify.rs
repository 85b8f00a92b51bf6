//! Local verification of an EIP-3009 `TransferWithAuthorization` payment
//! authorization: field checks plus EIP-712 signature recovery.

use crate::{PaymentPayload, PaymentRequirements, SCHEME_EXACT, X402_VERSION};
use alloy::primitives::{Address, FixedBytes, Signature, U256};
use alloy::sol;
use alloy::sol_types::{SolStruct, eip712_domain};

sol! {
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("unsupported x402 version: {0}")]
    VersionMismatch(u8),
    #[error("scheme mismatch: payload {payload}, required {required}")]
    SchemeMismatch { payload: String, required: String },
    #[error("network mismatch: payload {payload}, required {required}")]
    NetworkMismatch { payload: String, required: String },
    #[error("authorized value {value} below required {required}")]
    InsufficientValue { value: String, required: String },
    #[error("recipient mismatch: authorized {authorized}, required {required}")]
    RecipientMismatch {
        authorized: Address,
        required: Address,
    },
    #[error("authorization expires at {valid_before}, too soon for now {now} + timeout {timeout}")]
    ExpiresTooSoon {
        valid_before: u64,
        now: u64,
        timeout: u64,
    },
    #[error("authorization not yet valid: validAfter {valid_after} > now {now}")]
    NotYetValid { valid_after: u64, now: u64 },
    #[error("invalid signature: {0}")]
    BadSignature(String),
    #[error("malformed payment payload: {0}")]
    Malformed(String),
}

/// Runs the full local check suite against a decoded payload. Returns the
/// payer address on success.
pub fn verify_payment(
    payload: &PaymentPayload,
    requirements: &PaymentRequirements,
    now_secs: u64,
) -> Result<Address, VerifyError> {
    if payload.x402_version != X402_VERSION {
        return Err(VerifyError::VersionMismatch(payload.x402_version));
    }
    if payload.scheme != SCHEME_EXACT || payload.scheme != requirements.scheme {
        return Err(VerifyError::SchemeMismatch {
            payload: payload.scheme.clone(),
            required: requirements.scheme.clone(),
        });
    }
    if payload.network != requirements.network {
        return Err(VerifyError::NetworkMismatch {
            payload: payload.network.as_str().to_string(),
            required: requirements.network.as_str().to_string(),
        });
    }

    let auth = &payload.payload.authorization;
    let value = parse_amount(&auth.value)?;
    let required = parse_amount(&requirements.max_amount_required)?;
    if value < required {
        return Err(VerifyError::InsufficientValue {
            value: auth.value.clone(),
            required: requirements.max_amount_required.clone(),
        });
    }

    if auth.to != requirements.pay_to {
        return Err(VerifyError::RecipientMismatch {
            authorized: auth.to,
            required: requirements.pay_to,
        });
    }

    // The window must cover the settlement timeout, not just this instant.
    if auth.valid_before < now_secs.saturating_add(requirements.max_timeout_seconds)
        || auth.valid_before <= now_secs
    {
        return Err(VerifyError::ExpiresTooSoon {
            valid_before: auth.valid_before,
            now: now_secs,
            timeout: requirements.max_timeout_seconds,
        });
    }
    if auth.valid_after > now_secs {
        return Err(VerifyError::NotYetValid {
            valid_after: auth.valid_after,
            now: now_secs,
        });
    }

    let recovered = recover_signer(payload, requirements)?;
    if recovered != auth.from {
        return Err(VerifyError::BadSignature(format!(
            "recovered {recovered}, authorization.from {}",
            auth.from
        )));
    }
    Ok(recovered)
}

/// EIP-712 signing hash for the transfer authorization under the asset's
/// domain. `extra.name`/`extra.version` override the USDC defaults.
pub fn signing_hash(
    payload: &PaymentPayload,
    requirements: &PaymentRequirements,
) -> FixedBytes<32> {
    let auth = &payload.payload.authorization;
    let name = requirements
        .extra
        .as_ref()
        .and_then(|e| e.get("name")?.as_str().map(str::to_string))
        .unwrap_or_else(|| "USD Coin".to_string());
    let version = requirements
        .extra
        .as_ref()
        .and_then(|e| e.get("version")?.as_str().map(str::to_string))
        .unwrap_or_else(|| "2".to_string());
    let domain = eip712_domain! {
        name: name,
        version: version,
        chain_id: payload.network.chain_id(),
        verifying_contract: requirements.asset,
    };
    let transfer = TransferWithAuthorization {
        from: auth.from,
        to: auth.to,
        value: U256::from_str_radix(auth.value.trim(), 10).unwrap_or(U256::ZERO),
        validAfter: U256::from(auth.valid_after),
        validBefore: U256::from(auth.valid_before),
        nonce: auth.nonce,
    };
    transfer.eip712_signing_hash(&domain)
}

fn recover_signer(
    payload: &PaymentPayload,
    requirements: &PaymentRequirements,
) -> Result<Address, VerifyError> {
    let sig_hex = payload.payload.signature.trim();
    let sig_hex = sig_hex.strip_prefix("0x").unwrap_or(sig_hex);
    let raw = hex::decode(sig_hex)
        .map_err(|e| VerifyError::BadSignature(format!("signature is not hex: {e}")))?;
    let raw: [u8; 65] = raw
        .try_into()
        .map_err(|v: Vec<u8>| VerifyError::BadSignature(format!("expected 65 bytes, got {}", v.len())))?;
    let signature = Signature::from_raw_array(&raw)
        .map_err(|e| VerifyError::BadSignature(e.to_string()))?;

    let hash = signing_hash(payload, requirements);
    signature
        .recover_address_from_prehash(&hash)
        .map_err(|e| VerifyError::BadSignature(e.to_string()))
}

fn parse_amount(s: &str) -> Result<U256, VerifyError> {
    U256::from_str_radix(s.trim(), 10)
        .map_err(|e| VerifyError::Malformed(format!("bad decimal amount {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Authorization, ExactPayload, Network};
    use alloy::primitives::B256;
    use alloy::signers::SignerSync;
    use alloy::signers::local::PrivateKeySigner;

    const NOW: u64 = 1_750_000_000;

    fn requirements(pay_to: Address) -> PaymentRequirements {
        PaymentRequirements::usdc(
            Network::BaseSepolia,
            pay_to,
            "1000000".into(),
            "/x402/upload/signed".into(),
            "upload".into(),
            "application/octet-stream".into(),
        )
    }

    fn signed_payload(
        signer: &PrivateKeySigner,
        requirements: &PaymentRequirements,
        value: &str,
        valid_before: u64,
    ) -> PaymentPayload {
        let mut payload = PaymentPayload {
            x402_version: 1,
            scheme: "exact".into(),
            network: requirements.network,
            payload: ExactPayload {
                signature: String::new(),
                authorization: Authorization {
                    from: signer.address(),
                    to: requirements.pay_to,
                    value: value.into(),
                    valid_after: 0,
                    valid_before,
                    nonce: B256::repeat_byte(0x17),
                },
            },
        };
        let hash = signing_hash(&payload, requirements);
        let sig = signer.sign_hash_sync(&hash).unwrap();
        payload.payload.signature = format!("0x{}", hex::encode(sig.as_bytes()));
        payload
    }

    #[test]
    fn valid_payment_recovers_the_payer() {
        let signer = PrivateKeySigner::random();
        let reqs = requirements(Address::repeat_byte(9));
        let payload = signed_payload(&signer, &reqs, "1000000", NOW + 7200);
        let payer = verify_payment(&payload, &reqs, NOW).unwrap();
        assert_eq!(payer, signer.address());
    }

    #[test]
    fn excess_value_is_accepted() {
        let signer = PrivateKeySigner::random();
        let reqs = requirements(Address::repeat_byte(9));
        let payload = signed_payload(&signer, &reqs, "2000000", NOW + 7200);
        assert!(verify_payment(&payload, &reqs, NOW).is_ok());
    }

    #[test]
    fn short_value_is_rejected() {
        let signer = PrivateKeySigner::random();
        let reqs = requirements(Address::repeat_byte(9));
        let payload = signed_payload(&signer, &reqs, "999999", NOW + 7200);
        assert!(matches!(
            verify_payment(&payload, &reqs, NOW),
            Err(VerifyError::InsufficientValue { .. })
        ));
    }

    #[test]
    fn wrong_recipient_is_rejected() {
        let signer = PrivateKeySigner::random();
        let reqs = requirements(Address::repeat_byte(9));
        let mut payload = signed_payload(&signer, &reqs, "1000000", NOW + 7200);
        payload.payload.authorization.to = Address::repeat_byte(8);
        assert!(matches!(
            verify_payment(&payload, &reqs, NOW),
            Err(VerifyError::RecipientMismatch { .. })
        ));
    }

    #[test]
    fn window_shorter_than_timeout_is_rejected() {
        let signer = PrivateKeySigner::random();
        let reqs = requirements(Address::repeat_byte(9));
        // Valid for 10 minutes only; the settle timeout needs an hour.
        let payload = signed_payload(&signer, &reqs, "1000000", NOW + 600);
        assert!(matches!(
            verify_payment(&payload, &reqs, NOW),
            Err(VerifyError::ExpiresTooSoon { .. })
        ));
    }

    #[test]
    fn not_yet_valid_is_rejected() {
        let signer = PrivateKeySigner::random();
        let reqs = requirements(Address::repeat_byte(9));
        let mut payload = signed_payload(&signer, &reqs, "1000000", NOW + 7200);
        payload.payload.authorization.valid_after = NOW + 10;
        // Signature no longer matters; timing is checked first.
        assert!(matches!(
            verify_payment(&payload, &reqs, NOW),
            Err(VerifyError::NotYetValid { .. })
        ));
    }

    #[test]
    fn tampered_authorization_breaks_recovery() {
        let signer = PrivateKeySigner::random();
        let reqs = requirements(Address::repeat_byte(9));
        let mut payload = signed_payload(&signer, &reqs, "1000000", NOW + 7200);
        payload.payload.authorization.nonce = B256::repeat_byte(0x18);
        assert!(matches!(
            verify_payment(&payload, &reqs, NOW),
            Err(VerifyError::BadSignature(_))
        ));
    }

    #[test]
    fn version_and_scheme_mismatches_are_rejected() {
        let signer = PrivateKeySigner::random();
        let reqs = requirements(Address::repeat_byte(9));

        let mut payload = signed_payload(&signer, &reqs, "1000000", NOW + 7200);
        payload.x402_version = 2;
        assert!(matches!(
            verify_payment(&payload, &reqs, NOW),
            Err(VerifyError::VersionMismatch(2))
        ));

        let mut payload = signed_payload(&signer, &reqs, "1000000", NOW + 7200);
        payload.scheme = "upto".into();
        assert!(matches!(
            verify_payment(&payload, &reqs, NOW),
            Err(VerifyError::SchemeMismatch { .. })
        ));
    }

    #[test]
    fn network_mismatch_is_rejected() {
        let signer = PrivateKeySigner::random();
        let reqs = requirements(Address::repeat_byte(9));
        let mut payload = signed_payload(&signer, &reqs, "1000000", NOW + 7200);
        payload.network = Network::Base;
        assert!(matches!(
            verify_payment(&payload, &reqs, NOW),
            Err(VerifyError::NetworkMismatch { .. })
        ));
    }
}
