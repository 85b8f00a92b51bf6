//! x402 payment plumbing: the wire types exchanged through the `X-PAYMENT`
//! header and 402 responses, local EIP-3009 authorization verification, and
//! the facilitator client used to settle transfers on-chain.

pub mod facilitator;
pub mod verify;

use alloy::primitives::{Address, B256};
use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

pub const X402_VERSION: u8 = 1;
pub const SCHEME_EXACT: &str = "exact";

/// Payment networks supported in v1. USDC only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    #[serde(rename = "base")]
    Base,
    #[serde(rename = "base-sepolia")]
    BaseSepolia,
    #[serde(rename = "ethereum-mainnet")]
    EthereumMainnet,
    #[serde(rename = "polygon-mainnet")]
    PolygonMainnet,
}

impl Network {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "base" => Ok(Self::Base),
            "base-sepolia" => Ok(Self::BaseSepolia),
            "ethereum-mainnet" => Ok(Self::EthereumMainnet),
            "polygon-mainnet" => Ok(Self::PolygonMainnet),
            other => anyhow::bail!("unknown payment network: {other}"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::BaseSepolia => "base-sepolia",
            Self::EthereumMainnet => "ethereum-mainnet",
            Self::PolygonMainnet => "polygon-mainnet",
        }
    }

    pub fn chain_id(self) -> u64 {
        match self {
            Self::Base => 8453,
            Self::BaseSepolia => 84532,
            Self::EthereumMainnet => 1,
            Self::PolygonMainnet => 137,
        }
    }

    /// Canonical USDC deployment on the network.
    pub fn usdc_asset(self) -> Address {
        let hex = match self {
            Self::Base => "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913",
            Self::BaseSepolia => "0x036CbD53842c5426634e7929541eC2318f3dCF7e",
            Self::EthereumMainnet => "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48",
            Self::PolygonMainnet => "0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359",
        };
        hex.parse().expect("static usdc address")
    }
}

/// Upload token path segment, `{currency}-{network}`. Currency is fixed to
/// `usdc` in v1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenTag {
    pub network: Network,
}

impl TokenTag {
    pub fn parse(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix("usdc-")
            .ok_or_else(|| anyhow::anyhow!("unsupported token currency: {s}"))?;
        Ok(Self {
            network: Network::parse(rest)?,
        })
    }

    pub fn to_string(self) -> String {
        format!("usdc-{}", self.network.as_str())
    }
}

/// `authorization` object inside the X-PAYMENT payload. `validAfter` and
/// `validBefore` arrive as JSON numbers from browser clients and as strings
/// from SDK clients; both are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub from: Address,
    pub to: Address,
    pub value: String,
    #[serde(deserialize_with = "de_u64_flexible", serialize_with = "ser_u64_string")]
    pub valid_after: u64,
    #[serde(deserialize_with = "de_u64_flexible", serialize_with = "ser_u64_string")]
    pub valid_before: u64,
    pub nonce: B256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExactPayload {
    pub signature: String,
    pub authorization: Authorization,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPayload {
    pub x402_version: u8,
    pub scheme: String,
    pub network: Network,
    pub payload: ExactPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: Network,
    pub max_amount_required: String,
    pub resource: String,
    pub description: String,
    pub mime_type: String,
    pub pay_to: Address,
    pub max_timeout_seconds: u64,
    pub asset: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl PaymentRequirements {
    pub fn usdc(
        network: Network,
        pay_to: Address,
        max_amount_required: String,
        resource: String,
        description: String,
        mime_type: String,
    ) -> Self {
        Self {
            scheme: SCHEME_EXACT.to_string(),
            network,
            max_amount_required,
            resource,
            description,
            mime_type,
            pay_to,
            max_timeout_seconds: 3600,
            asset: network.usdc_asset(),
            extra: Some(serde_json::json!({ "name": "USD Coin", "version": "2" })),
        }
    }
}

/// Body of a 402 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredResponse {
    pub x402_version: u8,
    pub accepts: Vec<PaymentRequirements>,
    pub error: String,
}

/// Success header payload, base64-encoded into `X-Payment-Response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResponseHeader {
    pub payment_id: String,
    pub transaction_hash: String,
    pub network: Network,
    pub mode: String,
}

impl PaymentResponseHeader {
    pub fn encode(&self) -> String {
        STANDARD.encode(serde_json::to_vec(self).expect("serialize payment response"))
    }
}

/// Decodes the base64 `X-PAYMENT` request header.
pub fn decode_payment_header(header: &str) -> Result<PaymentPayload> {
    let raw = STANDARD
        .decode(header.trim())
        .map_err(|e| anyhow::anyhow!("X-PAYMENT is not base64: {e}"))?;
    let payload: PaymentPayload =
        serde_json::from_slice(&raw).map_err(|e| anyhow::anyhow!("X-PAYMENT is not valid JSON: {e}"))?;
    Ok(payload)
}

pub fn encode_payment_header(payload: &PaymentPayload) -> Result<String> {
    Ok(STANDARD.encode(serde_json::to_vec(payload)?))
}

fn de_u64_flexible<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(u64),
        Str(String),
    }
    match NumOrString::deserialize(deserializer)? {
        NumOrString::Num(v) => Ok(v),
        NumOrString::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn ser_u64_string<S>(v: &u64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_tag_parses_known_networks() {
        assert_eq!(
            TokenTag::parse("usdc-base").unwrap().network,
            Network::Base
        );
        assert_eq!(
            TokenTag::parse("usdc-base-sepolia").unwrap().network,
            Network::BaseSepolia
        );
        assert_eq!(
            TokenTag::parse("usdc-polygon-mainnet").unwrap().to_string(),
            "usdc-polygon-mainnet"
        );
        assert!(TokenTag::parse("dai-base").is_err());
        assert!(TokenTag::parse("usdc-mars").is_err());
    }

    #[test]
    fn payment_header_roundtrips_with_numeric_timestamps() {
        let header = STANDARD.encode(
            serde_json::json!({
                "x402Version": 1,
                "scheme": "exact",
                "network": "base",
                "payload": {
                    "signature": "0xdead",
                    "authorization": {
                        "from": "0x0000000000000000000000000000000000000001",
                        "to": "0x0000000000000000000000000000000000000002",
                        "value": "1000000",
                        "validAfter": 0,
                        "validBefore": 4_000_000_000u64,
                        "nonce": "0x0101010101010101010101010101010101010101010101010101010101010101"
                    }
                }
            })
            .to_string(),
        );
        let payload = decode_payment_header(&header).unwrap();
        assert_eq!(payload.x402_version, 1);
        assert_eq!(payload.network, Network::Base);
        assert_eq!(payload.payload.authorization.valid_before, 4_000_000_000);

        // Re-encoded timestamps become strings (the facilitator dialect).
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json["payload"]["authorization"]["validBefore"],
            serde_json::json!("4000000000")
        );
    }

    #[test]
    fn payment_header_accepts_string_timestamps() {
        let header = STANDARD.encode(
            serde_json::json!({
                "x402Version": 1,
                "scheme": "exact",
                "network": "base-sepolia",
                "payload": {
                    "signature": "0x00",
                    "authorization": {
                        "from": "0x0000000000000000000000000000000000000001",
                        "to": "0x0000000000000000000000000000000000000002",
                        "value": "5",
                        "validAfter": "10",
                        "validBefore": "20",
                        "nonce": "0x0000000000000000000000000000000000000000000000000000000000000000"
                    }
                }
            })
            .to_string(),
        );
        let payload = decode_payment_header(&header).unwrap();
        assert_eq!(payload.payload.authorization.valid_after, 10);
        assert_eq!(payload.payload.authorization.valid_before, 20);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_payment_header("!!!").is_err());
        assert!(decode_payment_header(&STANDARD.encode("not json")).is_err());
    }

    #[test]
    fn requirements_document_serializes_the_402_shape() {
        let req = PaymentRequirements::usdc(
            Network::Base,
            "0x0000000000000000000000000000000000000009".parse().unwrap(),
            "2500000".into(),
            "/x402/upload/signed".into(),
            "upload".into(),
            "application/octet-stream".into(),
        );
        let doc = PaymentRequiredResponse {
            x402_version: X402_VERSION,
            accepts: vec![req],
            error: "payment required".into(),
        };
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["x402Version"], 1);
        assert_eq!(json["accepts"][0]["scheme"], "exact");
        assert_eq!(json["accepts"][0]["maxAmountRequired"], "2500000");
        assert_eq!(json["accepts"][0]["maxTimeoutSeconds"], 3600);
        assert_eq!(json["accepts"][0]["extra"]["name"], "USD Coin");
        assert_eq!(json["accepts"][0]["extra"]["version"], "2");
    }
}
