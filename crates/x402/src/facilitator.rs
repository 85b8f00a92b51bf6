//! Facilitator client: verification and settlement through an ordered list
//! of facilitator endpoints with sequential fallback. The client performs no
//! retries of its own; callers decide whether to try again.

use crate::{Network, PaymentPayload, PaymentRequirements, X402_VERSION};
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};

pub const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Wire dialect spoken by a facilitator endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacilitatorDialect {
    /// Community REST facilitators: bare `POST {base}/verify` and `/settle`.
    Rest,
    /// Provider-hosted facilitators that require API-key auth headers.
    Cdp,
}

#[derive(Debug, Clone)]
pub struct FacilitatorEndpoint {
    pub base_url: String,
    pub dialect: FacilitatorDialect,
    pub api_key_id: Option<String>,
    pub api_key_secret: Option<String>,
}

impl FacilitatorEndpoint {
    pub fn rest(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            dialect: FacilitatorDialect::Rest,
            api_key_id: None,
            api_key_secret: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub transaction_hash: String,
    pub network: Network,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponseBody {
    #[serde(default)]
    is_valid: bool,
    #[serde(default)]
    invalid_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettleResponseBody {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error_reason: Option<String>,
    #[serde(default)]
    transaction: Option<String>,
    #[serde(default)]
    network: Option<Network>,
}

#[derive(Clone)]
pub struct FacilitatorClient {
    endpoints: Vec<FacilitatorEndpoint>,
    http: Client,
}

impl FacilitatorClient {
    pub fn new(endpoints: Vec<FacilitatorEndpoint>) -> Self {
        Self {
            endpoints,
            http: Client::builder().build().expect("reqwest"),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.endpoints.is_empty()
    }

    /// Asks each facilitator in declared order to verify the authorization.
    /// The first valid answer wins; if every endpoint fails, the concatenated
    /// per-endpoint reasons surface in the error.
    pub async fn verify(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<()> {
        let mut reasons = Vec::new();
        for endpoint in &self.endpoints {
            let started = Instant::now();
            match self.verify_one(endpoint, payload, requirements).await {
                Ok(()) => {
                    tracing::debug!(
                        facilitator = %endpoint.base_url,
                        ms = started.elapsed().as_millis() as u64,
                        "facilitator verify ok"
                    );
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(
                        facilitator = %endpoint.base_url,
                        err = %err,
                        "facilitator verify failed; trying next"
                    );
                    reasons.push(format!("{}: {err:#}", endpoint.base_url));
                }
            }
        }
        anyhow::bail!("all facilitators rejected verification: {}", reasons.join("; "))
    }

    /// Settles the transfer through the first facilitator that succeeds.
    pub async fn settle(
        &self,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<Settlement> {
        let mut reasons = Vec::new();
        for endpoint in &self.endpoints {
            let started = Instant::now();
            match self.settle_one(endpoint, payload, requirements).await {
                Ok(settlement) => {
                    tracing::info!(
                        facilitator = %endpoint.base_url,
                        tx = %settlement.transaction_hash,
                        ms = started.elapsed().as_millis() as u64,
                        "facilitator settle ok"
                    );
                    return Ok(settlement);
                }
                Err(err) => {
                    tracing::warn!(
                        facilitator = %endpoint.base_url,
                        err = %err,
                        "facilitator settle failed; trying next"
                    );
                    reasons.push(format!("{}: {err:#}", endpoint.base_url));
                }
            }
        }
        anyhow::bail!("all facilitators failed settlement: {}", reasons.join("; "))
    }

    async fn verify_one(
        &self,
        endpoint: &FacilitatorEndpoint,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<()> {
        let resp = self
            .request(endpoint, "verify", VERIFY_TIMEOUT, payload, requirements)
            .await?;
        let body: VerifyResponseBody = resp.json().await.context("decode verify response")?;
        if !body.is_valid {
            anyhow::bail!(
                "invalid: {}",
                body.invalid_reason.unwrap_or_else(|| "unspecified".into())
            );
        }
        Ok(())
    }

    async fn settle_one(
        &self,
        endpoint: &FacilitatorEndpoint,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<Settlement> {
        let resp = self
            .request(endpoint, "settle", SETTLE_TIMEOUT, payload, requirements)
            .await?;
        let body: SettleResponseBody = resp.json().await.context("decode settle response")?;
        if !body.success {
            anyhow::bail!(
                "settle rejected: {}",
                body.error_reason.unwrap_or_else(|| "unspecified".into())
            );
        }
        let transaction_hash = body
            .transaction
            .filter(|t| !t.trim().is_empty())
            .context("settle response missing transaction hash")?;
        Ok(Settlement {
            transaction_hash,
            network: body.network.unwrap_or(payload.network),
        })
    }

    async fn request(
        &self,
        endpoint: &FacilitatorEndpoint,
        path: &str,
        timeout: Duration,
        payload: &PaymentPayload,
        requirements: &PaymentRequirements,
    ) -> Result<reqwest::Response> {
        // Serializing PaymentPayload stringifies validAfter/validBefore,
        // which both dialects require.
        let body = serde_json::json!({
            "x402Version": X402_VERSION,
            "paymentPayload": payload,
            "paymentRequirements": requirements,
        });
        let url = format!("{}/{path}", endpoint.base_url.trim_end_matches('/'));
        let mut req = self.http.post(&url).timeout(timeout).json(&body);
        if endpoint.dialect == FacilitatorDialect::Cdp {
            let id = endpoint
                .api_key_id
                .as_deref()
                .context("cdp facilitator missing api key id")?;
            let secret = endpoint
                .api_key_secret
                .as_deref()
                .context("cdp facilitator missing api key secret")?;
            let token = STANDARD.encode(format!("{id}:{secret}"));
            req = req.header("Authorization", format!("Basic {token}"));
        }
        let resp = req.send().await.with_context(|| format!("POST {url}"))?;
        if !resp.status().is_success() {
            anyhow::bail!("{url} returned {}", resp.status());
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Authorization, ExactPayload, PaymentPayload};
    use alloy::primitives::{Address, B256};
    use axum::{Json, Router, http::StatusCode, routing::post};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    async fn spawn_facilitator(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}")
    }

    fn sample_payload() -> PaymentPayload {
        PaymentPayload {
            x402_version: 1,
            scheme: "exact".into(),
            network: Network::BaseSepolia,
            payload: ExactPayload {
                signature: "0x00".into(),
                authorization: Authorization {
                    from: Address::repeat_byte(1),
                    to: Address::repeat_byte(2),
                    value: "1000000".into(),
                    valid_after: 0,
                    valid_before: 4_000_000_000,
                    nonce: B256::repeat_byte(3),
                },
            },
        }
    }

    fn sample_requirements() -> PaymentRequirements {
        PaymentRequirements::usdc(
            Network::BaseSepolia,
            Address::repeat_byte(2),
            "1000000".into(),
            "/r".into(),
            "d".into(),
            "application/octet-stream".into(),
        )
    }

    #[tokio::test]
    async fn settle_falls_back_to_the_next_endpoint() {
        let failing = spawn_facilitator(Router::new().route(
            "/settle",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        ))
        .await;
        let working = spawn_facilitator(Router::new().route(
            "/settle",
            post(|| async {
                Json(serde_json::json!({
                    "success": true,
                    "transaction": "0xabc",
                    "network": "base-sepolia"
                }))
            }),
        ))
        .await;

        let client = FacilitatorClient::new(vec![
            FacilitatorEndpoint::rest(failing),
            FacilitatorEndpoint::rest(working),
        ]);
        let settlement = client
            .settle(&sample_payload(), &sample_requirements())
            .await
            .unwrap();
        assert_eq!(settlement.transaction_hash, "0xabc");
        assert_eq!(settlement.network, Network::BaseSepolia);
    }

    #[tokio::test]
    async fn settle_without_transaction_hash_is_a_failure() {
        let no_tx = spawn_facilitator(Router::new().route(
            "/settle",
            post(|| async { Json(serde_json::json!({ "success": true })) }),
        ))
        .await;
        let client = FacilitatorClient::new(vec![FacilitatorEndpoint::rest(no_tx)]);
        let err = client
            .settle(&sample_payload(), &sample_requirements())
            .await
            .unwrap_err()
            .to_string();
        assert!(err.contains("all facilitators failed"), "err: {err}");
    }

    #[tokio::test]
    async fn settle_aggregates_reasons_from_every_endpoint() {
        let a = spawn_facilitator(Router::new().route(
            "/settle",
            post(|| async {
                Json(serde_json::json!({ "success": false, "errorReason": "broke-a" }))
            }),
        ))
        .await;
        let b = spawn_facilitator(Router::new().route(
            "/settle",
            post(|| async {
                Json(serde_json::json!({ "success": false, "errorReason": "broke-b" }))
            }),
        ))
        .await;
        let client = FacilitatorClient::new(vec![
            FacilitatorEndpoint::rest(a),
            FacilitatorEndpoint::rest(b),
        ]);
        let err = format!(
            "{:#}",
            client
                .settle(&sample_payload(), &sample_requirements())
                .await
                .unwrap_err()
        );
        assert!(err.contains("broke-a"), "err: {err}");
        assert!(err.contains("broke-b"), "err: {err}");
    }

    #[tokio::test]
    async fn verify_stops_at_the_first_valid_endpoint() {
        let calls = Arc::new(AtomicU64::new(0));
        let counted = calls.clone();
        let first = spawn_facilitator(Router::new().route(
            "/verify",
            post(move || {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Json(serde_json::json!({ "isValid": true }))
                }
            }),
        ))
        .await;
        let second = spawn_facilitator(Router::new().route(
            "/verify",
            post(|| async { Json(serde_json::json!({ "isValid": true })) }),
        ))
        .await;

        let client = FacilitatorClient::new(vec![
            FacilitatorEndpoint::rest(first),
            FacilitatorEndpoint::rest(second),
        ]);
        client
            .verify(&sample_payload(), &sample_requirements())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn verify_surfaces_invalid_reason() {
        let rejecting = spawn_facilitator(Router::new().route(
            "/verify",
            post(|| async {
                Json(serde_json::json!({ "isValid": false, "invalidReason": "bad nonce" }))
            }),
        ))
        .await;
        let client = FacilitatorClient::new(vec![FacilitatorEndpoint::rest(rejecting)]);
        let err = format!(
            "{:#}",
            client
                .verify(&sample_payload(), &sample_requirements())
                .await
                .unwrap_err()
        );
        assert!(err.contains("bad nonce"), "err: {err}");
    }
}
