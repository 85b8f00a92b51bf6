//! Chain client for bundle transactions: post, seed chunks, and confirm
//! finality. `rpc` speaks an arweave-node-shaped HTTP API; `mock` keeps
//! everything in memory for tests and local runs.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const CHUNK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    NotFound,
    Pending,
    Confirmed { block_height: u64 },
}

#[derive(Clone)]
pub enum ChainClient {
    Rpc(Arc<RpcChain>),
    Mock(Arc<MockChain>),
}

pub struct RpcChain {
    http: Client,
    base_url: String,
    finality_confirmations: u64,
}

#[derive(Default)]
pub struct MockChain {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    height: u64,
    posted: HashMap<String, u64>,
    seeded: HashSet<String>,
}

#[derive(Debug, Deserialize)]
struct ChainInfoBody {
    height: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct TxStatusBody {
    #[serde(default)]
    block_height: Option<u64>,
    #[serde(default)]
    number_of_confirmations: Option<u64>,
}

impl ChainClient {
    pub fn rpc(base_url: String, finality_confirmations: u64) -> Self {
        Self::Rpc(Arc::new(RpcChain {
            http: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest"),
            base_url,
            finality_confirmations,
        }))
    }

    pub fn mock() -> Self {
        Self::Mock(Arc::new(MockChain::default()))
    }

    pub async fn current_height(&self) -> Result<u64> {
        match self {
            Self::Rpc(rpc) => {
                let url = format!("{}/info", rpc.base_url);
                let resp = rpc.http.get(&url).send().await.context("GET /info")?;
                if !resp.status().is_success() {
                    anyhow::bail!("chain /info returned {}", resp.status());
                }
                let info: ChainInfoBody = resp.json().await.context("decode chain info")?;
                Ok(info.height)
            }
            Self::Mock(mock) => Ok(mock.state.lock().await.height),
        }
    }

    /// Broadcasts the bundle transaction. Re-posting a known tx id succeeds.
    pub async fn post_bundle(&self, bundle_id: &str, payload_byte_count: u64) -> Result<()> {
        match self {
            Self::Rpc(rpc) => {
                let url = format!("{}/tx", rpc.base_url);
                let body = serde_json::json!({
                    "id": bundle_id,
                    "data_size": payload_byte_count.to_string(),
                });
                let resp = rpc
                    .http
                    .post(&url)
                    .json(&body)
                    .send()
                    .await
                    .context("POST /tx")?;
                if !resp.status().is_success() {
                    anyhow::bail!("chain /tx returned {}", resp.status());
                }
                Ok(())
            }
            Self::Mock(mock) => {
                let mut state = mock.state.lock().await;
                state.height += 1;
                let height = state.height;
                state.posted.entry(bundle_id.to_string()).or_insert(height);
                Ok(())
            }
        }
    }

    /// Uploads the bundle payload in chunks.
    pub async fn seed_chunks(&self, bundle_id: &str, payload: &[u8]) -> Result<()> {
        match self {
            Self::Rpc(rpc) => {
                let url = format!("{}/chunk", rpc.base_url);
                let mut offset = 0usize;
                while offset < payload.len() {
                    let end = (offset + CHUNK_SIZE).min(payload.len());
                    let body = serde_json::json!({
                        "data_root": bundle_id,
                        "offset": offset.to_string(),
                        "chunk": ans104::b64url(&payload[offset..end]),
                    });
                    let resp = rpc
                        .http
                        .post(&url)
                        .json(&body)
                        .send()
                        .await
                        .with_context(|| format!("POST /chunk at offset {offset}"))?;
                    if !resp.status().is_success() {
                        anyhow::bail!("chain /chunk returned {} at offset {offset}", resp.status());
                    }
                    offset = end;
                }
                Ok(())
            }
            Self::Mock(mock) => {
                let mut state = mock.state.lock().await;
                if !state.posted.contains_key(bundle_id) {
                    anyhow::bail!("cannot seed unposted bundle {bundle_id}");
                }
                state.seeded.insert(bundle_id.to_string());
                Ok(())
            }
        }
    }

    pub async fn tx_status(&self, bundle_id: &str) -> Result<TxStatus> {
        match self {
            Self::Rpc(rpc) => {
                let url = format!("{}/tx/{bundle_id}/status", rpc.base_url);
                let resp = rpc
                    .http
                    .get(&url)
                    .send()
                    .await
                    .context("GET /tx/{id}/status")?;
                if resp.status().as_u16() == 404 {
                    return Ok(TxStatus::NotFound);
                }
                if resp.status().as_u16() == 202 {
                    return Ok(TxStatus::Pending);
                }
                if !resp.status().is_success() {
                    anyhow::bail!("chain tx status returned {}", resp.status());
                }
                let body: TxStatusBody = resp.json().await.context("decode tx status")?;
                match (body.block_height, body.number_of_confirmations) {
                    (Some(height), Some(confs)) if confs >= rpc.finality_confirmations => {
                        Ok(TxStatus::Confirmed {
                            block_height: height,
                        })
                    }
                    (Some(_), _) => Ok(TxStatus::Pending),
                    _ => Ok(TxStatus::Pending),
                }
            }
            Self::Mock(mock) => {
                let mut state = mock.state.lock().await;
                let Some(posted_at) = state.posted.get(bundle_id).copied() else {
                    return Ok(TxStatus::NotFound);
                };
                if !state.seeded.contains(bundle_id) {
                    return Ok(TxStatus::Pending);
                }
                // Each status poll moves the mock chain forward one block.
                state.height += 1;
                Ok(TxStatus::Confirmed {
                    block_height: posted_at,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_chain_walks_post_seed_confirm() {
        let chain = ChainClient::mock();
        assert_eq!(chain.tx_status("b1").await.unwrap(), TxStatus::NotFound);

        chain.post_bundle("b1", 100).await.unwrap();
        assert_eq!(chain.tx_status("b1").await.unwrap(), TxStatus::Pending);

        chain.seed_chunks("b1", b"payload").await.unwrap();
        let status = chain.tx_status("b1").await.unwrap();
        assert!(matches!(status, TxStatus::Confirmed { .. }));
    }

    #[tokio::test]
    async fn mock_chain_rejects_seeding_unposted_bundles() {
        let chain = ChainClient::mock();
        assert!(chain.seed_chunks("nope", b"x").await.is_err());
    }

    #[tokio::test]
    async fn mock_post_is_idempotent() {
        let chain = ChainClient::mock();
        chain.post_bundle("b1", 1).await.unwrap();
        chain.post_bundle("b1", 1).await.unwrap();
        chain.seed_chunks("b1", b"x").await.unwrap();
        let first = chain.tx_status("b1").await.unwrap();
        let second = chain.tx_status("b1").await.unwrap();
        assert_eq!(first, second);
    }
}
