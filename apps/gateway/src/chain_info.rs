//! Cached view of the permanent-storage chain height, used to stamp
//! `deadlineHeight` into receipts.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Deserialize)]
struct ChainInfo {
    height: u64,
}

pub struct ChainInfoClient {
    http: Client,
    url: String,
    ttl: Duration,
    height_override: Option<u64>,
    cached: Mutex<Option<(u64, Instant)>>,
}

impl ChainInfoClient {
    pub fn new(url: String, ttl: Duration, height_override: Option<u64>) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .expect("reqwest"),
            url,
            ttl,
            height_override,
            cached: Mutex::new(None),
        }
    }

    pub async fn current_height(&self) -> Result<u64> {
        if let Some(h) = self.height_override {
            return Ok(h);
        }

        let mut cached = self.cached.lock().await;
        if let Some((height, at)) = *cached {
            if at.elapsed() <= self.ttl {
                return Ok(height);
            }
        }

        match self.fetch().await {
            Ok(height) => {
                *cached = Some((height, Instant::now()));
                Ok(height)
            }
            Err(err) => {
                if let Some((stale, _)) = *cached {
                    tracing::warn!(err = %err, "chain info fetch failed; serving stale height");
                    return Ok(stale);
                }
                Err(err.context("chain height unavailable"))
            }
        }
    }

    async fn fetch(&self) -> Result<u64> {
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .context("GET chain_info_url")?;
        if !resp.status().is_success() {
            anyhow::bail!("chain_info_url returned {}", resp.status());
        }
        let info: ChainInfo = resp.json().await.context("decode chain info")?;
        Ok(info.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn override_short_circuits() {
        let client = ChainInfoClient::new(
            "http://127.0.0.1:9/none".into(),
            Duration::from_secs(60),
            Some(1_400_000),
        );
        assert_eq!(client.current_height().await.unwrap(), 1_400_000);
    }

    #[tokio::test]
    async fn unreachable_with_no_cache_errors() {
        let client =
            ChainInfoClient::new("http://127.0.0.1:9/none".into(), Duration::from_secs(60), None);
        let err = format!("{:#}", client.current_height().await.unwrap_err());
        assert!(err.contains("chain height unavailable"), "err: {err}");
    }
}
