//! Pricing oracle: quotes a USDC-atomic cost for a byte count by estimating
//! the on-wire size, pricing it in storage credits (winc), and converting
//! through a cached AR/USD exchange rate. All money math is integer with
//! ceiling rounding; the only float is the oracle's spot rate, snapped to
//! micro-USD once at fetch time.

use crate::config::PricingConfig;
use alloy::primitives::U256;
use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const GIB: u64 = 1024 * 1024 * 1024;
const WINC_PER_AR: u64 = 1_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub winc: U256,
    pub usdc_atomic: U256,
}

#[derive(Debug, Deserialize)]
struct CoingeckoSimplePrice {
    arweave: CoingeckoArweave,
}

#[derive(Debug, Deserialize)]
struct CoingeckoArweave {
    usd: f64,
}

pub struct PricingOracle {
    http: Client,
    cfg: PricingConfig,
    cached_rate: Mutex<Option<(u64, Instant)>>,
}

impl PricingOracle {
    pub fn new(cfg: PricingConfig) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(3))
                .build()
                .expect("reqwest"),
            cfg,
            cached_rate: Mutex::new(None),
        }
    }

    pub fn deposit_usdc(&self) -> U256 {
        U256::from(self.cfg.deposit_usdc)
    }

    /// AR/USD in micro-USD per AR. Cached for the configured TTL; a fetch
    /// failure serves the stale cache, and with no cache at all pricing is
    /// unavailable.
    pub async fn ar_usd_micro(&self) -> Result<u64> {
        if let Some(v) = self.cfg.ar_usd_override {
            if !v.is_finite() || v <= 0.0 {
                anyhow::bail!("invalid AR_USD_OVERRIDE: {v}");
            }
            return Ok((v * 1e6) as u64);
        }

        let mut cached = self.cached_rate.lock().await;
        if let Some((rate, at)) = *cached {
            if at.elapsed() <= self.cfg.ar_usd_ttl {
                return Ok(rate);
            }
        }

        match self.fetch_rate().await {
            Ok(rate) => {
                *cached = Some((rate, Instant::now()));
                Ok(rate)
            }
            Err(err) => {
                if let Some((stale, _)) = *cached {
                    tracing::warn!(err = %err, "exchange rate fetch failed; serving stale cache");
                    return Ok(stale);
                }
                Err(err.context("pricing unavailable: no exchange rate"))
            }
        }
    }

    async fn fetch_rate(&self) -> Result<u64> {
        let resp = self
            .http
            .get(&self.cfg.ar_usd_url)
            .send()
            .await
            .context("GET ar_usd_url")?;
        if !resp.status().is_success() {
            anyhow::bail!("ar_usd_url returned {}", resp.status());
        }
        let body: CoingeckoSimplePrice = resp.json().await.context("decode ar_usd json")?;
        let price = body.arweave.usd;
        if !price.is_finite() || price <= 0.0 {
            anyhow::bail!("invalid ar usd price: {price}");
        }
        Ok((price * 1e6) as u64)
    }

    /// USDC-atomic quote for uploading `byte_count` payload bytes carrying
    /// `tag_count` tags.
    pub async fn quote_usdc_for_bytes(&self, byte_count: u64, tag_count: u64) -> Result<Quote> {
        let rate = self.ar_usd_micro().await?;
        Ok(quote(&self.cfg, rate, byte_count, tag_count))
    }

    /// Inverse conversion for refund accounting: credits bought by a
    /// USDC-atomic amount at the current rate.
    pub async fn winc_for_usdc_atomic(&self, usdc_atomic: U256) -> Result<U256> {
        let rate = self.ar_usd_micro().await?;
        Ok(usdc_atomic * U256::from(WINC_PER_AR) / U256::from(rate.max(1)))
    }
}

/// Estimated final ANS-104 on-wire size: payload plus signature, owner,
/// header and per-tag overhead.
pub fn estimate_wire_size(byte_count: u64, tag_count: u64) -> u64 {
    byte_count + 512 + 512 + 80 + 64 * tag_count
}

fn ceil_div(a: U256, b: U256) -> U256 {
    (a + b - U256::from(1)) / b
}

/// Pure quote math, separated so the curve is testable without HTTP.
pub fn quote(cfg: &PricingConfig, ar_usd_micro: u64, byte_count: u64, tag_count: u64) -> Quote {
    let wire = U256::from(estimate_wire_size(byte_count, tag_count));

    // Bytes -> winc through the byte-price curve, plus the fee margin.
    let base_winc = ceil_div(wire * U256::from(cfg.winc_per_gib), U256::from(GIB));
    let winc = ceil_div(
        base_winc * U256::from(100 + cfg.fee_percent),
        U256::from(100),
    );

    // winc -> micro-USD, which is exactly USDC atomic units. Buffer, then
    // floor at the minimum payment.
    let usd_micro = ceil_div(winc * U256::from(ar_usd_micro), U256::from(WINC_PER_AR));
    let buffered = ceil_div(
        usd_micro * U256::from(100 + cfg.buffer_percent),
        U256::from(100),
    );
    let usdc_atomic = buffered.max(U256::from(cfg.minimum_payment_usdc));

    Quote { winc, usdc_atomic }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cfg() -> PricingConfig {
        PricingConfig {
            winc_per_gib: 400_000_000_000,
            fee_percent: 30,
            buffer_percent: 10,
            minimum_payment_usdc: 1_000,
            deposit_usdc: 10_000,
            ar_usd_override: Some(8.0),
            ar_usd_ttl: Duration::from_secs(300),
            ar_usd_url: String::new(),
        }
    }

    #[test]
    fn wire_size_adds_fixed_and_per_tag_overhead() {
        assert_eq!(estimate_wire_size(0, 0), 1104);
        assert_eq!(estimate_wire_size(1024, 2), 1024 + 1104 + 128);
    }

    #[test]
    fn tiny_uploads_hit_the_minimum_payment() {
        let q = quote(&test_cfg(), 8_000_000, 1024, 1);
        assert_eq!(q.usdc_atomic, U256::from(1_000u64));
        assert!(q.winc > U256::ZERO);
    }

    #[test]
    fn quote_scales_with_byte_count() {
        let cfg = test_cfg();
        let small = quote(&cfg, 8_000_000, 1024 * 1024, 0);
        let large = quote(&cfg, 8_000_000, 100 * 1024 * 1024, 0);
        assert!(large.usdc_atomic > small.usdc_atomic);
        assert!(large.winc > small.winc);
    }

    #[test]
    fn two_megabyte_png_quote_is_deterministic() {
        // The S2 scenario shape: 2_087_856 bytes with one caller tag.
        let cfg = test_cfg();
        let q = quote(&cfg, 8_000_000, 2_087_856, 1);
        // wire = 2_087_856 + 1104 + 64 = 2_089_024
        // base_winc = ceil(2_089_024 * 400e9 / 2^30) = 778_222_085
        // winc = ceil(base_winc * 1.3) = 1_011_688_711
        // usd_micro = ceil(winc * 8e6 / 1e12) = 8_094
        // buffered = ceil(8_094 * 1.1) = 8_904
        assert_eq!(q.usdc_atomic, U256::from(8_904u64));
        assert_eq!(q, quote(&cfg, 8_000_000, 2_087_856, 1));
    }

    #[test]
    fn fee_and_buffer_raise_the_price() {
        let mut cfg = test_cfg();
        let base = quote(&cfg, 8_000_000, 50 * 1024 * 1024, 0);
        cfg.fee_percent = 0;
        cfg.buffer_percent = 0;
        let lean = quote(&cfg, 8_000_000, 50 * 1024 * 1024, 0);
        assert!(base.usdc_atomic > lean.usdc_atomic);
    }

    #[tokio::test]
    async fn override_rate_bypasses_http() {
        let oracle = PricingOracle::new(test_cfg());
        assert_eq!(oracle.ar_usd_micro().await.unwrap(), 8_000_000);
        let q = oracle.quote_usdc_for_bytes(1024, 0).await.unwrap();
        assert_eq!(q.usdc_atomic, U256::from(1_000u64));
    }

    #[tokio::test]
    async fn winc_for_usdc_inverts_at_the_current_rate() {
        let oracle = PricingOracle::new(test_cfg());
        // $1.00 (1_000_000 atomic) at $8/AR buys 0.125 AR of credits.
        let winc = oracle
            .winc_for_usdc_atomic(U256::from(1_000_000u64))
            .await
            .unwrap();
        assert_eq!(winc, U256::from(125_000_000_000u64));
    }

    #[tokio::test]
    async fn missing_rate_with_no_cache_fails() {
        let mut cfg = test_cfg();
        cfg.ar_usd_override = None;
        cfg.ar_usd_url = "http://127.0.0.1:9/none".to_string();
        let oracle = PricingOracle::new(cfg);
        let err = format!("{:#}", oracle.ar_usd_micro().await.unwrap_err());
        assert!(err.contains("pricing unavailable"), "err: {err}");
    }
}
