use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;
use x402::facilitator::{FacilitatorDialect, FacilitatorEndpoint};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub payment: PaymentConfig,
    pub pricing: PricingConfig,
    pub upload: UploadConfig,
    pub multipart: MultipartConfig,
    pub db_url: String,
    pub db_max_connections: u32,
    pub object_store: ObjectStoreConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Host name advertised in receipts (dataCaches/fastFinalityIndexes) and
    /// in the Bundler tag of server-signed items.
    pub gateway_fqdn: String,
    pub chain_info_url: String,
    pub chain_height_override: Option<u64>,
    pub chain_height_ttl: Duration,
    pub deadline_height_buffer: u64,
}

#[derive(Debug, Clone)]
pub struct PaymentConfig {
    /// Address payments must be authorized to (`payTo`).
    pub pay_to: alloy::primitives::Address,
    pub facilitators: Vec<FacilitatorEndpoint>,
}

#[derive(Debug, Clone)]
pub struct PricingConfig {
    pub winc_per_gib: u64,
    pub fee_percent: u64,
    pub buffer_percent: u64,
    pub minimum_payment_usdc: u64,
    pub deposit_usdc: u64,
    pub ar_usd_override: Option<f64>,
    pub ar_usd_ttl: Duration,
    pub ar_usd_url: String,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub server_private_key: [u8; 32],
    pub free_uploads_enabled: bool,
    pub free_upload_limit_bytes: u64,
    pub whitelist_owners: Vec<String>,
    pub allow_listed_signature_types: Vec<u16>,
    pub allow_raw_uploads: bool,
    pub max_upload_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct MultipartConfig {
    pub default_chunk_size: i64,
    pub ttl_hours: u64,
    pub max_per_address: i64,
    /// Percent over the declared size before an upload counts as fraud.
    pub fraud_tolerance_percent: u64,
    /// Percent over the required cost before the excess is refunded.
    pub refund_threshold_percent: u64,
}

#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    pub mode: ObjectStoreMode,
    pub root: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStoreMode {
    Fs,
    Mem,
}

#[derive(Debug, Clone, Deserialize)]
struct FacilitatorEntry {
    url: String,
    #[serde(default)]
    dialect: String,
    #[serde(default)]
    api_key_id: Option<String>,
    #[serde(default)]
    api_key_secret: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Env {
    db_url: String,

    db_max_connections: u32,

    listen_addr: String,

    gateway_fqdn: String,

    chain_info_url: String,

    #[serde(default)]
    chain_height_override: Option<u64>,

    chain_height_ttl_secs: u64,

    deadline_height_buffer: u64,

    pay_to_address: String,

    #[serde(default)]
    x402_facilitators_json: String,

    winc_per_gib: u64,

    price_fee_percent: u64,

    price_buffer_percent: u64,

    minimum_payment_usdc: u64,

    deposit_usdc: u64,

    #[serde(default)]
    ar_usd_override: Option<f64>,

    ar_usd_ttl_secs: u64,

    ar_usd_url: String,

    bundler_private_key_hex: String,

    free_uploads_enabled: bool,

    free_upload_limit_bytes: u64,

    #[serde(default)]
    whitelist_owners_csv: String,

    #[serde(default)]
    allow_listed_signature_types_csv: String,

    allow_raw_uploads: bool,

    max_upload_bytes: u64,

    multipart_chunk_size: i64,

    multipart_ttl_hours: u64,

    multipart_max_per_address: i64,

    multipart_fraud_tolerance_percent: u64,

    multipart_refund_threshold_percent: u64,

    #[serde(default)]
    object_store_mode: String,

    object_store_root: String,
}

impl Default for Env {
    fn default() -> Self {
        Self {
            db_url: String::new(),
            db_max_connections: 5,
            listen_addr: "0.0.0.0:3000".to_string(),
            gateway_fqdn: "localhost".to_string(),
            chain_info_url: "https://arweave.net/info".to_string(),
            chain_height_override: None,
            chain_height_ttl_secs: 120,
            deadline_height_buffer: 200,
            pay_to_address: String::new(),
            x402_facilitators_json: String::new(),
            winc_per_gib: 400_000_000_000,
            price_fee_percent: 30,
            price_buffer_percent: 10,
            minimum_payment_usdc: 1_000,
            deposit_usdc: 10_000,
            ar_usd_override: None,
            ar_usd_ttl_secs: 300,
            ar_usd_url:
                "https://api.coingecko.com/api/v3/simple/price?ids=arweave&vs_currencies=usd"
                    .to_string(),
            bundler_private_key_hex: String::new(),
            free_uploads_enabled: true,
            free_upload_limit_bytes: 524_800,
            whitelist_owners_csv: String::new(),
            allow_listed_signature_types_csv: String::new(),
            allow_raw_uploads: true,
            max_upload_bytes: 4 * 1024 * 1024 * 1024,
            multipart_chunk_size: 5 * 1024 * 1024,
            multipart_ttl_hours: 24,
            multipart_max_per_address: 5,
            multipart_fraud_tolerance_percent: 10,
            multipart_refund_threshold_percent: 50,
            object_store_mode: "fs".to_string(),
            object_store_root: "./data".to_string(),
        }
    }
}

fn parse_hex_32(label: &str, s: &str) -> Result<[u8; 32]> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).with_context(|| format!("invalid hex for {label}"))?;
    if bytes.len() != 32 {
        anyhow::bail!("{label} must be 32 bytes (got {})", bytes.len());
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn parse_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_signature_types_csv(label: &str, s: &str) -> Result<Vec<u16>> {
    let mut out = Vec::new();
    for raw in s.split(',') {
        let v = raw.trim();
        if v.is_empty() {
            continue;
        }
        let ty: u16 = v
            .parse()
            .with_context(|| format!("invalid signature type in {label}: {v}"))?;
        if !out.contains(&ty) {
            out.push(ty);
        }
    }
    Ok(out)
}

fn parse_facilitators_json(s: &str) -> Result<Vec<FacilitatorEndpoint>> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<FacilitatorEntry> =
        serde_json::from_str(trimmed).context("parse X402_FACILITATORS_JSON")?;
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let url = entry.url.trim().to_string();
        if url.is_empty() {
            anyhow::bail!("X402_FACILITATORS_JSON contains an empty url");
        }
        let dialect = match entry.dialect.trim().to_ascii_lowercase().as_str() {
            "" | "rest" => FacilitatorDialect::Rest,
            "cdp" => FacilitatorDialect::Cdp,
            other => anyhow::bail!("unsupported facilitator dialect: {other} (expected rest|cdp)"),
        };
        if dialect == FacilitatorDialect::Cdp
            && (entry.api_key_id.is_none() || entry.api_key_secret.is_none())
        {
            anyhow::bail!("cdp facilitator {url} needs api_key_id and api_key_secret");
        }
        out.push(FacilitatorEndpoint {
            base_url: url,
            dialect,
            api_key_id: entry.api_key_id,
            api_key_secret: entry.api_key_secret,
        });
    }
    Ok(out)
}

fn parse_object_store_mode(s: &str) -> Result<ObjectStoreMode> {
    match s.trim().to_ascii_lowercase().as_str() {
        "" | "fs" => Ok(ObjectStoreMode::Fs),
        "mem" => Ok(ObjectStoreMode::Mem),
        other => anyhow::bail!("unsupported OBJECT_STORE_MODE: {other} (expected: fs|mem)"),
    }
}

pub fn load_config() -> Result<AppConfig> {
    let env: Env = envy::from_env().context("load gateway env config")?;

    if env.db_url.trim().is_empty() {
        anyhow::bail!("DB_URL must be set");
    }
    if env.bundler_private_key_hex.trim().is_empty() {
        anyhow::bail!("BUNDLER_PRIVATE_KEY_HEX must be set");
    }
    let server_private_key =
        parse_hex_32("BUNDLER_PRIVATE_KEY_HEX", &env.bundler_private_key_hex)?;

    if env.pay_to_address.trim().is_empty() {
        anyhow::bail!("PAY_TO_ADDRESS must be set");
    }
    let pay_to: alloy::primitives::Address = env
        .pay_to_address
        .trim()
        .parse()
        .with_context(|| format!("invalid PAY_TO_ADDRESS: {}", env.pay_to_address))?;

    Ok(AppConfig {
        server: ServerConfig {
            listen_addr: env.listen_addr,
            gateway_fqdn: env.gateway_fqdn,
            chain_info_url: env.chain_info_url,
            chain_height_override: env.chain_height_override,
            chain_height_ttl: Duration::from_secs(env.chain_height_ttl_secs.max(1)),
            deadline_height_buffer: env.deadline_height_buffer.max(1),
        },
        payment: PaymentConfig {
            pay_to,
            facilitators: parse_facilitators_json(&env.x402_facilitators_json)?,
        },
        pricing: PricingConfig {
            winc_per_gib: env.winc_per_gib.max(1),
            fee_percent: env.price_fee_percent,
            buffer_percent: env.price_buffer_percent,
            minimum_payment_usdc: env.minimum_payment_usdc,
            deposit_usdc: env.deposit_usdc.max(1),
            ar_usd_override: env.ar_usd_override,
            ar_usd_ttl: Duration::from_secs(env.ar_usd_ttl_secs.max(1)),
            ar_usd_url: env.ar_usd_url,
        },
        upload: UploadConfig {
            server_private_key,
            free_uploads_enabled: env.free_uploads_enabled,
            free_upload_limit_bytes: env.free_upload_limit_bytes,
            whitelist_owners: parse_csv(&env.whitelist_owners_csv),
            allow_listed_signature_types: parse_signature_types_csv(
                "ALLOW_LISTED_SIGNATURE_TYPES_CSV",
                &env.allow_listed_signature_types_csv,
            )?,
            allow_raw_uploads: env.allow_raw_uploads,
            max_upload_bytes: env.max_upload_bytes.max(1),
        },
        multipart: MultipartConfig {
            default_chunk_size: env.multipart_chunk_size.max(1),
            ttl_hours: env.multipart_ttl_hours.max(1),
            max_per_address: env.multipart_max_per_address.max(1),
            fraud_tolerance_percent: env.multipart_fraud_tolerance_percent,
            refund_threshold_percent: env.multipart_refund_threshold_percent,
        },
        db_url: env.db_url,
        db_max_connections: env.db_max_connections.clamp(1, 5),
        object_store: ObjectStoreConfig {
            mode: parse_object_store_mode(&env.object_store_mode)?,
            root: env.object_store_root,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hex_32_accepts_0x_and_rejects_wrong_len() {
        let ok = format!("0x{}", "22".repeat(32));
        assert_eq!(parse_hex_32("K", &ok).unwrap(), [0x22u8; 32]);
        let err = parse_hex_32("K", "0x22").unwrap_err().to_string();
        assert!(err.contains("must be 32 bytes"));
    }

    #[test]
    fn parse_csv_trims_and_drops_empties() {
        assert_eq!(parse_csv(" a, ,b ,, c "), vec!["a", "b", "c"]);
        assert!(parse_csv("  ,  ").is_empty());
    }

    #[test]
    fn parse_signature_types_dedups() {
        let got = parse_signature_types_csv("T", "1,3,1,101").unwrap();
        assert_eq!(got, vec![1, 3, 101]);
        assert!(parse_signature_types_csv("T", "1,x").is_err());
    }

    #[test]
    fn parse_facilitators_json_empty_ok() {
        assert!(parse_facilitators_json("   ").unwrap().is_empty());
    }

    #[test]
    fn parse_facilitators_json_validates_dialect_and_keys() {
        let ok = r#"[{"url":"https://f.example","dialect":"rest"}]"#;
        let v = parse_facilitators_json(ok).unwrap();
        assert_eq!(v.len(), 1);
        assert_eq!(v[0].dialect, FacilitatorDialect::Rest);

        let err = parse_facilitators_json(r#"[{"url":"https://f.example","dialect":"cdp"}]"#)
            .unwrap_err()
            .to_string();
        assert!(err.contains("api_key_id"));

        let err = parse_facilitators_json(r#"[{"url":" ","dialect":"rest"}]"#)
            .unwrap_err()
            .to_string();
        assert!(err.contains("empty url"));

        let err = parse_facilitators_json(r#"[{"url":"x","dialect":"soap"}]"#)
            .unwrap_err()
            .to_string();
        assert!(err.contains("unsupported facilitator dialect"));
    }

    #[test]
    fn parse_object_store_mode_defaults_to_fs() {
        assert_eq!(parse_object_store_mode("").unwrap(), ObjectStoreMode::Fs);
        assert_eq!(
            parse_object_store_mode("MEM").unwrap(),
            ObjectStoreMode::Mem
        );
        assert!(parse_object_store_mode("s3").is_err());
    }
}
