use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    Rpc,
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStoreMode {
    Fs,
    Mem,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_url: String,
    pub db_max_connections: u32,
    pub instance_id: String,
    pub metrics_listen_addr: String,
    pub object_store_mode: ObjectStoreMode,
    pub object_store_root: String,
    pub chain: ChainConfig,
    pub jobs: JobConfig,
    pub plan: PlanConfig,
    pub retention: RetentionConfig,
    pub optical_bridge_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub mode: ChainMode,
    pub url: String,
    pub finality_confirmations: u64,
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub tick_interval: Duration,
    pub max_jobs_per_tick: i64,
    pub verify_delay: Duration,
    pub max_repacks: i32,
    pub concurrency_new_data_item: u64,
    pub concurrency_verify_bundle: u64,
}

#[derive(Debug, Clone)]
pub struct PlanConfig {
    pub max_bundle_bytes: u64,
    pub max_bundle_items: usize,
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub cleanup_cron: String,
    pub fs_cleanup_days: i64,
    pub object_store_cleanup_days: i64,
    pub offsets_retention_days: i64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct Env {
    db_url: String,

    db_max_connections: u32,

    #[serde(default)]
    pipeline_instance_id: String,

    metrics_listen_addr: String,

    #[serde(default)]
    object_store_mode: String,

    object_store_root: String,

    #[serde(default)]
    chain_mode: String,

    chain_url: String,

    chain_finality_confirmations: u64,

    pipeline_tick_interval_secs: u64,

    pipeline_max_jobs_per_tick: i64,

    verify_delay_secs: u64,

    max_bundle_repacks: i32,

    concurrency_new_data_item: u64,

    concurrency_verify_bundle: u64,

    plan_max_bundle_bytes: u64,

    plan_max_bundle_items: usize,

    cleanup_cron: String,

    fs_cleanup_days: i64,

    object_store_cleanup_days: i64,

    offsets_retention_days: i64,

    #[serde(default)]
    optical_bridge_url: String,
}

impl Default for Env {
    fn default() -> Self {
        Self {
            db_url: String::new(),
            db_max_connections: 5,
            pipeline_instance_id: String::new(),
            metrics_listen_addr: "0.0.0.0:3001".to_string(),
            object_store_mode: "fs".to_string(),
            object_store_root: "./data".to_string(),
            chain_mode: "rpc".to_string(),
            chain_url: "https://arweave.net".to_string(),
            chain_finality_confirmations: 18,
            pipeline_tick_interval_secs: 5,
            pipeline_max_jobs_per_tick: 10,
            verify_delay_secs: 300,
            max_bundle_repacks: 3,
            concurrency_new_data_item: 5,
            concurrency_verify_bundle: 2,
            plan_max_bundle_bytes: 250 * 1024 * 1024,
            plan_max_bundle_items: 500,
            cleanup_cron: "0 2 * * *".to_string(),
            fs_cleanup_days: 7,
            object_store_cleanup_days: 90,
            offsets_retention_days: 365,
            optical_bridge_url: String::new(),
        }
    }
}

fn parse_chain_mode(s: &str) -> Result<ChainMode> {
    match s.trim().to_ascii_lowercase().as_str() {
        "" | "rpc" => Ok(ChainMode::Rpc),
        "mock" => Ok(ChainMode::Mock),
        other => anyhow::bail!("unsupported CHAIN_MODE: {other} (expected: rpc|mock)"),
    }
}

fn parse_object_store_mode(s: &str) -> Result<ObjectStoreMode> {
    match s.trim().to_ascii_lowercase().as_str() {
        "" | "fs" => Ok(ObjectStoreMode::Fs),
        "mem" => Ok(ObjectStoreMode::Mem),
        other => anyhow::bail!("unsupported OBJECT_STORE_MODE: {other} (expected: fs|mem)"),
    }
}

pub fn load_config() -> Result<AppConfig> {
    let env: Env = envy::from_env().context("load pipeline env config")?;

    if env.db_url.trim().is_empty() {
        anyhow::bail!("DB_URL must be set");
    }
    let chain_mode = parse_chain_mode(&env.chain_mode)?;
    if chain_mode == ChainMode::Rpc && env.chain_url.trim().is_empty() {
        anyhow::bail!("CHAIN_URL must be set in CHAIN_MODE=rpc");
    }

    // The daily cleanup schedule must parse at startup, not at 2am.
    store::jobs::next_cron_occurrence(&env.cleanup_cron, 0)
        .with_context(|| format!("invalid CLEANUP_CRON: {}", env.cleanup_cron))?;

    Ok(AppConfig {
        db_url: env.db_url,
        db_max_connections: env.db_max_connections.clamp(1, 5),
        instance_id: if env.pipeline_instance_id.trim().is_empty() {
            format!("pipeline:{}", std::process::id())
        } else {
            env.pipeline_instance_id
        },
        metrics_listen_addr: env.metrics_listen_addr,
        object_store_mode: parse_object_store_mode(&env.object_store_mode)?,
        object_store_root: env.object_store_root,
        chain: ChainConfig {
            mode: chain_mode,
            url: env.chain_url.trim_end_matches('/').to_string(),
            finality_confirmations: env.chain_finality_confirmations.max(1),
        },
        jobs: JobConfig {
            tick_interval: Duration::from_secs(env.pipeline_tick_interval_secs.max(1)),
            max_jobs_per_tick: env.pipeline_max_jobs_per_tick.max(1),
            verify_delay: Duration::from_secs(env.verify_delay_secs),
            max_repacks: env.max_bundle_repacks.max(0),
            concurrency_new_data_item: env.concurrency_new_data_item.max(1),
            concurrency_verify_bundle: env.concurrency_verify_bundle.max(1),
        },
        plan: PlanConfig {
            max_bundle_bytes: env.plan_max_bundle_bytes.max(1),
            max_bundle_items: env.plan_max_bundle_items.max(1),
        },
        retention: RetentionConfig {
            cleanup_cron: env.cleanup_cron,
            fs_cleanup_days: env.fs_cleanup_days.max(0),
            object_store_cleanup_days: env.object_store_cleanup_days.max(0),
            offsets_retention_days: env.offsets_retention_days.max(1),
        },
        optical_bridge_url: {
            let trimmed = env.optical_bridge_url.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_chain_mode_defaults_to_rpc() {
        assert_eq!(parse_chain_mode("").unwrap(), ChainMode::Rpc);
        assert_eq!(parse_chain_mode("MOCK").unwrap(), ChainMode::Mock);
        assert!(parse_chain_mode("grpc").is_err());
    }

    #[test]
    fn parse_object_store_mode_defaults_to_fs() {
        assert_eq!(parse_object_store_mode("").unwrap(), ObjectStoreMode::Fs);
        assert_eq!(parse_object_store_mode("mem").unwrap(), ObjectStoreMode::Mem);
        assert!(parse_object_store_mode("s3").is_err());
    }
}
