//! Tiny key/value table for the janitor cursor and repeatable-job anchors.

use crate::Db;
use anyhow::{Context, Result};

pub const FS_CLEANUP_CURSOR_KEY: &str = "fs-cleanup-last-deleted-cursor";
pub const CLEANUP_NEXT_RUN_KEY: &str = "cleanup-fs-next-run-at";

impl Db {
    pub async fn get_config(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let raw: Option<String> =
            sqlx::query_scalar("select value from bundler.config where key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .context("select bundler.config")?;
        raw.map(|s| serde_json::from_str(&s).context("decode config value"))
            .transpose()
    }

    pub async fn put_config(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        sqlx::query(
            "insert into bundler.config(key, value, updated_at) \
             values ($1, $2, now()) \
             on conflict (key) do update set value = excluded.value, updated_at = now()",
        )
        .bind(key)
        .bind(value.to_string())
        .execute(&self.pool)
        .await
        .context("upsert bundler.config")?;
        Ok(())
    }
}
