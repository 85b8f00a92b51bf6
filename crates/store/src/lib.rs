//! SQL store and object store shared by the gateway and the pipeline worker.
//! Postgres is the single source of truth; every multi-row transition runs in
//! a transaction here.

pub mod bundles;
pub mod config_kv;
pub mod data_items;
pub mod jobs;
pub mod multipart;
pub mod object_store;
pub mod payments;

pub use object_store::ObjectStore;

use anyhow::{Context, Result};
use sqlx::{Acquire, Executor, PgPool, Postgres, postgres::PgPoolOptions};

const MIGRATIONS: &[(i32, &str)] = &[
    (1, include_str!("../migrations/0001_schema.sql")),
    (2, include_str!("../migrations/0002_payments.sql")),
    (3, include_str!("../migrations/0003_data_items.sql")),
    (4, include_str!("../migrations/0004_bundles.sql")),
    (5, include_str!("../migrations/0005_multipart.sql")),
    (6, include_str!("../migrations/0006_jobs.sql")),
    (7, include_str!("../migrations/0007_offsets_config.sql")),
];

#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    pub async fn connect(db_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect(db_url)
            .await
            .context("connect DB_URL")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        // Prevent concurrent migrations when gateway and pipeline processes
        // start at once.
        //
        // IMPORTANT: advisory locks are per-session/connection. The entire
        // migration sequence must run on a single connection, otherwise the
        // lock could be acquired on one connection and "released" on another.
        const MIGRATION_LOCK_KEY: i64 = 0x4255_4E44_4C52_4D47; // "BUNDLRMG"
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("acquire connection for migrations")?;

        sqlx::query("select pg_advisory_lock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await
            .context("acquire migration lock")?;

        let res: Result<()> = async {
            // Ensure schema and migration table exist before reading them.
            exec_sql_batch(&mut *conn, MIGRATIONS[0].1)
                .await
                .context("apply schema bootstrap (v1)")?;

            for (version, sql) in MIGRATIONS {
                if *version == 1 {
                    continue;
                }
                let applied: Option<i32> = sqlx::query_scalar(
                    "select version from bundler.schema_migrations where version = $1",
                )
                .bind(*version)
                .fetch_optional(&mut *conn)
                .await
                .context("read bundler.schema_migrations")?;

                if applied.is_some() {
                    continue;
                }

                let mut tx = conn.begin().await.context("begin migration tx")?;
                exec_sql_batch(&mut *tx, sql)
                    .await
                    .with_context(|| format!("apply migration v{version}"))?;
                sqlx::query("insert into bundler.schema_migrations(version) values ($1)")
                    .bind(*version)
                    .execute(&mut *tx)
                    .await
                    .context("insert bundler.schema_migrations")?;
                tx.commit().await.context("commit migration tx")?;
            }
            Ok(())
        }
        .await;

        // Best-effort unlock (same connection that acquired it).
        let _ = sqlx::query("select pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_KEY)
            .execute(&mut *conn)
            .await;

        res
    }
}

async fn exec_sql_batch<E>(exec: &mut E, sql: &str) -> Result<()>
where
    for<'c> &'c mut E: Executor<'c, Database = Postgres>,
{
    for stmt in sql.split(';') {
        let s = stmt.trim();
        if s.is_empty() {
            continue;
        }
        sqlx::query(s).execute(&mut *exec).await.with_context(|| {
            format!(
                "execute migration statement: {}",
                s.lines().next().unwrap_or("")
            )
        })?;
    }
    Ok(())
}

/// Milliseconds since the unix epoch, the timestamp unit of entity rows.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
