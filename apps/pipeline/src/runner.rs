use crate::chain::ChainClient;
use crate::config::{AppConfig, ChainMode, ObjectStoreMode};
use crate::metrics::Telemetry;
use crate::stages::{StageCtx, process_job};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use store::config_kv::CLEANUP_NEXT_RUN_KEY;
use store::jobs::{Queue, next_cron_occurrence};
use store::{Db, ObjectStore};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

pub struct Worker {
    ctx: StageCtx,
    queue_sems: HashMap<Queue, Arc<Semaphore>>,
    tick_count: u64,
}

impl Worker {
    pub async fn new(cfg: AppConfig, telemetry: Telemetry) -> Result<Self> {
        let db = Db::connect(&cfg.db_url, cfg.db_max_connections).await?;
        db.migrate().await?;

        let objects = match cfg.object_store_mode {
            ObjectStoreMode::Fs => ObjectStore::fs(&cfg.object_store_root),
            ObjectStoreMode::Mem => ObjectStore::mem(),
        };
        let chain = match cfg.chain.mode {
            ChainMode::Rpc => {
                ChainClient::rpc(cfg.chain.url.clone(), cfg.chain.finality_confirmations)
            }
            ChainMode::Mock => ChainClient::mock(),
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest");

        let mut queue_sems = HashMap::new();
        for queue in Queue::ALL {
            let permits = match queue {
                Queue::NewDataItem => cfg.jobs.concurrency_new_data_item,
                Queue::VerifyBundle => cfg.jobs.concurrency_verify_bundle,
                _ => 1,
            };
            queue_sems.insert(
                *queue,
                Arc::new(Semaphore::new(usize::try_from(permits).unwrap_or(1).max(1))),
            );
        }

        let instance_id = cfg.instance_id.clone();
        Ok(Self {
            ctx: StageCtx {
                cfg,
                db,
                objects,
                chain,
                http,
                telemetry,
                instance_id,
            },
            queue_sems,
            tick_count: 0,
        })
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.ctx.cfg.jobs.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown");
                    return Ok(());
                }
                _ = interval.tick() => {}
            }

            if let Err(err) = self.tick().await {
                tracing::warn!(err = %err, "tick failed");
            }
            self.tick_count += 1;
        }
    }

    async fn tick(&mut self) -> Result<()> {
        self.schedule_repeatables().await?;
        if self.tick_count % 120 == 0 {
            if let Err(err) = self.ctx.db.trim_job_history().await {
                tracing::warn!(err = %err, "job history trim failed");
            }
        }

        let mut set = JoinSet::new();
        for queue in Queue::ALL {
            let jobs = self
                .ctx
                .db
                .lease_jobs(
                    *queue,
                    &self.ctx.instance_id,
                    self.ctx.cfg.jobs.max_jobs_per_tick,
                )
                .await?;
            for job in jobs {
                let ctx = self.ctx.clone();
                let sem = self
                    .queue_sems
                    .get(queue)
                    .cloned()
                    .context("missing queue semaphore")?;
                set.spawn(async move {
                    let _permit = match sem.acquire_owned().await {
                        Ok(p) => p,
                        Err(err) => {
                            tracing::warn!(err = %err, "failed to acquire queue permit");
                            return;
                        }
                    };
                    process_job(ctx, job).await;
                });
            }
        }
        while let Some(res) = set.join_next().await {
            if let Err(err) = res {
                tracing::warn!(err = %err, "job task panicked");
            }
        }
        Ok(())
    }

    /// Keeps the quasi-repeatable jobs flowing: the planner and the upload
    /// reaper ride every tick (deduped), the janitor follows its cron.
    async fn schedule_repeatables(&self) -> Result<()> {
        self.ctx
            .db
            .enqueue_job(
                Queue::PlanBundle,
                &serde_json::json!({}),
                Some("plan-sweep"),
                Duration::ZERO,
            )
            .await?;
        self.ctx
            .db
            .enqueue_job(
                Queue::FinalizeUpload,
                &serde_json::json!({}),
                Some("upload-reaper"),
                Duration::ZERO,
            )
            .await?;

        let now_secs = store::now_ms() / 1000;
        let next = self
            .ctx
            .db
            .get_config(CLEANUP_NEXT_RUN_KEY)
            .await?
            .and_then(|v| v.as_i64());
        match next {
            None => {
                let next = next_cron_occurrence(&self.ctx.cfg.retention.cleanup_cron, now_secs)?;
                self.ctx
                    .db
                    .put_config(CLEANUP_NEXT_RUN_KEY, &serde_json::json!(next))
                    .await?;
            }
            Some(at) if now_secs >= at => {
                self.ctx
                    .db
                    .enqueue_job(
                        Queue::CleanupFs,
                        &serde_json::json!({}),
                        Some("cleanup-fs"),
                        Duration::ZERO,
                    )
                    .await?;
                let next = next_cron_occurrence(&self.ctx.cfg.retention.cleanup_cron, now_secs)?;
                self.ctx
                    .db
                    .put_config(CLEANUP_NEXT_RUN_KEY, &serde_json::json!(next))
                    .await?;
                tracing::info!(next_run = next, "janitor scheduled");
            }
            Some(_) => {}
        }
        Ok(())
    }
}
