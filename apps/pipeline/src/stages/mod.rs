//! One module per queue. Every handler is idempotent: replays and
//! out-of-order deliveries resolve through the state gates in the store.

pub mod cleanup;
pub mod finalize_upload;
pub mod new_data_item;
pub mod offsets;
pub mod optical;
pub mod plan;
pub mod post;
pub mod prepare;
pub mod seed;
pub mod verify;

use crate::chain::ChainClient;
use crate::config::AppConfig;
use crate::metrics::Telemetry;
use anyhow::Result;
use std::time::{Duration, Instant};
use store::jobs::{JobRow, Queue, retry_delay};
use store::{Db, ObjectStore};

#[derive(Clone)]
pub struct StageCtx {
    pub cfg: AppConfig,
    pub db: Db,
    pub objects: ObjectStore,
    pub chain: ChainClient,
    pub http: reqwest::Client,
    pub telemetry: Telemetry,
    pub instance_id: String,
}

/// What a stage decided about its job. `Err` from a handler is treated as
/// retryable with the default backoff.
pub enum Outcome {
    Done,
    RetryAfter(String, Duration),
    Fatal(String),
}

pub async fn process_job(ctx: StageCtx, job: JobRow) {
    let queue = job.queue.as_str();
    let started = Instant::now();

    let result = match job.queue {
        Queue::NewDataItem => new_data_item::process(&ctx, &job).await,
        Queue::PlanBundle => plan::process(&ctx, &job).await,
        Queue::PrepareBundle => prepare::process(&ctx, &job).await,
        Queue::PostBundle => post::process(&ctx, &job).await,
        Queue::SeedBundle => seed::process(&ctx, &job).await,
        Queue::VerifyBundle => verify::process(&ctx, &job).await,
        Queue::OpticalPost => optical::process(&ctx, &job).await,
        Queue::UnbundleBdi => offsets::process_unbundle(&ctx, &job).await,
        Queue::FinalizeUpload => finalize_upload::process(&ctx, &job).await,
        Queue::PutOffsets => offsets::process_put_offsets(&ctx, &job).await,
        Queue::CleanupFs => cleanup::process(&ctx, &job).await,
    };
    let ms = started.elapsed().as_millis() as u64;

    let recorded: Result<()> = match result {
        Ok(Outcome::Done) => {
            ctx.telemetry.job(queue, "ok", ms);
            ctx.db.complete_job(job.job_id, &ctx.instance_id).await
        }
        Ok(Outcome::RetryAfter(msg, delay)) => {
            ctx.telemetry.job(queue, "retry", ms);
            tracing::info!(queue, job_id = job.job_id, msg = %msg, "job will retry");
            ctx.db
                .record_job_retryable(job.job_id, &ctx.instance_id, &msg, delay)
                .await
        }
        Ok(Outcome::Fatal(msg)) => {
            ctx.telemetry.job(queue, "fatal", ms);
            tracing::error!(queue, job_id = job.job_id, msg = %msg, "job failed fatally");
            ctx.db
                .record_job_fatal(job.job_id, &ctx.instance_id, &msg)
                .await
        }
        Err(err) => {
            ctx.telemetry.job(queue, "retry", ms);
            let msg = format!("{err:#}");
            tracing::warn!(queue, job_id = job.job_id, err = %msg, "job errored; will retry");
            ctx.db
                .record_job_retryable(
                    job.job_id,
                    &ctx.instance_id,
                    &msg,
                    retry_delay(job.attempts),
                )
                .await
        }
    };
    if let Err(err) = recorded {
        tracing::warn!(queue, job_id = job.job_id, err = %err, "failed to record job outcome");
    }
}

pub(crate) fn payload_str<'a>(job: &'a JobRow, field: &str) -> Result<&'a str> {
    job.payload
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("job payload missing {field}: {}", job.payload))
}

/// True when this delivery is the job's last allowed attempt.
pub(crate) fn last_attempt(job: &JobRow) -> bool {
    job.attempts >= 2
}
