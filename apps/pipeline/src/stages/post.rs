//! Broadcasts the bundle transaction. On the final failed attempt the
//! bundle is marked failed and its items are re-packed.

use super::{Outcome, StageCtx, last_attempt, payload_str};
use anyhow::Result;
use std::time::Duration;
use store::bundles::{BUNDLE_NEW, BUNDLE_POSTED};
use store::jobs::{JobRow, Queue, retry_delay};

pub async fn process(ctx: &StageCtx, job: &JobRow) -> Result<Outcome> {
    let plan_id = payload_str(job, "planId")?;

    let Some(bundle) = ctx.db.get_bundle(plan_id).await? else {
        return Ok(Outcome::RetryAfter(
            format!("bundle row for plan {plan_id} not found"),
            retry_delay(job.attempts),
        ));
    };
    match bundle.state.as_str() {
        BUNDLE_NEW => {}
        BUNDLE_POSTED | "seeded" | "permanent" => {
            // Replay past a successful post: make sure seeding runs.
            ctx.db
                .enqueue_job(
                    Queue::SeedBundle,
                    &serde_json::json!({ "planId": plan_id }),
                    Some(plan_id),
                    Duration::ZERO,
                )
                .await?;
            return Ok(Outcome::Done);
        }
        _ => return Ok(Outcome::Done),
    }
    let bundle_id = bundle.bundle_id.as_deref().unwrap_or_default();
    if bundle_id.is_empty() {
        return Ok(Outcome::Fatal(format!("bundle for plan {plan_id} has no tx id")));
    }

    if let Err(err) = ctx
        .chain
        .post_bundle(bundle_id, bundle.payload_byte_count.max(0) as u64)
        .await
    {
        if last_attempt(job) {
            let (repacked, given_up) = ctx
                .db
                .fail_bundle_and_repack(plan_id, &format!("post failed: {err:#}"), ctx.cfg.jobs.max_repacks)
                .await?;
            ctx.telemetry.repacked("repacked", repacked);
            ctx.telemetry.repacked("given_up", given_up);
            ctx.telemetry.bundle_transition("failed");
            return Ok(Outcome::Fatal(format!("post failed: {err:#}")));
        }
        return Ok(Outcome::RetryAfter(
            format!("post failed: {err:#}"),
            retry_delay(job.attempts),
        ));
    }

    if !ctx.db.advance_bundle(plan_id, BUNDLE_POSTED).await? {
        tracing::warn!(plan_id, "bundle left 'new' while posting; treating as replay");
        return Ok(Outcome::Done);
    }
    ctx.telemetry.bundle_transition("posted");
    tracing::info!(plan_id, bundle_id = %bundle_id, "bundle posted");

    ctx.db
        .enqueue_job(
            Queue::SeedBundle,
            &serde_json::json!({ "planId": plan_id }),
            Some(plan_id),
            Duration::ZERO,
        )
        .await?;
    Ok(Outcome::Done)
}
