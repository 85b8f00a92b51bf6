//! Uploads the bundle payload chunks. Verification is enqueued with a delay
//! so gateways have time to index the seeded data.

use super::{Outcome, StageCtx, last_attempt, payload_str};
use anyhow::Result;
use std::time::Duration;
use store::bundles::{BUNDLE_POSTED, BUNDLE_SEEDED};
use store::jobs::{JobRow, Queue, retry_delay};
use store::object_store::bundle_payload_key;

pub async fn process(ctx: &StageCtx, job: &JobRow) -> Result<Outcome> {
    let plan_id = payload_str(job, "planId")?;

    let Some(bundle) = ctx.db.get_bundle(plan_id).await? else {
        return Ok(Outcome::RetryAfter(
            format!("bundle row for plan {plan_id} not found"),
            retry_delay(job.attempts),
        ));
    };
    match bundle.state.as_str() {
        BUNDLE_POSTED => {}
        BUNDLE_SEEDED | "permanent" => {
            ctx.db
                .enqueue_job(
                    Queue::VerifyBundle,
                    &serde_json::json!({ "planId": plan_id }),
                    Some(plan_id),
                    ctx.cfg.jobs.verify_delay,
                )
                .await?;
            return Ok(Outcome::Done);
        }
        _ => return Ok(Outcome::Done),
    }
    let bundle_id = bundle.bundle_id.as_deref().unwrap_or_default();

    let payload = match ctx.objects.get(&bundle_payload_key(plan_id)).await? {
        Some(payload) => payload,
        None => {
            return Ok(Outcome::RetryAfter(
                format!("bundle payload missing for plan {plan_id}"),
                retry_delay(job.attempts),
            ));
        }
    };

    if let Err(err) = ctx.chain.seed_chunks(bundle_id, &payload).await {
        if last_attempt(job) {
            let (repacked, given_up) = ctx
                .db
                .fail_bundle_and_repack(
                    plan_id,
                    &format!("seed failed: {err:#}"),
                    ctx.cfg.jobs.max_repacks,
                )
                .await?;
            ctx.telemetry.repacked("repacked", repacked);
            ctx.telemetry.repacked("given_up", given_up);
            ctx.telemetry.bundle_transition("failed");
            return Ok(Outcome::Fatal(format!("seed failed: {err:#}")));
        }
        return Ok(Outcome::RetryAfter(
            format!("seed failed: {err:#}"),
            retry_delay(job.attempts),
        ));
    }

    if !ctx.db.advance_bundle(plan_id, BUNDLE_SEEDED).await? {
        tracing::warn!(plan_id, "bundle left 'posted' while seeding; treating as replay");
        return Ok(Outcome::Done);
    }
    ctx.telemetry.bundle_transition("seeded");
    tracing::info!(plan_id, bundle_id = %bundle_id, bytes = payload.len(), "bundle seeded");

    ctx.db
        .enqueue_job(
            Queue::VerifyBundle,
            &serde_json::json!({ "planId": plan_id }),
            Some(plan_id),
            ctx.cfg.jobs.verify_delay,
        )
        .await?;
    Ok(Outcome::Done)
}
