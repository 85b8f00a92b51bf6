//! Confirms finality. A seeded bundle either becomes permanent with its
//! block height, or runs out of attempts and dissolves back into re-packed
//! items.

use super::{Outcome, StageCtx, last_attempt, payload_str};
use crate::chain::TxStatus;
use anyhow::Result;
use std::time::Duration;
use store::bundles::{BUNDLE_PERMANENT, BUNDLE_SEEDED};
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
        BUNDLE_SEEDED => {}
        BUNDLE_PERMANENT => return Ok(Outcome::Done),
        other => {
            // A replayed or out-of-order verify; the state gate makes this a
            // benign no-op warning.
            tracing::warn!(plan_id, state = other, "bundle plan exists in another state");
            return Ok(Outcome::Done);
        }
    }
    let bundle_id = bundle.bundle_id.as_deref().unwrap_or_default();

    let status = ctx.chain.tx_status(bundle_id).await?;
    let block_height = match status {
        TxStatus::Confirmed { block_height } => block_height,
        TxStatus::Pending | TxStatus::NotFound => {
            if last_attempt(job) {
                let (repacked, given_up) = ctx
                    .db
                    .fail_bundle_and_repack(
                        plan_id,
                        "finality not reached",
                        ctx.cfg.jobs.max_repacks,
                    )
                    .await?;
                ctx.telemetry.repacked("repacked", repacked);
                ctx.telemetry.repacked("given_up", given_up);
                ctx.telemetry.bundle_transition("failed");
                return Ok(Outcome::Fatal(format!(
                    "bundle {bundle_id} never reached finality"
                )));
            }
            return Ok(Outcome::RetryAfter(
                format!("bundle {bundle_id} not final yet ({status:?})"),
                ctx.cfg.jobs.verify_delay.max(Duration::from_secs(5)),
            ));
        }
    };

    if !ctx
        .db
        .bundle_as_permanent(plan_id, block_height as i64)
        .await?
    {
        tracing::warn!(plan_id, "bundle plan exists in another state");
        return Ok(Outcome::Done);
    }
    ctx.telemetry.bundle_transition("permanent");
    tracing::info!(plan_id, bundle_id = %bundle_id, block_height, "bundle permanent");

    ctx.db
        .enqueue_job(
            Queue::PutOffsets,
            &serde_json::json!({ "planId": plan_id }),
            Some(plan_id),
            Duration::ZERO,
        )
        .await?;
    Ok(Outcome::Done)
}
