//! Assembles a plan's items into a bundle payload, registers the `new`
//! bundle under its content-derived tx id, and hands off to posting.

use super::{Outcome, StageCtx, last_attempt, payload_str};
use ans104::bundle::{bundle_id_for_payload, encode_bundle};
use anyhow::{Context, Result};
use std::time::Duration;
use store::jobs::{JobRow, Queue};
use store::object_store::{bundle_payload_key, raw_data_item_key};

pub async fn process(ctx: &StageCtx, job: &JobRow) -> Result<Outcome> {
    let plan_id = payload_str(job, "planId")?;

    if ctx.db.get_bundle(plan_id).await?.is_some() {
        // Prepare replay: the bundle row exists, make sure posting runs.
        ctx.db
            .enqueue_job(
                Queue::PostBundle,
                &serde_json::json!({ "planId": plan_id }),
                Some(plan_id),
                Duration::ZERO,
            )
            .await?;
        return Ok(Outcome::Done);
    }

    let items = ctx.db.get_plan_items(plan_id).await?;
    if items.is_empty() {
        tracing::warn!(plan_id, "plan has no items; nothing to prepare");
        return Ok(Outcome::Done);
    }

    let mut parts = Vec::with_capacity(items.len());
    for item in &items {
        let key = raw_data_item_key(&item.data_item_id);
        let bytes = match ctx.objects.get(&key).await? {
            Some(bytes) => bytes,
            None => {
                if last_attempt(job) {
                    let (repacked, given_up) = ctx
                        .db
                        .fail_bundle_and_repack(
                            plan_id,
                            &format!("raw object missing for {}", item.data_item_id),
                            ctx.cfg.jobs.max_repacks,
                        )
                        .await?;
                    ctx.telemetry.repacked("repacked", repacked);
                    ctx.telemetry.repacked("given_up", given_up);
                    return Ok(Outcome::Fatal(format!(
                        "raw object missing for {}; plan dissolved",
                        item.data_item_id
                    )));
                }
                return Ok(Outcome::RetryAfter(
                    format!("raw object missing for {}", item.data_item_id),
                    store::jobs::retry_delay(job.attempts),
                ));
            }
        };
        parts.push((item.data_item_id.clone(), bytes));
    }

    let payload = encode_bundle(&parts).context("assemble bundle payload")?;
    let bundle_id = bundle_id_for_payload(&payload);
    let payload_len = payload.len() as i64;

    ctx.objects
        .put(&bundle_payload_key(plan_id), &payload)
        .await
        .context("store bundle payload")?;
    ctx.db
        .insert_bundle(plan_id, &bundle_id, payload_len, items.len() as i32)
        .await?;
    tracing::info!(
        plan_id,
        bundle_id = %bundle_id,
        items = items.len(),
        payload_bytes = payload_len,
        "bundle assembled"
    );

    ctx.db
        .enqueue_job(
            Queue::PostBundle,
            &serde_json::json!({ "planId": plan_id }),
            Some(plan_id),
            Duration::ZERO,
        )
        .await?;
    Ok(Outcome::Done)
}
