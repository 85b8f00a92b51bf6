//! Groups waiting data items into bundle plans. Greedy in insertion order
//! up to the soft byte/count targets; a lone item still gets a plan rather
//! than waiting for company.

use super::{Outcome, StageCtx};
use anyhow::Result;
use std::time::Duration;
use store::jobs::{JobRow, Queue};

const PLAN_SCAN_LIMIT: i64 = 10_000;

pub async fn process(ctx: &StageCtx, _job: &JobRow) -> Result<Outcome> {
    let candidates = ctx
        .db
        .list_new_data_items_for_planning(PLAN_SCAN_LIMIT)
        .await?;
    if candidates.is_empty() {
        return Ok(Outcome::Done);
    }

    let max_bytes = ctx.cfg.plan.max_bundle_bytes;
    let max_items = ctx.cfg.plan.max_bundle_items;

    let mut group: Vec<String> = Vec::new();
    let mut group_bytes = 0u64;
    let mut groups: Vec<Vec<String>> = Vec::new();
    for candidate in candidates {
        let size = candidate.byte_count.max(0) as u64;
        if !group.is_empty() && (group.len() >= max_items || group_bytes + size > max_bytes) {
            groups.push(std::mem::take(&mut group));
            group_bytes = 0;
        }
        group_bytes += size;
        group.push(candidate.data_item_id);
    }
    if !group.is_empty() {
        groups.push(group);
    }

    for ids in groups {
        let plan_id = uuid::Uuid::new_v4().to_string();
        let captured = ctx.db.create_bundle_plan(&plan_id, &ids).await?;
        if captured == 0 {
            // Another planner raced us to these items.
            continue;
        }
        tracing::info!(plan_id = %plan_id, items = captured, "bundle plan created");
        ctx.db
            .enqueue_job(
                Queue::PrepareBundle,
                &serde_json::json!({ "planId": plan_id }),
                Some(&plan_id),
                Duration::ZERO,
            )
            .await?;
    }
    Ok(Outcome::Done)
}
