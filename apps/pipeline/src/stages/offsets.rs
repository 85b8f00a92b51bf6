//! Offset bookkeeping for permanent items: where each item lives inside its
//! root bundle, and recursive unbundling of nested bundle data items.

use super::{Outcome, StageCtx, payload_str};
use ans104::b64url;
use ans104::bundle::{item_offsets, parse_bundle_entries};
use ans104::codec::parse_data_item;
use anyhow::{Context, Result};
use std::time::Duration;
use store::data_items::OffsetsRow;
use store::jobs::{JobRow, Queue, retry_delay};
use store::object_store::{bundle_payload_key, raw_data_item_key};

/// Items carrying this content type are bundles themselves and get
/// unbundled so their children are addressable too.
pub const BUNDLE_CONTENT_TYPE: &str = "application/x.ans104-bundle";

fn expires_at(ctx: &StageCtx, uploaded_at_ms: i64) -> i64 {
    uploaded_at_ms / 1000 + ctx.cfg.retention.offsets_retention_days * 86_400
}

pub async fn process_put_offsets(ctx: &StageCtx, job: &JobRow) -> Result<Outcome> {
    let plan_id = payload_str(job, "planId")?;

    let Some(bundle) = ctx.db.get_bundle(plan_id).await? else {
        return Ok(Outcome::RetryAfter(
            format!("bundle row for plan {plan_id} not found"),
            retry_delay(job.attempts),
        ));
    };
    let root_bundle_id = bundle.bundle_id.as_deref().unwrap_or_default();

    let payload = match ctx.objects.get(&bundle_payload_key(plan_id)).await? {
        Some(payload) => payload,
        None => {
            // Already swept by retention; offsets for this plan are lost.
            tracing::warn!(plan_id, "bundle payload gone before offsets were written");
            return Ok(Outcome::Done);
        }
    };
    let entries = parse_bundle_entries(&payload).context("parse bundle entry table")?;
    let offsets = item_offsets(&entries.iter().map(|e| e.size).collect::<Vec<_>>());

    for (entry, start_offset) in entries.iter().zip(offsets) {
        let data_item_id = b64url(&entry.id);
        let Some(meta) = ctx.db.get_permanent_item(&data_item_id).await? else {
            tracing::warn!(plan_id, data_item_id = %data_item_id, "bundled item not permanent; skipping offsets");
            continue;
        };
        ctx.db
            .upsert_offsets(&OffsetsRow {
                data_item_id: data_item_id.clone(),
                root_bundle_id: root_bundle_id.to_string(),
                start_offset_in_root: start_offset as i64,
                raw_content_length: entry.size as i64,
                payload_data_start: meta.payload_data_start,
                payload_content_type: meta.payload_content_type.clone(),
                parent_data_item_id: None,
                start_offset_in_parent: None,
                expires_at: expires_at(ctx, meta.uploaded_at),
            })
            .await?;

        if meta.payload_content_type.as_deref() == Some(BUNDLE_CONTENT_TYPE) {
            ctx.db
                .enqueue_job(
                    Queue::UnbundleBdi,
                    &serde_json::json!({ "dataItemId": data_item_id }),
                    Some(&data_item_id),
                    Duration::ZERO,
                )
                .await?;
        }
    }
    tracing::info!(plan_id, items = entries.len(), "offsets written");
    Ok(Outcome::Done)
}

pub async fn process_unbundle(ctx: &StageCtx, job: &JobRow) -> Result<Outcome> {
    let parent_id = payload_str(job, "dataItemId")?;

    let Some(parent) = ctx.db.get_offsets(parent_id).await? else {
        return Ok(Outcome::RetryAfter(
            format!("no offsets for parent {parent_id} yet"),
            retry_delay(job.attempts),
        ));
    };
    let bytes = match ctx.objects.get(&raw_data_item_key(parent_id)).await? {
        Some(bytes) => bytes,
        None => {
            tracing::warn!(parent_id, "raw parent object gone; cannot unbundle");
            return Ok(Outcome::Done);
        }
    };
    let parsed = parse_data_item(&bytes).context("parse parent data item")?;
    let payload = &bytes[parsed.payload_data_start..];
    let entries = match parse_bundle_entries(payload) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!(parent_id, err = %err, "item tagged as bundle does not parse as one");
            return Ok(Outcome::Done);
        }
    };
    let rel_offsets = item_offsets(&entries.iter().map(|e| e.size).collect::<Vec<_>>());

    for (entry, rel_offset) in entries.iter().zip(rel_offsets) {
        let child_id = b64url(&entry.id);
        let child_start = rel_offset as usize;
        let child_end = child_start + entry.size as usize;
        if child_end > payload.len() {
            anyhow::bail!("child {child_id} overruns parent payload");
        }
        let child = match parse_data_item(&payload[child_start..child_end]) {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(child_id = %child_id, err = %err, "nested entry is not a data item");
                continue;
            }
        };
        let child_payload_start = child.payload_data_start as i64;
        let child_content_type = child.content_type().map(str::to_string);

        ctx.db
            .upsert_offsets(&OffsetsRow {
                data_item_id: child_id,
                root_bundle_id: parent.root_bundle_id.clone(),
                start_offset_in_root: parent.start_offset_in_root
                    + parent.payload_data_start
                    + rel_offset as i64,
                raw_content_length: entry.size as i64,
                payload_data_start: child_payload_start,
                payload_content_type: child_content_type,
                parent_data_item_id: Some(parent_id.to_string()),
                start_offset_in_parent: Some(rel_offset as i64),
                expires_at: parent.expires_at,
            })
            .await?;
    }
    tracing::info!(parent_id, children = entries.len(), "nested bundle indexed");
    Ok(Outcome::Done)
}
