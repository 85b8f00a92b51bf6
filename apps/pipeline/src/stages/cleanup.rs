//! Retention janitor: a cursored sweep over permanent items deleting raw
//! per-item blobs past the filesystem cutoff and assembled bundle payloads
//! past the object-store cutoff. A single producer fills a bounded batch
//! queue; deletes run with capped concurrency and an error budget.

use super::{Outcome, StageCtx};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use store::config_kv::FS_CLEANUP_CURSOR_KEY;
use store::data_items::JanitorItem;
use store::jobs::JobRow;
use store::object_store::{bundle_payload_key, raw_data_item_key};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

const BATCH_SIZE: i64 = 500;
const BATCH_QUEUE_DEPTH: usize = 5;
const DELETE_CONCURRENCY: usize = 8;
const MAX_DELETE_ERRORS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CleanupCursor {
    pub uploaded_at: i64,
    pub data_item_id: String,
}

pub async fn process(ctx: &StageCtx, _job: &JobRow) -> Result<Outcome> {
    let now = store::now_ms();
    let fs_cutoff = now - ctx.cfg.retention.fs_cleanup_days * 86_400_000;
    let object_cutoff = now - ctx.cfg.retention.object_store_cleanup_days * 86_400_000;

    let mut cursor: Option<CleanupCursor> = match ctx.db.get_config(FS_CLEANUP_CURSOR_KEY).await? {
        Some(raw) => serde_json::from_value(raw).ok(),
        None => None,
    };

    let errors = Arc::new(AtomicU64::new(0));
    let (batch_tx, mut batch_rx) = mpsc::channel::<Vec<JanitorItem>>(BATCH_QUEUE_DEPTH);

    // Single producer: walk the permanent table in cursor order, stopping as
    // soon as rows are newer than the filesystem cutoff (the scan is
    // ascending, so everything after is newer too).
    let producer = {
        let db = ctx.db.clone();
        let mut cursor = cursor.clone();
        tokio::spawn(async move {
            loop {
                let after = cursor
                    .as_ref()
                    .map(|c| (c.uploaded_at, c.data_item_id.clone()));
                let batch = db
                    .list_permanent_items_after(
                        after.as_ref().map(|(at, id)| (*at, id.as_str())),
                        BATCH_SIZE,
                    )
                    .await?;
                if batch.is_empty() {
                    break;
                }
                let last = batch.last().expect("non-empty batch");
                cursor = Some(CleanupCursor {
                    uploaded_at: last.uploaded_at,
                    data_item_id: last.data_item_id.clone(),
                });
                let scanned = batch.len();
                let full = scanned as i64 == BATCH_SIZE;
                let due: Vec<JanitorItem> = batch
                    .into_iter()
                    .filter(|item| item.uploaded_at < fs_cutoff)
                    .collect();
                // Crossing the cutoff (or draining the table) ends the sweep.
                let done = !full || due.len() < scanned;
                if !due.is_empty() && batch_tx.send(due).await.is_err() {
                    break;
                }
                if done {
                    break;
                }
            }
            anyhow::Ok(())
        })
    };

    let semaphore = Arc::new(Semaphore::new(DELETE_CONCURRENCY));
    let mut deleted = 0u64;
    while let Some(batch) = batch_rx.recv().await {
        let mut set = JoinSet::new();
        for item in &batch {
            let permit = semaphore.clone().acquire_owned().await?;
            let objects = ctx.objects.clone();
            let telemetry = ctx.telemetry.clone();
            let errors = errors.clone();
            let item = item.clone();
            let past_object_cutoff = item.uploaded_at < object_cutoff;
            set.spawn(async move {
                let _permit = permit;
                match objects.delete(&raw_data_item_key(&item.data_item_id)).await {
                    Ok(()) => telemetry.janitor_delete("fs", true),
                    Err(err) => {
                        telemetry.janitor_delete("fs", false);
                        errors.fetch_add(1, Ordering::SeqCst);
                        tracing::warn!(id = %item.data_item_id, err = %err, "raw blob delete failed");
                    }
                }
                if past_object_cutoff {
                    match objects.delete(&bundle_payload_key(&item.plan_id)).await {
                        Ok(()) => telemetry.janitor_delete("object", true),
                        Err(err) => {
                            telemetry.janitor_delete("object", false);
                            errors.fetch_add(1, Ordering::SeqCst);
                            tracing::warn!(plan_id = %item.plan_id, err = %err, "bundle payload delete failed");
                        }
                    }
                }
            });
        }
        while let Some(res) = set.join_next().await {
            if let Err(err) = res {
                tracing::warn!(err = %err, "janitor delete task panicked");
                errors.fetch_add(1, Ordering::SeqCst);
            }
        }
        deleted += batch.len() as u64;

        // The cursor only moves once the whole batch was attempted.
        if let Some(last) = batch.last() {
            cursor = Some(CleanupCursor {
                uploaded_at: last.uploaded_at,
                data_item_id: last.data_item_id.clone(),
            });
            ctx.db
                .put_config(
                    FS_CLEANUP_CURSOR_KEY,
                    &serde_json::to_value(cursor.as_ref().expect("cursor set"))?,
                )
                .await?;
        }

        if errors.load(Ordering::SeqCst) > MAX_DELETE_ERRORS {
            batch_rx.close();
            producer.abort();
            return Ok(Outcome::RetryAfter(
                format!(
                    "janitor aborted after {} delete errors",
                    errors.load(Ordering::SeqCst)
                ),
                std::time::Duration::from_secs(300),
            ));
        }
    }

    match producer.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(err),
        Err(err) if err.is_cancelled() => {}
        Err(err) => return Err(err.into()),
    }

    tracing::info!(swept = deleted, "retention sweep complete");
    Ok(Outcome::Done)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_roundtrips_through_json() {
        let cursor = CleanupCursor {
            uploaded_at: 1_700_000_000_000,
            data_item_id: "abc".into(),
        };
        let value = serde_json::to_value(&cursor).unwrap();
        assert_eq!(value["uploadedAt"], 1_700_000_000_000i64);
        let back: CleanupCursor = serde_json::from_value(value).unwrap();
        assert_eq!(back, cursor);
    }
}
