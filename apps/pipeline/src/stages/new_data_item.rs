//! Admission safety net: confirms that both halves of an admitted item
//! (object blob and SQL row) landed, and fails the row when the blob is
//! gone so the planner never packs a hole.

use super::{Outcome, StageCtx, payload_str};
use anyhow::Result;
use store::jobs::JobRow;
use store::object_store::raw_data_item_key;

pub async fn process(ctx: &StageCtx, job: &JobRow) -> Result<Outcome> {
    let data_item_id = payload_str(job, "dataItemId")?;

    let status = ctx.db.data_item_status(data_item_id).await?;
    let Some(status) = status else {
        // Row never landed (or was already compensated away); nothing to do.
        tracing::warn!(data_item_id, "new-data-item job for unknown item");
        return Ok(Outcome::Done);
    };
    if status.status != "new" {
        return Ok(Outcome::Done);
    }

    if !ctx.objects.exists(&raw_data_item_key(data_item_id)).await? {
        ctx.db
            .fail_new_data_item(data_item_id, "raw object missing after admission")
            .await?;
        tracing::error!(data_item_id, "raw object missing; item failed");
        return Ok(Outcome::Done);
    }

    Ok(Outcome::Done)
}
