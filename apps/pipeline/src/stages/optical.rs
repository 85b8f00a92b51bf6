//! Fire-and-forget notification to a downstream optical gateway. Nothing in
//! the write path waits on this.

use super::{Outcome, StageCtx, payload_str};
use anyhow::Result;
use store::jobs::JobRow;

pub async fn process(ctx: &StageCtx, job: &JobRow) -> Result<Outcome> {
    let data_item_id = payload_str(job, "dataItemId")?;

    let Some(url) = &ctx.cfg.optical_bridge_url else {
        return Ok(Outcome::Done);
    };

    let resp = ctx
        .http
        .post(url)
        .json(&serde_json::json!({ "id": data_item_id }))
        .send()
        .await;
    match resp {
        Ok(resp) if resp.status().is_success() => {
            tracing::debug!(data_item_id, "optical post delivered");
            Ok(Outcome::Done)
        }
        Ok(resp) => Err(anyhow::anyhow!("optical bridge returned {}", resp.status())),
        Err(err) => Err(err.into()),
    }
}
