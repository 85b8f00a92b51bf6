//! Reaper for expired multipart sessions: past the TTL an in-flight upload
//! fails, its staging area is dropped, and its deposit is retained.

use super::{Outcome, StageCtx};
use anyhow::Result;
use store::jobs::JobRow;
use store::payments::{STATUS_CONFIRMED, STATUS_PENDING};

const REAP_LIMIT: i64 = 50;

pub async fn process(ctx: &StageCtx, _job: &JobRow) -> Result<Outcome> {
    let expired = ctx.db.list_expired_in_flight_uploads(REAP_LIMIT).await?;
    for upload_id in expired {
        let failed = ctx
            .db
            .fail_multipart_upload(&upload_id, None, "upload ttl expired")
            .await?;
        if !failed {
            continue;
        }
        // The deposit is an anti-spam bond; an abandoned session keeps it.
        let payments = ctx.db.list_payments_for_upload(&upload_id).await?;
        for payment in payments.iter().filter(|p| p.status == STATUS_PENDING) {
            ctx.db
                .finalize_payment(
                    &payment.payment_id,
                    STATUS_CONFIRMED,
                    None,
                    None,
                    store::now_ms(),
                )
                .await?;
        }
        ctx.objects.abort_multipart(&upload_id).await?;
        tracing::info!(upload_id = %upload_id, "expired multipart upload reaped");
    }
    Ok(Outcome::Done)
}
