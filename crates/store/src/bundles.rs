//! Bundle plans and the bundle state machine. Transitions are monotonic and
//! state-gated in SQL; data items move between lifecycle tables inside the
//! same transaction as the bundle transition that affects them.

use crate::Db;
use anyhow::{Context, Result};
use sqlx::Row;

pub const BUNDLE_NEW: &str = "new";
pub const BUNDLE_POSTED: &str = "posted";
pub const BUNDLE_SEEDED: &str = "seeded";
pub const BUNDLE_PERMANENT: &str = "permanent";
pub const BUNDLE_FAILED: &str = "failed";

/// Allowed previous states for each bundle transition target. Everything
/// else is either out of order or a replayed job, both of which the workers
/// treat as a no-op warning.
pub fn expected_previous_states(next_state: &str) -> Result<&'static [&'static str]> {
    match next_state {
        BUNDLE_POSTED => Ok(&[BUNDLE_NEW]),
        BUNDLE_SEEDED => Ok(&[BUNDLE_POSTED]),
        BUNDLE_PERMANENT => Ok(&[BUNDLE_SEEDED]),
        BUNDLE_FAILED => Ok(&[BUNDLE_NEW, BUNDLE_POSTED, BUNDLE_SEEDED]),
        _ => anyhow::bail!("unsupported bundle transition target: {next_state}"),
    }
}

fn expected_state_binds(next_state: &str) -> Result<Vec<String>> {
    Ok(expected_previous_states(next_state)?
        .iter()
        .map(|s| (*s).to_string())
        .collect())
}

#[derive(Debug, Clone)]
pub struct BundleRow {
    pub plan_id: String,
    pub bundle_id: Option<String>,
    pub state: String,
    pub payload_byte_count: i64,
    pub data_item_count: i32,
    pub block_height: Option<i64>,
    pub failed_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PlannedItemRow {
    pub data_item_id: String,
    pub byte_count: i64,
    pub payload_data_start: i64,
    pub payload_content_type: Option<String>,
    pub uploaded_at: i64,
}

#[derive(Debug, Clone)]
pub struct PlanCandidate {
    pub data_item_id: String,
    pub byte_count: i64,
}

impl Db {
    /// Waiting items in insertion order, for the planner to group.
    pub async fn list_new_data_items_for_planning(
        &self,
        limit: i64,
    ) -> Result<Vec<PlanCandidate>> {
        let rows = sqlx::query(
            "select data_item_id, byte_count from bundler.new_data_item \
             order by created_at asc, data_item_id asc limit $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("select new_data_item for planning")?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(PlanCandidate {
                data_item_id: row.try_get("data_item_id")?,
                byte_count: row.try_get("byte_count")?,
            });
        }
        Ok(out)
    }

    /// Creates a plan and moves the chosen items `new -> planned` in one
    /// transaction. Items that vanished since selection are skipped, so a
    /// replayed plan job degrades to a smaller (possibly empty) plan.
    /// Returns the number of items actually captured.
    pub async fn create_bundle_plan(&self, plan_id: &str, item_ids: &[String]) -> Result<usize> {
        let mut tx = self.pool.begin().await.context("begin plan tx")?;
        sqlx::query(
            "insert into bundler.bundle_plan(plan_id) values ($1) on conflict do nothing",
        )
        .bind(plan_id)
        .execute(&mut *tx)
        .await
        .context("insert bundler.bundle_plan")?;

        let mut captured = 0usize;
        for data_item_id in item_ids {
            let moved = sqlx::query(
                "with moved as ( \
                    delete from bundler.new_data_item where data_item_id = $1 \
                    returning * \
                ) \
                insert into bundler.planned_data_item( \
                    data_item_id, plan_id, owner_address, byte_count, payload_data_start, \
                    payload_content_type, signature_type, uploaded_at, deadline_height, \
                    assessed_winc, receipt, repack_count) \
                select data_item_id, $2, owner_address, byte_count, payload_data_start, \
                       payload_content_type, signature_type, uploaded_at, deadline_height, \
                       assessed_winc, receipt, repack_count \
                from moved",
            )
            .bind(data_item_id)
            .bind(plan_id)
            .execute(&mut *tx)
            .await
            .context("move new_data_item -> planned_data_item")?
            .rows_affected();
            captured += moved as usize;
        }
        tx.commit().await.context("commit plan tx")?;
        Ok(captured)
    }

    pub async fn get_plan_items(&self, plan_id: &str) -> Result<Vec<PlannedItemRow>> {
        let rows = sqlx::query(
            "select data_item_id, byte_count, payload_data_start, payload_content_type, uploaded_at \
             from bundler.planned_data_item where plan_id = $1 \
             order by planned_at asc, data_item_id asc",
        )
        .bind(plan_id)
        .fetch_all(&self.pool)
        .await
        .context("select planned_data_item by plan")?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(PlannedItemRow {
                data_item_id: row.try_get("data_item_id")?,
                byte_count: row.try_get("byte_count")?,
                payload_data_start: row.try_get("payload_data_start")?,
                payload_content_type: row.try_get("payload_content_type")?,
                uploaded_at: row.try_get("uploaded_at")?,
            });
        }
        Ok(out)
    }

    /// Registers the assembled (unsigned-tx) bundle for a plan. Idempotent on
    /// plan_id; prepare replays keep the first row.
    pub async fn insert_bundle(
        &self,
        plan_id: &str,
        bundle_id: &str,
        payload_byte_count: i64,
        data_item_count: i32,
    ) -> Result<bool> {
        let n = sqlx::query(
            "insert into bundler.bundles(plan_id, bundle_id, state, payload_byte_count, data_item_count) \
             values ($1, $2, 'new', $3, $4) \
             on conflict (plan_id) do nothing",
        )
        .bind(plan_id)
        .bind(bundle_id)
        .bind(payload_byte_count)
        .bind(data_item_count)
        .execute(&self.pool)
        .await
        .context("insert bundler.bundles")?
        .rows_affected();
        Ok(n == 1)
    }

    pub async fn get_bundle(&self, plan_id: &str) -> Result<Option<BundleRow>> {
        let row = sqlx::query(
            "select plan_id, bundle_id, state, payload_byte_count, data_item_count, \
                    block_height, failed_reason \
             from bundler.bundles where plan_id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .context("select bundler.bundles")?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(BundleRow {
            plan_id: row.try_get("plan_id")?,
            bundle_id: row.try_get("bundle_id")?,
            state: row.try_get("state")?,
            payload_byte_count: row.try_get("payload_byte_count")?,
            data_item_count: row.try_get("data_item_count")?,
            block_height: row.try_get("block_height")?,
            failed_reason: row.try_get("failed_reason")?,
        }))
    }

    /// State-gated forward transition. Returns false when the bundle is not
    /// in an expected previous state (replay or out-of-order delivery).
    pub async fn advance_bundle(&self, plan_id: &str, next_state: &str) -> Result<bool> {
        let previous = expected_state_binds(next_state)?;
        let timestamp_col = match next_state {
            BUNDLE_POSTED => "posted_at",
            BUNDLE_SEEDED => "seeded_at",
            BUNDLE_PERMANENT => "permanent_at",
            _ => "updated_at",
        };
        let n = sqlx::query(&format!(
            "update bundler.bundles set state = $1, {timestamp_col} = now(), updated_at = now() \
             where plan_id = $2 and state = any($3)"
        ))
        .bind(next_state)
        .bind(plan_id)
        .bind(previous)
        .execute(&self.pool)
        .await
        .context("advance bundle state")?
        .rows_affected();
        Ok(n == 1)
    }

    /// `seeded -> permanent` with the observed block height, then moves every
    /// planned item of the plan into `permanent_data_item` in the same
    /// transaction. Returns false (no-op warning) when the bundle is not in
    /// `seeded`.
    pub async fn bundle_as_permanent(&self, plan_id: &str, block_height: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("begin permanent tx")?;
        let n = sqlx::query(
            "update bundler.bundles set \
                state = 'permanent', block_height = $1, permanent_at = now(), updated_at = now() \
             where plan_id = $2 and state = 'seeded'",
        )
        .bind(block_height)
        .bind(plan_id)
        .execute(&mut *tx)
        .await
        .context("mark bundle permanent")?
        .rows_affected();
        if n != 1 {
            return Ok(false);
        }

        let bundle_id: Option<String> =
            sqlx::query_scalar("select bundle_id from bundler.bundles where plan_id = $1")
                .bind(plan_id)
                .fetch_one(&mut *tx)
                .await
                .context("read bundle_id")?;
        let bundle_id = bundle_id.context("permanent bundle has no bundle_id")?;

        sqlx::query(
            "with moved as ( \
                delete from bundler.planned_data_item where plan_id = $1 \
                returning * \
            ) \
            insert into bundler.permanent_data_item( \
                data_item_id, plan_id, bundle_id, block_height, owner_address, byte_count, \
                payload_data_start, payload_content_type, signature_type, uploaded_at, \
                deadline_height, assessed_winc, receipt) \
            select data_item_id, plan_id, $2, $3, owner_address, byte_count, \
                   payload_data_start, payload_content_type, signature_type, uploaded_at, \
                   deadline_height, assessed_winc, receipt \
            from moved \
            on conflict (data_item_id) do nothing",
        )
        .bind(plan_id)
        .bind(&bundle_id)
        .bind(block_height)
        .execute(&mut *tx)
        .await
        .context("move planned -> permanent")?;

        tx.commit().await.context("commit permanent tx")?;
        Ok(true)
    }

    /// Marks the bundle failed and re-packs its items: items under the
    /// re-pack bound go back to `new_data_item` with the counter bumped, the
    /// rest are moved to `failed_data_item`. Returns (repacked, given_up).
    pub async fn fail_bundle_and_repack(
        &self,
        plan_id: &str,
        reason: &str,
        max_repacks: i32,
    ) -> Result<(u64, u64)> {
        let mut tx = self.pool.begin().await.context("begin repack tx")?;
        sqlx::query(
            "update bundler.bundles set \
                state = 'failed', failed_reason = $1, updated_at = now() \
             where plan_id = $2 and state = any($3)",
        )
        .bind(reason)
        .bind(plan_id)
        .bind(expected_state_binds(BUNDLE_FAILED)?)
        .execute(&mut *tx)
        .await
        .context("mark bundle failed")?;

        let repacked = sqlx::query(
            "with moved as ( \
                delete from bundler.planned_data_item \
                where plan_id = $1 and repack_count < $2 \
                returning * \
            ) \
            insert into bundler.new_data_item( \
                data_item_id, owner_address, byte_count, payload_data_start, \
                payload_content_type, signature_type, uploaded_at, deadline_height, \
                assessed_winc, receipt, repack_count) \
            select data_item_id, owner_address, byte_count, payload_data_start, \
                   payload_content_type, signature_type, uploaded_at, deadline_height, \
                   assessed_winc, receipt, repack_count + 1 \
            from moved \
            on conflict (data_item_id) do nothing",
        )
        .bind(plan_id)
        .bind(max_repacks)
        .execute(&mut *tx)
        .await
        .context("repack planned -> new")?
        .rows_affected();

        let given_up = sqlx::query(
            "with moved as ( \
                delete from bundler.planned_data_item where plan_id = $1 \
                returning * \
            ) \
            insert into bundler.failed_data_item( \
                data_item_id, owner_address, byte_count, signature_type, uploaded_at, failed_reason) \
            select data_item_id, owner_address, byte_count, signature_type, uploaded_at, $2 \
            from moved \
            on conflict (data_item_id) do nothing",
        )
        .bind(plan_id)
        .bind(format!("exceeded re-pack bound: {reason}"))
        .execute(&mut *tx)
        .await
        .context("fail remaining planned items")?
        .rows_affected();

        tx.commit().await.context("commit repack tx")?;
        Ok((repacked, given_up))
    }
}

#[cfg(test)]
mod bundle_transition_tests {
    use super::*;

    fn transition_allowed(from_state: &str, to_state: &str) -> bool {
        expected_previous_states(to_state)
            .map(|expected| expected.contains(&from_state))
            .unwrap_or(false)
    }

    #[test]
    fn transition_matrix_allows_expected_forward_edges() {
        assert!(transition_allowed("new", "posted"));
        assert!(transition_allowed("posted", "seeded"));
        assert!(transition_allowed("seeded", "permanent"));
        assert!(transition_allowed("new", "failed"));
        assert!(transition_allowed("posted", "failed"));
        assert!(transition_allowed("seeded", "failed"));
    }

    #[test]
    fn transition_matrix_rejects_backward_and_skipping_edges() {
        assert!(!transition_allowed("posted", "posted"));
        assert!(!transition_allowed("seeded", "posted"));
        assert!(!transition_allowed("new", "seeded"));
        assert!(!transition_allowed("new", "permanent"));
        assert!(!transition_allowed("posted", "permanent"));
        assert!(!transition_allowed("permanent", "failed"));
        assert!(!transition_allowed("failed", "posted"));
    }

    #[test]
    fn unknown_targets_are_rejected() {
        assert!(expected_previous_states("new").is_err());
        assert!(expected_previous_states("sideways").is_err());
    }
}
