//! Data-item lifecycle tables. An item lives in exactly one of
//! `new_data_item`, `planned_data_item`, `permanent_data_item`,
//! `failed_data_item`; moves between them are transactional.

use crate::Db;
use anyhow::{Context, Result};
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct NewDataItem {
    pub data_item_id: String,
    pub owner_address: String,
    pub byte_count: i64,
    pub payload_data_start: i64,
    pub payload_content_type: Option<String>,
    pub signature_type: i16,
    pub uploaded_at: i64,
    pub deadline_height: i64,
    pub assessed_winc: String,
    pub receipt_json: String,
}

/// Where an item currently sits, for the status endpoint.
#[derive(Debug, Clone)]
pub struct DataItemStatus {
    pub data_item_id: String,
    pub status: String,
    pub receipt_json: Option<String>,
    pub bundle_id: Option<String>,
    pub block_height: Option<i64>,
    pub failed_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PermanentItemMeta {
    pub data_item_id: String,
    pub bundle_id: String,
    pub byte_count: i64,
    pub payload_data_start: i64,
    pub payload_content_type: Option<String>,
    pub uploaded_at: i64,
}

#[derive(Debug, Clone)]
pub struct JanitorItem {
    pub data_item_id: String,
    pub uploaded_at: i64,
    pub plan_id: String,
}

#[derive(Debug, Clone)]
pub struct OffsetsRow {
    pub data_item_id: String,
    pub root_bundle_id: String,
    pub start_offset_in_root: i64,
    pub raw_content_length: i64,
    pub payload_data_start: i64,
    pub payload_content_type: Option<String>,
    pub parent_data_item_id: Option<String>,
    pub start_offset_in_parent: Option<i64>,
    pub expires_at: i64,
}

impl Db {
    /// Inserts a freshly admitted item. The content-addressed id is the
    /// primary key, so replays of the same body are no-ops (returns false).
    pub async fn insert_new_data_item(&self, item: &NewDataItem) -> Result<bool> {
        let n = sqlx::query(
            "insert into bundler.new_data_item( \
                data_item_id, owner_address, byte_count, payload_data_start, \
                payload_content_type, signature_type, uploaded_at, deadline_height, \
                assessed_winc, receipt) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             on conflict (data_item_id) do nothing",
        )
        .bind(&item.data_item_id)
        .bind(&item.owner_address)
        .bind(item.byte_count)
        .bind(item.payload_data_start)
        .bind(&item.payload_content_type)
        .bind(item.signature_type)
        .bind(item.uploaded_at)
        .bind(item.deadline_height)
        .bind(&item.assessed_winc)
        .bind(&item.receipt_json)
        .execute(&self.pool)
        .await
        .context("insert bundler.new_data_item")?
        .rows_affected();
        Ok(n == 1)
    }

    /// Compensation for a failed admission: drop the freshly inserted row if
    /// it has not moved on yet.
    pub async fn delete_new_data_item(&self, data_item_id: &str) -> Result<()> {
        sqlx::query("delete from bundler.new_data_item where data_item_id = $1")
            .bind(data_item_id)
            .execute(&self.pool)
            .await
            .context("delete bundler.new_data_item")?;
        Ok(())
    }

    pub async fn data_item_status(&self, data_item_id: &str) -> Result<Option<DataItemStatus>> {
        let row = sqlx::query(
            "select data_item_id, 'new' as status, receipt, \
                    null::text as bundle_id, null::bigint as block_height, null::text as failed_reason \
             from bundler.new_data_item where data_item_id = $1 \
             union all \
             select data_item_id, 'planned', receipt, null, null, null \
             from bundler.planned_data_item where data_item_id = $1 \
             union all \
             select data_item_id, 'permanent', receipt, bundle_id, block_height, null \
             from bundler.permanent_data_item where data_item_id = $1 \
             union all \
             select data_item_id, 'failed', null, null, null, failed_reason \
             from bundler.failed_data_item where data_item_id = $1",
        )
        .bind(data_item_id)
        .fetch_optional(&self.pool)
        .await
        .context("select data item status")?;

        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(DataItemStatus {
            data_item_id: row.try_get("data_item_id")?,
            status: row.try_get("status")?,
            receipt_json: row.try_get("receipt")?,
            bundle_id: row.try_get("bundle_id")?,
            block_height: row.try_get("block_height")?,
            failed_reason: row.try_get("failed_reason")?,
        }))
    }

    /// Moves an item from `new` to `failed` (admission compensation or
    /// pipeline give-up).
    pub async fn fail_new_data_item(&self, data_item_id: &str, reason: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("begin fail-item tx")?;
        let row = sqlx::query(
            "delete from bundler.new_data_item where data_item_id = $1 \
             returning owner_address, byte_count, signature_type, uploaded_at",
        )
        .bind(data_item_id)
        .fetch_optional(&mut *tx)
        .await
        .context("delete new_data_item for fail")?;
        let Some(row) = row else {
            return Ok(false);
        };
        sqlx::query(
            "insert into bundler.failed_data_item( \
                data_item_id, owner_address, byte_count, signature_type, uploaded_at, failed_reason) \
             values ($1, $2, $3, $4, $5, $6) \
             on conflict (data_item_id) do nothing",
        )
        .bind(data_item_id)
        .bind(row.try_get::<String, _>("owner_address")?)
        .bind(row.try_get::<i64, _>("byte_count")?)
        .bind(row.try_get::<i16, _>("signature_type")?)
        .bind(row.try_get::<i64, _>("uploaded_at")?)
        .bind(reason)
        .execute(&mut *tx)
        .await
        .context("insert failed_data_item")?;
        tx.commit().await.context("commit fail-item tx")?;
        Ok(true)
    }

    pub async fn upsert_offsets(&self, offsets: &OffsetsRow) -> Result<()> {
        sqlx::query(
            "insert into bundler.data_item_offsets( \
                data_item_id, root_bundle_id, start_offset_in_root, raw_content_length, \
                payload_data_start, payload_content_type, parent_data_item_id, \
                start_offset_in_parent, expires_at) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             on conflict (data_item_id) do update set \
                root_bundle_id = excluded.root_bundle_id, \
                start_offset_in_root = excluded.start_offset_in_root, \
                raw_content_length = excluded.raw_content_length, \
                payload_data_start = excluded.payload_data_start, \
                payload_content_type = excluded.payload_content_type, \
                parent_data_item_id = excluded.parent_data_item_id, \
                start_offset_in_parent = excluded.start_offset_in_parent, \
                expires_at = excluded.expires_at",
        )
        .bind(&offsets.data_item_id)
        .bind(&offsets.root_bundle_id)
        .bind(offsets.start_offset_in_root)
        .bind(offsets.raw_content_length)
        .bind(offsets.payload_data_start)
        .bind(&offsets.payload_content_type)
        .bind(&offsets.parent_data_item_id)
        .bind(offsets.start_offset_in_parent)
        .bind(offsets.expires_at)
        .execute(&self.pool)
        .await
        .context("upsert bundler.data_item_offsets")?;
        Ok(())
    }

    pub async fn get_offsets(&self, data_item_id: &str) -> Result<Option<OffsetsRow>> {
        let row = sqlx::query(
            "select data_item_id, root_bundle_id, start_offset_in_root, raw_content_length, \
                    payload_data_start, payload_content_type, parent_data_item_id, \
                    start_offset_in_parent, expires_at \
             from bundler.data_item_offsets where data_item_id = $1",
        )
        .bind(data_item_id)
        .fetch_optional(&self.pool)
        .await
        .context("select bundler.data_item_offsets")?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(OffsetsRow {
            data_item_id: row.try_get("data_item_id")?,
            root_bundle_id: row.try_get("root_bundle_id")?,
            start_offset_in_root: row.try_get("start_offset_in_root")?,
            raw_content_length: row.try_get("raw_content_length")?,
            payload_data_start: row.try_get("payload_data_start")?,
            payload_content_type: row.try_get("payload_content_type")?,
            parent_data_item_id: row.try_get("parent_data_item_id")?,
            start_offset_in_parent: row.try_get("start_offset_in_parent")?,
            expires_at: row.try_get("expires_at")?,
        }))
    }

    pub async fn get_permanent_item(
        &self,
        data_item_id: &str,
    ) -> Result<Option<PermanentItemMeta>> {
        let row = sqlx::query(
            "select data_item_id, bundle_id, byte_count, payload_data_start, \
                    payload_content_type, uploaded_at \
             from bundler.permanent_data_item where data_item_id = $1",
        )
        .bind(data_item_id)
        .fetch_optional(&self.pool)
        .await
        .context("select bundler.permanent_data_item")?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(PermanentItemMeta {
            data_item_id: row.try_get("data_item_id")?,
            bundle_id: row.try_get("bundle_id")?,
            byte_count: row.try_get("byte_count")?,
            payload_data_start: row.try_get("payload_data_start")?,
            payload_content_type: row.try_get("payload_content_type")?,
            uploaded_at: row.try_get("uploaded_at")?,
        }))
    }

    /// Janitor scan: permanent items in ascending `(uploaded_at, id)` order,
    /// strictly after the cursor.
    pub async fn list_permanent_items_after(
        &self,
        cursor: Option<(i64, &str)>,
        limit: i64,
    ) -> Result<Vec<JanitorItem>> {
        let (cursor_uploaded, cursor_id) = cursor.unwrap_or((i64::MIN, ""));
        let rows = sqlx::query(
            "select data_item_id, uploaded_at, plan_id from bundler.permanent_data_item \
             where (uploaded_at, data_item_id) > ($1, $2) \
             order by uploaded_at asc, data_item_id asc \
             limit $3",
        )
        .bind(cursor_uploaded)
        .bind(cursor_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("scan bundler.permanent_data_item")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(JanitorItem {
                data_item_id: row.try_get("data_item_id")?,
                uploaded_at: row.try_get("uploaded_at")?,
                plan_id: row.try_get("plan_id")?,
            });
        }
        Ok(out)
    }
}
