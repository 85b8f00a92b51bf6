//! Multipart upload sessions. Creation binds the deposit payment and inserts
//! the `in_flight` row in one transaction so a deposit can never back two
//! uploads.

use crate::Db;
use anyhow::{Context, Result};
use sqlx::Row;

pub const UPLOAD_IN_FLIGHT: &str = "in_flight";
pub const UPLOAD_FINALIZED: &str = "finalized";
pub const UPLOAD_FAILED: &str = "failed";

#[derive(Debug, Clone)]
pub struct MultipartUploadRow {
    pub upload_id: String,
    pub upload_key: String,
    pub chunk_size: i64,
    pub deposit_payment_id: String,
    pub payer_address: String,
    pub state: String,
    pub declared_byte_count: Option<i64>,
    pub actual_byte_count: Option<i64>,
    pub data_item_id: Option<String>,
    pub failed_reason: Option<String>,
    pub ttl_expired: bool,
}

/// Why an upload slot could not be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateUploadError {
    DepositNotFound,
    DepositNotUsable,
    DepositAlreadyBound,
    TooManyInFlight,
}

impl Db {
    /// Creates an upload slot against a pending deposit payment.
    ///
    /// One transaction: lock the deposit row, check it is still unbound and
    /// pending, enforce the per-payer in-flight cap, bind the payment to the
    /// new upload id and insert the session row.
    pub async fn create_multipart_upload(
        &self,
        upload_id: &str,
        upload_key: &str,
        chunk_size: i64,
        deposit_payment_id: &str,
        ttl_secs: i64,
        max_per_address: i64,
    ) -> Result<std::result::Result<(), CreateUploadError>> {
        let mut tx = self.pool.begin().await.context("begin create-upload tx")?;

        let deposit = sqlx::query(
            "select payer_address, status, upload_id, data_item_id \
             from bundler.payments where payment_id = $1 for update",
        )
        .bind(deposit_payment_id)
        .fetch_optional(&mut *tx)
        .await
        .context("lock deposit payment")?;
        let Some(deposit) = deposit else {
            return Ok(Err(CreateUploadError::DepositNotFound));
        };

        let status: String = deposit.try_get("status")?;
        let bound_upload: Option<String> = deposit.try_get("upload_id")?;
        let bound_item: Option<String> = deposit.try_get("data_item_id")?;
        if bound_upload.is_some() {
            return Ok(Err(CreateUploadError::DepositAlreadyBound));
        }
        if status != "pending_validation" || bound_item.is_some() {
            return Ok(Err(CreateUploadError::DepositNotUsable));
        }
        let payer_address: String = deposit.try_get("payer_address")?;

        let in_flight: i64 = sqlx::query_scalar(
            "select count(*) from bundler.multipart_uploads \
             where payer_address = $1 and state = 'in_flight' and ttl_expires_at > now()",
        )
        .bind(&payer_address)
        .fetch_one(&mut *tx)
        .await
        .context("count in-flight uploads")?;
        if in_flight >= max_per_address {
            return Ok(Err(CreateUploadError::TooManyInFlight));
        }

        sqlx::query("update bundler.payments set upload_id = $1 where payment_id = $2")
            .bind(upload_id)
            .bind(deposit_payment_id)
            .execute(&mut *tx)
            .await
            .context("bind deposit to upload")?;

        sqlx::query(
            "insert into bundler.multipart_uploads( \
                upload_id, upload_key, chunk_size, deposit_payment_id, payer_address, \
                state, ttl_expires_at) \
             values ($1, $2, $3, $4, $5, 'in_flight', now() + make_interval(secs => $6))",
        )
        .bind(upload_id)
        .bind(upload_key)
        .bind(chunk_size)
        .bind(deposit_payment_id)
        .bind(&payer_address)
        .bind(ttl_secs)
        .execute(&mut *tx)
        .await
        .context("insert bundler.multipart_uploads")?;

        tx.commit().await.context("commit create-upload tx")?;
        Ok(Ok(()))
    }

    pub async fn get_multipart_upload(
        &self,
        upload_id: &str,
    ) -> Result<Option<MultipartUploadRow>> {
        let row = sqlx::query(
            "select upload_id, upload_key, chunk_size, deposit_payment_id, payer_address, \
                    state, declared_byte_count, actual_byte_count, data_item_id, failed_reason, \
                    (ttl_expires_at <= now()) as ttl_expired \
             from bundler.multipart_uploads where upload_id = $1",
        )
        .bind(upload_id)
        .fetch_optional(&self.pool)
        .await
        .context("select bundler.multipart_uploads")?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(MultipartUploadRow {
            upload_id: row.try_get("upload_id")?,
            upload_key: row.try_get("upload_key")?,
            chunk_size: row.try_get("chunk_size")?,
            deposit_payment_id: row.try_get("deposit_payment_id")?,
            payer_address: row.try_get("payer_address")?,
            state: row.try_get("state")?,
            declared_byte_count: row.try_get("declared_byte_count")?,
            actual_byte_count: row.try_get("actual_byte_count")?,
            data_item_id: row.try_get("data_item_id")?,
            failed_reason: row.try_get("failed_reason")?,
            ttl_expired: row.try_get("ttl_expired")?,
        }))
    }

    /// `in_flight -> finalized`; gated so a finalize replay is a no-op.
    pub async fn finalize_multipart_upload(
        &self,
        upload_id: &str,
        declared_byte_count: i64,
        actual_byte_count: i64,
        data_item_id: &str,
    ) -> Result<bool> {
        let n = sqlx::query(
            "update bundler.multipart_uploads set \
                state = 'finalized', \
                declared_byte_count = $1, \
                actual_byte_count = $2, \
                data_item_id = $3 \
             where upload_id = $4 and state = 'in_flight'",
        )
        .bind(declared_byte_count)
        .bind(actual_byte_count)
        .bind(data_item_id)
        .bind(upload_id)
        .execute(&self.pool)
        .await
        .context("finalize multipart upload")?
        .rows_affected();
        Ok(n == 1)
    }

    /// `in_flight -> failed` (fraud or abandoned).
    pub async fn fail_multipart_upload(
        &self,
        upload_id: &str,
        actual_byte_count: Option<i64>,
        reason: &str,
    ) -> Result<bool> {
        let n = sqlx::query(
            "update bundler.multipart_uploads set \
                state = 'failed', \
                actual_byte_count = coalesce($1, actual_byte_count), \
                failed_reason = $2 \
             where upload_id = $3 and state = 'in_flight'",
        )
        .bind(actual_byte_count)
        .bind(reason)
        .bind(upload_id)
        .execute(&self.pool)
        .await
        .context("fail multipart upload")?
        .rows_affected();
        Ok(n == 1)
    }

    /// Expired in-flight sessions for the finalize-upload reaper.
    pub async fn list_expired_in_flight_uploads(&self, limit: i64) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "select upload_id from bundler.multipart_uploads \
             where state = 'in_flight' and ttl_expires_at <= now() \
             order by ttl_expires_at asc limit $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("select expired uploads")?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get("upload_id")?);
        }
        Ok(out)
    }
}
