//! Payment ledger: one row per settled x402 transfer. `tx_hash` is the
//! idempotency key for the whole write path — replays collapse onto the
//! first row.

use crate::Db;
use anyhow::{Context, Result};
use sqlx::Row;

pub const STATUS_PENDING: &str = "pending_validation";
pub const STATUS_CONFIRMED: &str = "confirmed";
pub const STATUS_REFUNDED: &str = "refunded";
pub const STATUS_FRAUD_PENALTY: &str = "fraud_penalty";

pub const MODE_PAYG: &str = "payg";
pub const MODE_TOPUP: &str = "topup";
pub const MODE_HYBRID: &str = "hybrid";

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub tx_hash: String,
    pub network: String,
    pub payer_address: String,
    pub usdc_amount: String,
    pub winc_amount: String,
    pub mode: String,
    pub declared_byte_count: Option<i64>,
    pub paid_at: i64,
}

#[derive(Debug, Clone)]
pub struct PaymentRow {
    pub payment_id: String,
    pub tx_hash: String,
    pub network: String,
    pub payer_address: String,
    pub usdc_amount: String,
    pub winc_amount: String,
    pub mode: String,
    pub data_item_id: Option<String>,
    pub upload_id: Option<String>,
    pub declared_byte_count: Option<i64>,
    pub actual_byte_count: Option<i64>,
    pub status: String,
    pub refund_winc: Option<String>,
    pub paid_at: i64,
    pub finalized_at: Option<i64>,
}

const PAYMENT_COLUMNS: &str = "payment_id, tx_hash, network, payer_address, usdc_amount, \
     winc_amount, mode, data_item_id, upload_id, declared_byte_count, actual_byte_count, \
     status, refund_winc, paid_at, finalized_at";

fn row_to_payment(row: sqlx::postgres::PgRow) -> Result<PaymentRow> {
    Ok(PaymentRow {
        payment_id: row.try_get("payment_id")?,
        tx_hash: row.try_get("tx_hash")?,
        network: row.try_get("network")?,
        payer_address: row.try_get("payer_address")?,
        usdc_amount: row.try_get("usdc_amount")?,
        winc_amount: row.try_get("winc_amount")?,
        mode: row.try_get("mode")?,
        data_item_id: row.try_get("data_item_id")?,
        upload_id: row.try_get("upload_id")?,
        declared_byte_count: row.try_get("declared_byte_count")?,
        actual_byte_count: row.try_get("actual_byte_count")?,
        status: row.try_get("status")?,
        refund_winc: row.try_get("refund_winc")?,
        paid_at: row.try_get("paid_at")?,
        finalized_at: row.try_get("finalized_at")?,
    })
}

impl Db {
    /// Inserts a pending payment. A collision on `tx_hash` is success: the
    /// existing payment id is returned so request replays reuse it.
    pub async fn insert_payment(&self, payment: &NewPayment) -> Result<String> {
        let payment_id = uuid::Uuid::new_v4().to_string();
        let inserted = sqlx::query(
            "insert into bundler.payments( \
                payment_id, tx_hash, network, payer_address, usdc_amount, winc_amount, \
                mode, declared_byte_count, status, paid_at) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, 'pending_validation', $9) \
             on conflict (tx_hash) do nothing",
        )
        .bind(&payment_id)
        .bind(&payment.tx_hash)
        .bind(&payment.network)
        .bind(&payment.payer_address)
        .bind(&payment.usdc_amount)
        .bind(&payment.winc_amount)
        .bind(&payment.mode)
        .bind(payment.declared_byte_count)
        .bind(payment.paid_at)
        .execute(&self.pool)
        .await
        .context("insert bundler.payments")?
        .rows_affected();

        if inserted == 1 {
            return Ok(payment_id);
        }
        let existing: String =
            sqlx::query_scalar("select payment_id from bundler.payments where tx_hash = $1")
                .bind(&payment.tx_hash)
                .fetch_one(&self.pool)
                .await
                .context("select payment by tx_hash after conflict")?;
        Ok(existing)
    }

    /// Binds the payment to a data item. Returns false when the payment is
    /// already bound to a different target (the caller surfaces a conflict).
    pub async fn try_link_payment_to_data_item(
        &self,
        payment_id: &str,
        data_item_id: &str,
    ) -> Result<bool> {
        let n = sqlx::query(
            "update bundler.payments set data_item_id = $1 \
             where payment_id = $2 \
               and upload_id is null \
               and (data_item_id is null or data_item_id = $1)",
        )
        .bind(data_item_id)
        .bind(payment_id)
        .execute(&self.pool)
        .await
        .context("link payment to data item")?
        .rows_affected();
        Ok(n == 1)
    }

    pub async fn try_link_payment_to_upload(
        &self,
        payment_id: &str,
        upload_id: &str,
    ) -> Result<bool> {
        let n = sqlx::query(
            "update bundler.payments set upload_id = $1 \
             where payment_id = $2 \
               and data_item_id is null \
               and (upload_id is null or upload_id = $1)",
        )
        .bind(upload_id)
        .bind(payment_id)
        .execute(&self.pool)
        .await
        .context("link payment to upload")?
        .rows_affected();
        Ok(n == 1)
    }

    pub async fn get_payment(&self, payment_id: &str) -> Result<Option<PaymentRow>> {
        let row = sqlx::query(&format!(
            "select {PAYMENT_COLUMNS} from bundler.payments where payment_id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await
        .context("select payment by id")?;
        row.map(row_to_payment).transpose()
    }

    pub async fn get_payment_by_tx_hash(&self, tx_hash: &str) -> Result<Option<PaymentRow>> {
        let row = sqlx::query(&format!(
            "select {PAYMENT_COLUMNS} from bundler.payments where tx_hash = $1"
        ))
        .bind(tx_hash)
        .fetch_optional(&self.pool)
        .await
        .context("select payment by tx_hash")?;
        row.map(row_to_payment).transpose()
    }

    pub async fn get_payment_by_data_item(&self, data_item_id: &str) -> Result<Option<PaymentRow>> {
        let row = sqlx::query(&format!(
            "select {PAYMENT_COLUMNS} from bundler.payments where data_item_id = $1"
        ))
        .bind(data_item_id)
        .fetch_optional(&self.pool)
        .await
        .context("select payment by data_item_id")?;
        row.map(row_to_payment).transpose()
    }

    /// All payments bound to a multipart upload, deposit first.
    pub async fn list_payments_for_upload(&self, upload_id: &str) -> Result<Vec<PaymentRow>> {
        let rows = sqlx::query(&format!(
            "select {PAYMENT_COLUMNS} from bundler.payments \
             where upload_id = $1 order by paid_at asc, payment_id asc"
        ))
        .bind(upload_id)
        .fetch_all(&self.pool)
        .await
        .context("select payments by upload_id")?;
        rows.into_iter().map(row_to_payment).collect()
    }

    /// Moves a payment out of `pending_validation`. Monotonic: once
    /// finalized, further updates are rejected (returns false).
    pub async fn finalize_payment(
        &self,
        payment_id: &str,
        status: &str,
        actual_byte_count: Option<i64>,
        refund_winc: Option<&str>,
        finalized_at: i64,
    ) -> Result<bool> {
        if !matches!(
            status,
            STATUS_CONFIRMED | STATUS_REFUNDED | STATUS_FRAUD_PENALTY
        ) {
            anyhow::bail!("invalid finalize target status: {status}");
        }
        let n = sqlx::query(
            "update bundler.payments set \
                status = $1, \
                actual_byte_count = coalesce($2, actual_byte_count), \
                refund_winc = $3, \
                finalized_at = $4 \
             where payment_id = $5 and status = 'pending_validation'",
        )
        .bind(status)
        .bind(actual_byte_count)
        .bind(refund_winc)
        .bind(finalized_at)
        .bind(payment_id)
        .execute(&self.pool)
        .await
        .context("finalize payment")?
        .rows_affected();
        Ok(n == 1)
    }
}
