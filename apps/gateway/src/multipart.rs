//! Multipart coordinator: deposit-gated slot creation, chunk staging, and
//! the finalize reconciliation (fraud bound, top-up, refund, pipeline
//! hand-off).

use crate::admission::persist_admitted_item;
use crate::error::ApiError;
use crate::payment::settle_and_record;
use crate::services::Services;
use alloy::primitives::U256;
use ans104::receipt::Receipt;
use ans104::sign::{PaymentTags, build_signed_item, canonical_tags};
use anyhow::Context;
use serde::Serialize;
use store::multipart::{CreateUploadError, MultipartUploadRow, UPLOAD_FAILED, UPLOAD_FINALIZED};
use store::payments::{
    MODE_TOPUP, PaymentRow, STATUS_CONFIRMED, STATUS_FRAUD_PENALTY, STATUS_PENDING,
    STATUS_REFUNDED,
};
use x402::{Network, PaymentRequirements};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedUpload {
    pub upload_id: String,
    pub chunk_size: i64,
    pub ttl_hours: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatus {
    pub upload_id: String,
    pub state: String,
    pub chunk_size: i64,
    pub bytes_received: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_item_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
}

fn deposit_requirements(services: &Services, network: Network) -> PaymentRequirements {
    PaymentRequirements::usdc(
        network,
        services.cfg.payment.pay_to,
        services.pricing.deposit_usdc().to_string(),
        "/chunks".to_string(),
        "multipart upload deposit".to_string(),
        "application/octet-stream".to_string(),
    )
}

fn parse_usdc(s: &str) -> Result<U256, ApiError> {
    U256::from_str_radix(s.trim(), 10)
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("ledger amount {s:?} not decimal: {e}")))
}

pub async fn create_upload(
    services: &Services,
    network: Network,
    deposit_payment_id: &str,
    chunk_size: Option<i64>,
) -> Result<CreatedUpload, ApiError> {
    let deposit = services
        .db
        .get_payment(deposit_payment_id)
        .await
        .map_err(ApiError::Transient)?;
    let Some(deposit) = deposit else {
        return Err(ApiError::payment_required(
            deposit_requirements(services, network),
            "deposit payment not found",
        ));
    };
    let amount = parse_usdc(&deposit.usdc_amount)?;
    if amount < services.pricing.deposit_usdc() {
        return Err(ApiError::payment_required(
            deposit_requirements(services, network),
            format!(
                "deposit of {} below required {}",
                deposit.usdc_amount,
                services.pricing.deposit_usdc()
            ),
        ));
    }

    let upload_id = uuid::Uuid::new_v4().to_string();
    let upload_key = format!("multipart-assembled/{upload_id}");
    let chunk_size = chunk_size
        .filter(|c| *c > 0)
        .unwrap_or(services.cfg.multipart.default_chunk_size);
    let ttl_hours = services.cfg.multipart.ttl_hours;

    let outcome = services
        .db
        .create_multipart_upload(
            &upload_id,
            &upload_key,
            chunk_size,
            deposit_payment_id,
            (ttl_hours * 3600) as i64,
            services.cfg.multipart.max_per_address,
        )
        .await
        .map_err(ApiError::Transient)?;

    match outcome {
        Ok(()) => {
            tracing::info!(upload_id = %upload_id, deposit = %deposit_payment_id, "multipart upload created");
            Ok(CreatedUpload {
                upload_id,
                chunk_size,
                ttl_hours,
            })
        }
        Err(CreateUploadError::DepositNotFound) => Err(ApiError::payment_required(
            deposit_requirements(services, network),
            "deposit payment not found",
        )),
        Err(CreateUploadError::DepositAlreadyBound) => Err(ApiError::Conflict(
            "deposit payment is already bound to another upload".into(),
        )),
        Err(CreateUploadError::DepositNotUsable) => Err(ApiError::Conflict(
            "deposit payment is not in pending_validation".into(),
        )),
        Err(CreateUploadError::TooManyInFlight) => Err(ApiError::TooManyUploads),
    }
}

async fn load_in_flight(
    services: &Services,
    upload_id: &str,
) -> Result<MultipartUploadRow, ApiError> {
    let upload = services
        .db
        .get_multipart_upload(upload_id)
        .await
        .map_err(ApiError::Transient)?
        .ok_or(ApiError::NotFound)?;
    Ok(upload)
}

pub async fn put_chunk(
    services: &Services,
    upload_id: &str,
    offset: i64,
    body: &[u8],
) -> Result<(), ApiError> {
    let upload = load_in_flight(services, upload_id).await?;
    if upload.state != store::multipart::UPLOAD_IN_FLIGHT {
        return Err(ApiError::Conflict(format!(
            "upload is {}, not accepting chunks",
            upload.state
        )));
    }
    if upload.ttl_expired {
        return Err(ApiError::Conflict("upload ttl expired".into()));
    }
    if offset < 0 {
        return Err(ApiError::BadRequest("negative chunk offset".into()));
    }
    if body.len() as i64 > upload.chunk_size {
        return Err(ApiError::BadRequest(format!(
            "chunk of {} bytes exceeds chunk size {}",
            body.len(),
            upload.chunk_size
        )));
    }
    services
        .objects
        .put_part(upload_id, offset, body)
        .await
        .map_err(ApiError::Transient)?;
    Ok(())
}

pub async fn upload_status(
    services: &Services,
    upload_id: &str,
) -> Result<UploadStatus, ApiError> {
    let upload = load_in_flight(services, upload_id).await?;
    let staged = services
        .objects
        .multipart_size(upload_id)
        .await
        .map_err(ApiError::Transient)?;
    let bytes_received = match upload.actual_byte_count {
        Some(actual) => actual as u64,
        None => staged,
    };
    Ok(UploadStatus {
        upload_id: upload.upload_id,
        state: upload.state,
        chunk_size: upload.chunk_size,
        bytes_received,
        data_item_id: upload.data_item_id,
        failed_reason: upload.failed_reason,
    })
}

pub struct FinalizedUpload {
    pub data_item_id: String,
    pub receipt: Receipt,
    pub payment_ids: Vec<String>,
}

/// Reconciles declared vs actual bytes and the paid vs required cost, then
/// hands the assembled body to the admission persistence path.
pub async fn finalize_upload(
    services: &Services,
    network: Network,
    upload_id: &str,
    declared_byte_count: Option<i64>,
    payment_header: Option<&str>,
) -> Result<FinalizedUpload, ApiError> {
    let upload = load_in_flight(services, upload_id).await?;

    match upload.state.as_str() {
        UPLOAD_FINALIZED => {
            // Finalize replay: serve the stored result.
            let data_item_id = upload
                .data_item_id
                .clone()
                .context("finalized upload without data item")
                .map_err(ApiError::Internal)?;
            let receipt = stored_receipt(services, &data_item_id).await?;
            let payment_ids = services
                .db
                .list_payments_for_upload(upload_id)
                .await
                .map_err(ApiError::Transient)?
                .into_iter()
                .map(|p| p.payment_id)
                .collect();
            return Ok(FinalizedUpload {
                data_item_id,
                receipt,
                payment_ids,
            });
        }
        UPLOAD_FAILED => {
            return Err(ApiError::FraudDetected(
                upload
                    .failed_reason
                    .unwrap_or_else(|| "upload failed".into()),
            ));
        }
        _ => {}
    }
    if upload.ttl_expired {
        return Err(ApiError::Conflict("upload ttl expired".into()));
    }
    let declared = declared_byte_count
        .filter(|d| *d > 0)
        .ok_or_else(|| ApiError::BadRequest("declaredByteCount is required".into()))?;

    // Assemble (or re-use an assembly from an interrupted finalize).
    let staged = services
        .objects
        .multipart_size(upload_id)
        .await
        .map_err(ApiError::Transient)?;
    let total = if staged == 0
        && services
            .objects
            .exists(&upload.upload_key)
            .await
            .map_err(ApiError::Transient)?
    {
        services
            .objects
            .get(&upload.upload_key)
            .await
            .map_err(ApiError::Transient)?
            .map(|b| b.len() as u64)
            .unwrap_or(0)
    } else {
        services
            .objects
            .complete_multipart(upload_id, &upload.upload_key)
            .await
            .map_err(ApiError::Transient)?
    };

    // Fraud bound: actual bytes may exceed the declaration by the tolerance
    // only. Past it, every linked payment is kept as a penalty.
    let tolerance = services.cfg.multipart.fraud_tolerance_percent;
    let fraud_limit = (declared as u64).saturating_mul(100 + tolerance) / 100;
    if total > fraud_limit {
        let payments = services
            .db
            .list_payments_for_upload(upload_id)
            .await
            .map_err(ApiError::Transient)?;
        for payment in payments.iter().filter(|p| p.status == STATUS_PENDING) {
            services
                .db
                .finalize_payment(
                    &payment.payment_id,
                    STATUS_FRAUD_PENALTY,
                    Some(total as i64),
                    None,
                    store::now_ms(),
                )
                .await
                .map_err(ApiError::Transient)?;
        }
        let reason = format!(
            "declared {declared} bytes but uploaded {total} (tolerance {tolerance}%)"
        );
        services
            .db
            .fail_multipart_upload(upload_id, Some(total as i64), &reason)
            .await
            .map_err(ApiError::Transient)?;
        services.telemetry.multipart_finalize("fraud");
        tracing::warn!(upload_id = %upload_id, declared, total, "multipart fraud detected");
        return Err(ApiError::FraudDetected(reason));
    }

    let quote = services
        .pricing
        .quote_usdc_for_bytes(total, 0)
        .await
        .map_err(ApiError::Transient)?;
    let required = quote.usdc_atomic;

    let mut payments = services
        .db
        .list_payments_for_upload(upload_id)
        .await
        .map_err(ApiError::Transient)?;
    if payments.is_empty() {
        return Err(ApiError::Conflict("upload has no deposit payment".into()));
    }
    let mut paid = sum_usdc(&payments)?;

    if paid < required {
        if let Some(header) = payment_header {
            let shortfall = required - paid;
            let requirements = topup_requirements(services, network, upload_id, &shortfall);
            let settled = settle_and_record(
                services,
                header,
                &requirements,
                MODE_TOPUP,
                Some(total as i64),
                &quote.winc.to_string(),
            )
            .await?;
            let linked = services
                .db
                .try_link_payment_to_upload(&settled.payment_id, upload_id)
                .await
                .map_err(ApiError::Transient)?;
            if !linked {
                return Err(ApiError::Conflict(format!(
                    "payment {} is already linked elsewhere",
                    settled.tx_hash
                )));
            }
            payments = services
                .db
                .list_payments_for_upload(upload_id)
                .await
                .map_err(ApiError::Transient)?;
            paid = sum_usdc(&payments)?;
        }
        if paid < required {
            services.telemetry.multipart_finalize("topup_required");
            let shortfall = required - paid;
            return Err(ApiError::payment_required(
                topup_requirements(services, network, upload_id, &shortfall),
                format!("top-up of {shortfall} USDC atomic units required"),
            ));
        }
    }

    // Wrap the assembled bytes under the server wallet, stamped with the
    // deposit payment context.
    let payload = services
        .objects
        .get(&upload.upload_key)
        .await
        .map_err(ApiError::Transient)?
        .context("assembled multipart object missing")
        .map_err(ApiError::Internal)?;
    let deposit = &payments[0];
    let tags = canonical_tags(
        None,
        &[],
        &services.cfg.server.gateway_fqdn,
        &PaymentTags {
            payer_address: Some(deposit.payer_address.clone()),
            tx_hash: Some(deposit.tx_hash.clone()),
            payment_id: Some(deposit.payment_id.clone()),
            network: Some(deposit.network.clone()),
        },
        store::now_ms() as u64,
    );
    let item = build_signed_item(&services.wallet, &payload, &tags)
        .context("assemble multipart item")
        .map_err(ApiError::Internal)?;

    let (receipt, _created) = persist_admitted_item(
        services,
        &item.id,
        &item.owner_address,
        &item.bytes,
        item.payload_data_start as i64,
        None,
        item.signature_type.as_u16() as i16,
        &quote.winc.to_string(),
    )
    .await?;

    // Excess beyond the refund threshold accrues back to the last payment as
    // internal credit; everything else is retained.
    let refund_limit =
        required * U256::from(100 + services.cfg.multipart.refund_threshold_percent)
            / U256::from(100);
    let refund_last = paid > refund_limit;
    let last_idx = payments.len() - 1;
    for (idx, payment) in payments.iter().enumerate() {
        if payment.status != STATUS_PENDING {
            continue;
        }
        let (status, refund_winc) = if refund_last && idx == last_idx {
            let excess = paid - required;
            let winc = services
                .pricing
                .winc_for_usdc_atomic(excess)
                .await
                .map_err(ApiError::Transient)?;
            (STATUS_REFUNDED, Some(winc.to_string()))
        } else {
            (STATUS_CONFIRMED, None)
        };
        services
            .db
            .finalize_payment(
                &payment.payment_id,
                status,
                Some(total as i64),
                refund_winc.as_deref(),
                store::now_ms(),
            )
            .await
            .map_err(ApiError::Transient)?;
    }

    services
        .db
        .finalize_multipart_upload(upload_id, declared, total as i64, &item.id)
        .await
        .map_err(ApiError::Transient)?;
    services.telemetry.multipart_finalize("ok");
    tracing::info!(
        upload_id = %upload_id,
        data_item_id = %item.id,
        total,
        paid = %paid,
        required = %required,
        "multipart upload finalized"
    );

    Ok(FinalizedUpload {
        data_item_id: item.id,
        receipt,
        payment_ids: payments.into_iter().map(|p| p.payment_id).collect(),
    })
}

fn topup_requirements(
    services: &Services,
    network: Network,
    upload_id: &str,
    shortfall: &U256,
) -> PaymentRequirements {
    PaymentRequirements::usdc(
        network,
        services.cfg.payment.pay_to,
        shortfall.to_string(),
        format!("/chunks/{upload_id}/finalize"),
        "multipart upload top-up".to_string(),
        "application/octet-stream".to_string(),
    )
}

fn sum_usdc(payments: &[PaymentRow]) -> Result<U256, ApiError> {
    let mut total = U256::ZERO;
    for payment in payments {
        total += parse_usdc(&payment.usdc_amount)?;
    }
    Ok(total)
}

async fn stored_receipt(services: &Services, data_item_id: &str) -> Result<Receipt, ApiError> {
    let status = services
        .db
        .data_item_status(data_item_id)
        .await
        .map_err(ApiError::Transient)?
        .ok_or(ApiError::NotFound)?;
    let raw = status
        .receipt_json
        .context("data item has no stored receipt")
        .map_err(ApiError::Internal)?;
    serde_json::from_str(&raw)
        .context("decode stored receipt")
        .map_err(ApiError::Internal)
}
