//! Admission of signed and unsigned uploads: free-tier rules, the 402
//! payment gate, object/SQL persistence, pipeline hand-off and the signed
//! receipt.

use crate::error::ApiError;
use crate::payment::{SettledPayment, settle_and_record};
use crate::services::Services;
use ans104::codec::{MIN_DATA_ITEM_LEN, ParsedDataItem, parse_data_item, peek_signature_type};
use ans104::receipt::{Receipt, ReceiptParams, sign_receipt};
use ans104::sign::{PaymentTags, build_signed_item, canonical_tags, verify_ethereum_item};
use ans104::{SignatureType, Tag};
use anyhow::Context;
use serde::Deserialize;
use store::data_items::NewDataItem;
use store::jobs::Queue;
use store::object_store::raw_data_item_key;
use store::payments::MODE_PAYG;
use x402::{Network, PaymentRequirements};

pub struct UploadOutcome {
    pub data_item_id: String,
    pub owner_address: String,
    pub receipt: Receipt,
    pub payment: Option<SettledPayment>,
    /// False when this body replayed an existing row.
    pub created: bool,
}

/// JSON envelope shape of `POST /x402/upload/unsigned`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedEnvelope {
    pub data: String,
    #[serde(default)]
    pub tags: Vec<EnvelopeTag>,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EnvelopeTag {
    pub name: String,
    pub value: String,
}

/// `x-tag-app-name` -> `App-Name`.
pub fn header_tag_name(header: &str) -> String {
    header
        .strip_prefix("x-tag-")
        .unwrap_or(header)
        .split('-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn is_free_upload(services: &Services, parsed: &ParsedDataItem) -> bool {
    let upload = &services.cfg.upload;
    if upload.whitelist_owners.contains(&parsed.owner_address) {
        return true;
    }
    if upload.free_uploads_enabled
        && upload.free_upload_limit_bytes > 0
        && parsed.byte_count as u64 <= upload.free_upload_limit_bytes
    {
        return true;
    }
    upload
        .allow_listed_signature_types
        .contains(&parsed.signature_type.as_u16())
}

fn upload_requirements(
    services: &Services,
    network: Network,
    usdc_atomic: &str,
    resource: &str,
    mime_type: &str,
) -> PaymentRequirements {
    PaymentRequirements::usdc(
        network,
        services.cfg.payment.pay_to,
        usdc_atomic.to_string(),
        resource.to_string(),
        "permanent storage upload".to_string(),
        mime_type.to_string(),
    )
}

/// Signed path: the client already produced a complete data item.
pub async fn handle_signed_upload(
    services: &Services,
    network: Network,
    resource: &str,
    payment_header: Option<&str>,
    body: &[u8],
) -> Result<UploadOutcome, ApiError> {
    if body.len() as u64 > services.cfg.upload.max_upload_bytes {
        return Err(ApiError::BadRequest(format!(
            "body of {} bytes exceeds the {} byte limit",
            body.len(),
            services.cfg.upload.max_upload_bytes
        )));
    }
    let parsed =
        parse_data_item(body).map_err(|err| ApiError::BadRequest(format!("{err:#}")))?;

    // Ethereum-type signatures are checked locally; the other schemes are
    // carried through and verified by the gateways that index the bundle.
    if parsed.signature_type == SignatureType::Ethereum {
        verify_ethereum_item(
            &parsed.signature,
            &parsed.owner,
            parsed.target.as_ref(),
            parsed.anchor.as_ref(),
            &parsed.tag_bytes,
            &body[parsed.payload_data_start..],
        )
        .map_err(|err| ApiError::BadRequest(format!("bad item signature: {err:#}")))?;
    }

    let data_item_id = parsed.id();
    let quote = services
        .pricing
        .quote_usdc_for_bytes(parsed.byte_count as u64, parsed.tags.len() as u64)
        .await
        .map_err(ApiError::Transient)?;
    let winc = quote.winc.to_string();

    let payment = if is_free_upload(services, &parsed) {
        None
    } else {
        let mime = parsed
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let requirements = upload_requirements(
            services,
            network,
            &quote.usdc_atomic.to_string(),
            resource,
            &mime,
        );
        let Some(header) = payment_header else {
            services.telemetry.upload("signed", "payment_required");
            return Err(ApiError::payment_required(requirements, "payment required"));
        };
        let settled = settle_and_record(
            services,
            header,
            &requirements,
            MODE_PAYG,
            Some(parsed.byte_count as i64),
            &winc,
        )
        .await?;
        link_payment_to_item(services, &settled, &data_item_id).await?;
        Some(settled)
    };

    let assessed_winc = if payment.is_some() { winc } else { "0".to_string() };
    let (receipt, created) = persist_admitted_item(
        services,
        &data_item_id,
        &parsed.owner_address,
        body,
        parsed.payload_data_start as i64,
        parsed.content_type().map(str::to_string),
        parsed.signature_type.as_u16() as i16,
        &assessed_winc,
    )
    .await?;

    services
        .telemetry
        .upload("signed", if created { "ok" } else { "replay" });
    Ok(UploadOutcome {
        data_item_id,
        owner_address: parsed.owner_address,
        receipt,
        payment,
        created,
    })
}

/// Unsigned path: wrap raw bytes into a server-signed item after the payment
/// gate clears.
pub async fn handle_unsigned_upload(
    services: &Services,
    network: Network,
    resource: &str,
    payment_header: Option<&str>,
    payload: &[u8],
    caller_tags: Vec<Tag>,
    content_type: Option<String>,
) -> Result<UploadOutcome, ApiError> {
    if !services.cfg.upload.allow_raw_uploads {
        return Err(ApiError::Unauthorized("raw uploads are disabled".into()));
    }
    if payload.len() as u64 > services.cfg.upload.max_upload_bytes {
        return Err(ApiError::BadRequest(format!(
            "payload of {} bytes exceeds the {} byte limit",
            payload.len(),
            services.cfg.upload.max_upload_bytes
        )));
    }

    let quote = services
        .pricing
        .quote_usdc_for_bytes(payload.len() as u64, caller_tags.len() as u64)
        .await
        .map_err(ApiError::Transient)?;
    let winc = quote.winc.to_string();

    let upload_cfg = &services.cfg.upload;
    let free = upload_cfg.free_uploads_enabled
        && upload_cfg.free_upload_limit_bytes > 0
        && payload.len() as u64 <= upload_cfg.free_upload_limit_bytes;

    let payment = if free {
        None
    } else {
        let mime = content_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let requirements = upload_requirements(
            services,
            network,
            &quote.usdc_atomic.to_string(),
            resource,
            &mime,
        );
        let Some(header) = payment_header else {
            services.telemetry.upload("unsigned", "payment_required");
            return Err(ApiError::payment_required(requirements, "payment required"));
        };
        let settled = settle_and_record(
            services,
            header,
            &requirements,
            MODE_PAYG,
            Some(payload.len() as i64),
            &winc,
        )
        .await?;
        Some(settled)
    };

    let payment_tags = match &payment {
        Some(p) => PaymentTags {
            payer_address: Some(p.payer.clone()),
            tx_hash: Some(p.tx_hash.clone()),
            payment_id: Some(p.payment_id.clone()),
            network: Some(p.network.as_str().to_string()),
        },
        None => PaymentTags::default(),
    };
    let tags = canonical_tags(
        content_type.as_deref(),
        &caller_tags,
        &services.cfg.server.gateway_fqdn,
        &payment_tags,
        store::now_ms() as u64,
    );
    let item = build_signed_item(&services.wallet, payload, &tags)
        .context("assemble server-signed item")
        .map_err(ApiError::Internal)?;

    if let Some(settled) = &payment {
        link_payment_to_item(services, settled, &item.id).await?;
    }

    let assessed_winc = if payment.is_some() { winc } else { "0".to_string() };
    let (receipt, created) = persist_admitted_item(
        services,
        &item.id,
        &item.owner_address,
        &item.bytes,
        item.payload_data_start as i64,
        content_type,
        item.signature_type.as_u16() as i16,
        &assessed_winc,
    )
    .await?;

    services
        .telemetry
        .upload("unsigned", if created { "ok" } else { "replay" });
    Ok(UploadOutcome {
        data_item_id: item.id,
        owner_address: item.owner_address,
        receipt,
        payment,
        created,
    })
}

/// Legacy `/tx` auto-detect: a known 16-bit signature-type prefix means a
/// signed item; anything else is raw bytes. Bodies shorter than the minimal
/// signed header are rejected outright instead of being misclassified.
pub async fn handle_legacy_upload(
    services: &Services,
    network: Network,
    resource: &str,
    payment_header: Option<&str>,
    body: &[u8],
    content_type: Option<String>,
    header_tags: Vec<Tag>,
) -> Result<UploadOutcome, ApiError> {
    match peek_signature_type(body) {
        Some(_) => {
            if body.len() < MIN_DATA_ITEM_LEN {
                return Err(ApiError::BadRequest(format!(
                    "body of {} bytes is shorter than the minimal data item header",
                    body.len()
                )));
            }
            handle_signed_upload(services, network, resource, payment_header, body).await
        }
        None => {
            handle_unsigned_upload(
                services,
                network,
                resource,
                payment_header,
                body,
                header_tags,
                content_type,
            )
            .await
        }
    }
}

async fn link_payment_to_item(
    services: &Services,
    settled: &SettledPayment,
    data_item_id: &str,
) -> Result<(), ApiError> {
    let linked = services
        .db
        .try_link_payment_to_data_item(&settled.payment_id, data_item_id)
        .await
        .map_err(ApiError::Transient)?;
    if !linked {
        return Err(ApiError::Conflict(format!(
            "payment {} is already linked to another upload",
            settled.tx_hash
        )));
    }
    Ok(())
}

/// Object write and SQL insert, in that order, then the pipeline enqueue.
/// Returns the signed receipt (the stored one on replay).
#[allow(clippy::too_many_arguments)]
pub(crate) async fn persist_admitted_item(
    services: &Services,
    data_item_id: &str,
    owner_address: &str,
    item_bytes: &[u8],
    payload_data_start: i64,
    payload_content_type: Option<String>,
    signature_type: i16,
    assessed_winc: &str,
) -> Result<(Receipt, bool), ApiError> {
    let height = services
        .chain
        .current_height()
        .await
        .map_err(ApiError::Transient)?;
    let deadline_height = height + services.cfg.server.deadline_height_buffer;

    let fqdn = services.cfg.server.gateway_fqdn.clone();
    let receipt = sign_receipt(
        &services.wallet,
        ReceiptParams {
            id: data_item_id.to_string(),
            timestamp: store::now_ms() as u64,
            deadline_height,
            data_caches: vec![fqdn.clone()],
            fast_finality_indexes: vec![fqdn],
            winc: assessed_winc.to_string(),
        },
    )
    .map_err(ApiError::Internal)?;
    let receipt_json = serde_json::to_string(&receipt)
        .context("serialize receipt")
        .map_err(ApiError::Internal)?;

    let key = raw_data_item_key(data_item_id);
    services
        .objects
        .put(&key, item_bytes)
        .await
        .map_err(ApiError::Transient)?;

    let inserted = services
        .db
        .insert_new_data_item(&NewDataItem {
            data_item_id: data_item_id.to_string(),
            owner_address: owner_address.to_string(),
            byte_count: item_bytes.len() as i64,
            payload_data_start,
            payload_content_type,
            signature_type,
            uploaded_at: store::now_ms(),
            deadline_height: deadline_height as i64,
            assessed_winc: assessed_winc.to_string(),
            receipt_json,
        })
        .await;

    let inserted = match inserted {
        Ok(v) => v,
        Err(err) => {
            // The object write succeeded but the row did not land; remove the
            // orphan blob so retention never has to reason about it.
            let _ = services.objects.delete(&key).await;
            return Err(ApiError::Transient(err));
        }
    };

    if !inserted {
        // Replay of an already admitted body: serve the stored receipt.
        let status = services
            .db
            .data_item_status(data_item_id)
            .await
            .map_err(ApiError::Transient)?;
        let stored = status
            .and_then(|s| s.receipt_json)
            .and_then(|raw| serde_json::from_str::<Receipt>(&raw).ok());
        return Ok((stored.unwrap_or(receipt), false));
    }

    services
        .db
        .enqueue_job(
            Queue::NewDataItem,
            &serde_json::json!({ "dataItemId": data_item_id }),
            Some(data_item_id),
            std::time::Duration::ZERO,
        )
        .await
        .map_err(ApiError::Transient)?;
    // Fire-and-forget downstream gateway notification.
    let _ = services
        .db
        .enqueue_job(
            Queue::OpticalPost,
            &serde_json::json!({ "dataItemId": data_item_id }),
            Some(data_item_id),
            std::time::Duration::ZERO,
        )
        .await;

    Ok((receipt, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_tag_names_become_proper_case() {
        assert_eq!(header_tag_name("x-tag-app-name"), "App-Name");
        assert_eq!(header_tag_name("x-tag-content-type"), "Content-Type");
        assert_eq!(header_tag_name("x-tag-a"), "A");
        assert_eq!(header_tag_name("x-tag-my-app-version"), "My-App-Version");
    }

    #[test]
    fn unsigned_envelope_decodes_camel_case() {
        let env: UnsignedEnvelope = serde_json::from_str(
            r#"{"data":"aGVsbG8","tags":[{"name":"App-Name","value":"MyApp"}],"contentType":"text/plain"}"#,
        )
        .unwrap();
        assert_eq!(env.content_type.as_deref(), Some("text/plain"));
        assert_eq!(env.tags.len(), 1);
        assert_eq!(env.tags[0].name, "App-Name");
    }
}
