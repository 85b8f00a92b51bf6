//! HTTP surface. Every route is mounted both at `/` and under `/v1`.

use crate::admission::{
    EnvelopeTag, UnsignedEnvelope, UploadOutcome, handle_legacy_upload, handle_signed_upload,
    handle_unsigned_upload, header_tag_name,
};
use crate::error::ApiError;
use crate::multipart::{create_upload, finalize_upload, put_chunk, upload_status};
use crate::payment::settle_and_record;
use crate::services::Services;
use ans104::Tag;
use axum::Json;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, MatchedPath, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use base64::Engine;
use serde::Deserialize;
use std::sync::Arc;
use store::payments::MODE_PAYG;
use x402::{Network, PaymentRequirements, PaymentResponseHeader, TokenTag};

type App = Arc<Services>;

pub fn router(services: App) -> axum::Router {
    let max_body = services.cfg.upload.max_upload_bytes.min(usize::MAX as u64) as usize;
    axum::Router::new()
        .merge(api_routes())
        .nest("/v1", api_routes())
        .layer(axum::middleware::from_fn_with_state(
            services.clone(),
            track_requests,
        ))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(services)
}

fn api_routes() -> axum::Router<App> {
    axum::Router::new()
        .route("/", get(info_doc))
        .route("/info", get(info_doc))
        .route("/health", get(health))
        .route("/bundler_metrics", get(metrics_text))
        .route("/x402/upload/signed", post(upload_signed))
        .route("/x402/upload/unsigned", post(upload_unsigned))
        .route("/tx", post(upload_legacy_bare))
        .route("/tx/{id}", post(upload_legacy))
        .route("/tx/{id}/status", get(tx_status))
        .route("/tx/{id}/offsets", get(tx_offsets))
        .route("/x402/price/{signature_type}/{address}", get(legacy_price))
        .route(
            "/x402/payment/{signature_type}/{address}",
            post(standalone_payment),
        )
        .route("/price/x402/data-item/{token}/{byte_count}", get(price_quote))
        .route("/price/x402/data/{token}/{byte_count}", get(price_quote))
        .route(
            "/chunks/{token}/{upload_id}/{offset}",
            get(chunks_get).post(chunks_post),
        )
        .route("/chunks/{token}/{upload_id}/finalize", post(chunks_finalize))
}

async fn track_requests(State(services): State<App>, req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let resp = next.run(req).await;
    services
        .telemetry
        .http_request(&route, resp.status().as_u16());
    resp
}

fn network_from_token(token: &str) -> Result<Network, ApiError> {
    TokenTag::parse(token)
        .map(|t| t.network)
        .map_err(|err| ApiError::BadRequest(format!("{err:#}")))
}

fn payment_header(headers: &HeaderMap) -> Option<&str> {
    headers.get("x-payment").and_then(|v| v.to_str().ok())
}

/// Receipt body plus payer/owner fields and the `X-Payment-Response` header.
fn upload_response(outcome: UploadOutcome) -> Result<Response, ApiError> {
    let mut body = serde_json::to_value(&outcome.receipt)
        .map_err(|e| ApiError::Internal(e.into()))?;
    body["owner"] = serde_json::Value::String(outcome.owner_address.clone());

    let mut headers = HeaderMap::new();
    let status = if let Some(payment) = &outcome.payment {
        body["payer"] = serde_json::Value::String(payment.payer.clone());
        let response_header = PaymentResponseHeader {
            payment_id: payment.payment_id.clone(),
            transaction_hash: payment.tx_hash.clone(),
            network: payment.network,
            mode: payment.mode.clone(),
        };
        headers.insert(
            "x-payment-response",
            response_header
                .encode()
                .parse()
                .map_err(|_| ApiError::Internal(anyhow::anyhow!("encode payment response")))?,
        );
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((status, headers, Json(body)).into_response())
}

async fn info_doc(State(services): State<App>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "gateway": services.cfg.server.gateway_fqdn,
        "addresses": {
            "ethereum": format!("{:#x}", services.wallet.evm_address()),
            "arweave": services.wallet.owner_address(),
        },
        "freeUploadLimitBytes": services.cfg.upload.free_upload_limit_bytes,
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn metrics_text(State(services): State<App>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        services.telemetry.encode(),
    )
        .into_response()
}

async fn upload_signed(
    State(services): State<App>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let outcome = handle_signed_upload(
        &services,
        Network::Base,
        "/x402/upload/signed",
        payment_header(&headers),
        &body,
    )
    .await?;
    upload_response(outcome)
}

fn caller_tags_from_headers(headers: &HeaderMap) -> Vec<Tag> {
    let mut tags = Vec::new();
    for (name, value) in headers {
        let name = name.as_str().to_ascii_lowercase();
        if let Some(stripped) = name.strip_prefix("x-tag-") {
            if stripped.is_empty() {
                continue;
            }
            if let Ok(value) = value.to_str() {
                tags.push(Tag::new(header_tag_name(&name), value));
            }
        }
    }
    tags
}

async fn upload_unsigned(
    State(services): State<App>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let is_json = content_type
        .as_deref()
        .map(|ct| ct.starts_with("application/json"))
        .unwrap_or(false);

    let (payload, tags, payload_content_type) = if is_json {
        let envelope: UnsignedEnvelope = serde_json::from_slice(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid upload envelope: {e}")))?;
        let payload = base64::engine::general_purpose::STANDARD
            .decode(envelope.data.trim())
            .map_err(|e| ApiError::BadRequest(format!("envelope data is not base64: {e}")))?;
        let tags = envelope
            .tags
            .into_iter()
            .map(|EnvelopeTag { name, value }| Tag::new(name, value))
            .collect();
        (payload, tags, envelope.content_type)
    } else {
        (
            body.to_vec(),
            caller_tags_from_headers(&headers),
            content_type,
        )
    };

    let outcome = handle_unsigned_upload(
        &services,
        Network::Base,
        "/x402/upload/unsigned",
        payment_header(&headers),
        &payload,
        tags,
        payload_content_type,
    )
    .await?;
    upload_response(outcome)
}

async fn upload_legacy_bare(
    State(services): State<App>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    legacy_upload_inner(services, Network::Base, headers, body).await
}

async fn upload_legacy(
    State(services): State<App>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let network = network_from_token(&token)?;
    legacy_upload_inner(services, network, headers, body).await
}

async fn legacy_upload_inner(
    services: App,
    network: Network,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let outcome = handle_legacy_upload(
        &services,
        network,
        "/tx",
        payment_header(&headers),
        &body,
        content_type,
        caller_tags_from_headers(&headers),
    )
    .await?;
    upload_response(outcome)
}

async fn tx_status(
    State(services): State<App>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = services
        .db
        .data_item_status(&id)
        .await
        .map_err(ApiError::Transient)?
        .ok_or(ApiError::NotFound)?;
    let receipt: Option<serde_json::Value> = status
        .receipt_json
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok());
    Ok(Json(serde_json::json!({
        "id": status.data_item_id,
        "status": status.status,
        "receipt": receipt,
        "bundleId": status.bundle_id,
        "blockHeight": status.block_height,
        "failedReason": status.failed_reason,
    })))
}

async fn tx_offsets(
    State(services): State<App>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let offsets = services
        .db
        .get_offsets(&id)
        .await
        .map_err(ApiError::Transient)?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(serde_json::json!({
        "id": offsets.data_item_id,
        "rootBundleId": offsets.root_bundle_id,
        "startOffsetInRootBundle": offsets.start_offset_in_root,
        "rawContentLength": offsets.raw_content_length,
        "payloadDataStart": offsets.payload_data_start,
        "payloadContentType": offsets.payload_content_type,
        "parentDataItemId": offsets.parent_data_item_id,
        "startOffsetInParent": offsets.start_offset_in_parent,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyPriceQuery {
    #[serde(default)]
    byte_count: Option<u64>,
}

async fn legacy_price(
    State(services): State<App>,
    Path((signature_type, address)): Path<(String, String)>,
    Query(query): Query<LegacyPriceQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let byte_count = query.byte_count.unwrap_or(0);
    let quote = timed_quote(&services, byte_count).await?;
    Ok(Json(serde_json::json!({
        "signatureType": signature_type,
        "address": address,
        "byteCount": byte_count,
        "winc": quote.winc.to_string(),
        "usdcAtomic": quote.usdc_atomic.to_string(),
    })))
}

/// Standalone payment creation, used to fund a multipart deposit. The
/// settled payment stays unbound until `createUpload` claims it.
async fn standalone_payment(
    State(services): State<App>,
    Path((signature_type, address)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let requirements = PaymentRequirements::usdc(
        Network::Base,
        services.cfg.payment.pay_to,
        services.pricing.deposit_usdc().to_string(),
        format!("/x402/payment/{signature_type}/{address}"),
        "standalone payment".to_string(),
        "application/octet-stream".to_string(),
    );
    let Some(header_value) = payment_header(&headers) else {
        return Err(ApiError::payment_required(requirements, "payment required"));
    };
    let settled =
        settle_and_record(&services, header_value, &requirements, MODE_PAYG, None, "0").await?;

    let response_header = PaymentResponseHeader {
        payment_id: settled.payment_id.clone(),
        transaction_hash: settled.tx_hash.clone(),
        network: settled.network,
        mode: settled.mode.clone(),
    };
    let mut headers = HeaderMap::new();
    headers.insert(
        "x-payment-response",
        response_header
            .encode()
            .parse()
            .map_err(|_| ApiError::Internal(anyhow::anyhow!("encode payment response")))?,
    );
    Ok((
        StatusCode::CREATED,
        headers,
        Json(serde_json::json!({
            "paymentId": settled.payment_id,
            "transactionHash": settled.tx_hash,
            "network": settled.network.as_str(),
            "mode": settled.mode,
            "payer": settled.payer,
        })),
    )
        .into_response())
}

async fn price_quote(
    State(services): State<App>,
    Path((token, byte_count)): Path<(String, u64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let network = network_from_token(&token)?;
    let quote = timed_quote(&services, byte_count).await?;
    Ok(Json(serde_json::json!({
        "network": network.as_str(),
        "byteCount": byte_count,
        "winc": quote.winc.to_string(),
        "usdcAtomic": quote.usdc_atomic.to_string(),
    })))
}

async fn timed_quote(
    services: &Services,
    byte_count: u64,
) -> Result<crate::pricing::Quote, ApiError> {
    let started = std::time::Instant::now();
    let quote = services.pricing.quote_usdc_for_bytes(byte_count, 0).await;
    services
        .telemetry
        .quote_ms(quote.is_ok(), started.elapsed().as_millis() as u64);
    quote.map_err(ApiError::Transient)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateUploadQuery {
    deposit_payment_id: Option<String>,
    chunk_size: Option<i64>,
}

async fn chunks_get(
    State(services): State<App>,
    Path((token, upload_id, offset)): Path<(String, String, String)>,
    Query(query): Query<CreateUploadQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let network = network_from_token(&token)?;
    if upload_id == "-1" && offset == "-1" {
        let deposit = query.deposit_payment_id.ok_or_else(|| {
            ApiError::BadRequest("depositPaymentId query parameter is required".into())
        })?;
        let created = create_upload(&services, network, &deposit, query.chunk_size).await?;
        return Ok(Json(serde_json::to_value(created).map_err(|e| {
            ApiError::Internal(e.into())
        })?));
    }
    if offset == "-1" {
        let status = upload_status(&services, &upload_id).await?;
        return Ok(Json(serde_json::to_value(status).map_err(|e| {
            ApiError::Internal(e.into())
        })?));
    }
    Err(ApiError::BadRequest(
        "chunk offsets cannot be fetched".into(),
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeQuery {
    declared_byte_count: Option<i64>,
}

async fn chunks_post(
    State(services): State<App>,
    Path((token, upload_id, offset)): Path<(String, String, String)>,
    Query(query): Query<FinalizeQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let network = network_from_token(&token)?;
    if offset == "-1" {
        return finalize_response(services, network, upload_id, query, headers).await;
    }
    let offset: i64 = offset
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid chunk offset: {offset}")))?;
    put_chunk(&services, &upload_id, offset, &body).await?;
    Ok((StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response())
}

async fn chunks_finalize(
    State(services): State<App>,
    Path((token, upload_id)): Path<(String, String)>,
    Query(query): Query<FinalizeQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let network = network_from_token(&token)?;
    finalize_response(services, network, upload_id, query, headers).await
}

async fn finalize_response(
    services: App,
    network: Network,
    upload_id: String,
    query: FinalizeQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let finalized = finalize_upload(
        &services,
        network,
        &upload_id,
        query.declared_byte_count,
        payment_header(&headers),
    )
    .await?;
    let mut body = serde_json::to_value(&finalized.receipt)
        .map_err(|e| ApiError::Internal(e.into()))?;
    body["uploadId"] = serde_json::Value::String(upload_id);
    body["paymentIds"] = serde_json::to_value(&finalized.payment_ids)
        .map_err(|e| ApiError::Internal(e.into()))?;
    Ok((StatusCode::OK, Json(body)).into_response())
}
