//! Payment orchestration for paid uploads: decode the `X-PAYMENT` header,
//! verify locally, optionally re-verify through facilitators, settle, and
//! record the ledger row. The ordering is fixed:
//! verify -> settle -> insert(pending_validation, tx_hash) -> link, and a
//! replayed request short-circuits on the tx_hash collision to the original
//! payment id.

use crate::error::ApiError;
use crate::services::Services;
use anyhow::Context;
use std::time::Instant;
use store::payments::NewPayment;
use x402::verify::verify_payment;
use x402::{Network, PaymentPayload, PaymentRequirements, decode_payment_header};

#[derive(Debug, Clone)]
pub struct SettledPayment {
    pub payment_id: String,
    pub tx_hash: String,
    pub network: Network,
    pub payer: String,
    pub usdc_amount: String,
    pub mode: String,
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn decode_header(
    header: &str,
    requirements: &PaymentRequirements,
) -> Result<PaymentPayload, ApiError> {
    decode_payment_header(header).map_err(|err| {
        ApiError::payment_required(requirements.clone(), format!("invalid X-PAYMENT: {err:#}"))
    })
}

/// Runs the whole payment path for one upload request. On success the ledger
/// holds a `pending_validation` row the caller links to its target.
pub async fn settle_and_record(
    services: &Services,
    header: &str,
    requirements: &PaymentRequirements,
    mode: &str,
    declared_byte_count: Option<i64>,
    winc_amount: &str,
) -> Result<SettledPayment, ApiError> {
    let payload = decode_header(header, requirements)?;

    // Local EOA verification first. Configured facilitators are consulted on
    // top: they re-check on-chain state, and their simulation is what covers
    // ERC-1271 contract-wallet signatures that EOA recovery cannot.
    let local = verify_payment(&payload, requirements, now_secs());
    let payer = match &local {
        Ok(payer) => *payer,
        Err(_) => payload.payload.authorization.from,
    };
    match local {
        Err(err) if !services.facilitators.is_configured() => {
            services.telemetry.payment(mode, "invalid");
            return Err(ApiError::payment_required(
                requirements.clone(),
                format!("payment invalid: {err}"),
            ));
        }
        local => {
            if services.facilitators.is_configured() {
                if let Err(fac_err) = services.facilitators.verify(&payload, requirements).await {
                    services.telemetry.payment(mode, "invalid");
                    let reason = match local {
                        Ok(_) => format!("payment invalid: {fac_err:#}"),
                        Err(err) => format!("payment invalid: {err}; {fac_err:#}"),
                    };
                    return Err(ApiError::payment_required(requirements.clone(), reason));
                }
            }
        }
    }

    if !services.facilitators.is_configured() {
        services.telemetry.payment(mode, "unsettleable");
        return Err(ApiError::payment_required(
            requirements.clone(),
            "no payment facilitator configured",
        ));
    }

    let started = Instant::now();
    let settlement = services
        .facilitators
        .settle(&payload, requirements)
        .await
        .map_err(|err| {
            services
                .telemetry
                .settle_ms(false, started.elapsed().as_millis() as u64);
            services.telemetry.payment(mode, "settle_failed");
            ApiError::payment_required(
                requirements.clone(),
                format!("payment settlement failed: {err:#}"),
            )
        })?;
    services
        .telemetry
        .settle_ms(true, started.elapsed().as_millis() as u64);

    let payer = format!("{payer:#x}");
    let payment_id = services
        .db
        .insert_payment(&NewPayment {
            tx_hash: settlement.transaction_hash.clone(),
            network: settlement.network.as_str().to_string(),
            payer_address: payer.clone(),
            usdc_amount: payload.payload.authorization.value.clone(),
            winc_amount: winc_amount.to_string(),
            mode: mode.to_string(),
            declared_byte_count,
            paid_at: store::now_ms(),
        })
        .await
        .context("record payment")
        .map_err(ApiError::Transient)?;

    services.telemetry.payment(mode, "settled");
    tracing::info!(
        payment_id = %payment_id,
        tx = %settlement.transaction_hash,
        network = settlement.network.as_str(),
        payer = %payer,
        "payment settled"
    );

    Ok(SettledPayment {
        payment_id,
        tx_hash: settlement.transaction_hash,
        network: settlement.network,
        payer,
        usdc_amount: payload.payload.authorization.value,
        mode: mode.to_string(),
    })
}
