//! Process-wide service container handed to every request handler. Owned by
//! the server bootstrap; torn down on shutdown after the listener drains.

use crate::chain_info::ChainInfoClient;
use crate::config::{AppConfig, ObjectStoreMode};
use crate::metrics::Telemetry;
use crate::pricing::PricingOracle;
use ans104::sign::ServerWallet;
use anyhow::Result;
use store::{Db, ObjectStore};
use x402::facilitator::FacilitatorClient;

pub struct Services {
    pub cfg: AppConfig,
    pub db: Db,
    pub objects: ObjectStore,
    pub wallet: ServerWallet,
    pub pricing: PricingOracle,
    pub chain: ChainInfoClient,
    pub facilitators: FacilitatorClient,
    pub telemetry: Telemetry,
}

impl Services {
    pub async fn new(cfg: AppConfig, telemetry: Telemetry) -> Result<Self> {
        let db = Db::connect(&cfg.db_url, cfg.db_max_connections).await?;
        db.migrate().await?;

        let objects = match cfg.object_store.mode {
            ObjectStoreMode::Fs => ObjectStore::fs(&cfg.object_store.root),
            ObjectStoreMode::Mem => ObjectStore::mem(),
        };
        let wallet = ServerWallet::from_private_key(cfg.upload.server_private_key)?;
        let pricing = PricingOracle::new(cfg.pricing.clone());
        let chain = ChainInfoClient::new(
            cfg.server.chain_info_url.clone(),
            cfg.server.chain_height_ttl,
            cfg.server.chain_height_override,
        );
        let facilitators = FacilitatorClient::new(cfg.payment.facilitators.clone());

        Ok(Self {
            cfg,
            db,
            objects,
            wallet,
            pricing,
            chain,
            facilitators,
            telemetry,
        })
    }
}
