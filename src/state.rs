use crate::admission::Admission;
use crate::billing::{Meter, MeterCore};
use crate::config::Config;
use crate::filter::KeyFilter;
use crate::selector::Selector;
use crate::storage::Store;
use crate::upstream::{build_http_client, UpstreamPool};
use ahash::AHashSet;
use hyper::{Body, Request};
use std::sync::Arc;
use std::time::Duration;

pub const HDR_ADMIN_TOKEN: &str = "x-admin-token";

/// Process-scoped services shared by every connection.
pub struct GatewayState {
    pub store: Arc<Store>,
    pub admission: Admission,
    pub pool: Arc<UpstreamPool>,
    pub selector: Selector,
    pub meter: Meter,
    pub max_output_tokens: u64,
    pub price_unit: i64,
    pub default_user_balance: i64,
    pub trust_forwarded_for: bool,
    admin_tokens: AHashSet<String>,
}

impl GatewayState {
    /// Opens the database under `data_dir`; must run inside a tokio runtime.
    pub fn new(cfg: Config) -> anyhow::Result<Self> {
        let store = Arc::new(Store::open(&cfg.data_dir)?);
        Self::with_store(cfg, store)
    }

    pub fn with_store(cfg: Config, store: Arc<Store>) -> anyhow::Result<Self> {
        let filter = if cfg.bloom_filter.enable {
            KeyFilter::new(cfg.bloom_filter.capacity, cfg.bloom_filter.false_positive_rate)
        } else {
            KeyFilter::disabled()
        };
        let admission = Admission::new(store.clone(), filter);
        let warmed = admission.warm()?;
        tracing::info!(keys = warmed, enabled = cfg.bloom_filter.enable, "key filter built");

        let timeout = Duration::from_millis(cfg.request_timeout_ms);
        let pool = Arc::new(UpstreamPool::new(store.clone(), build_http_client(), timeout));
        let selector = Selector::new(store.clone(), pool.clone(), cfg.price_unit);

        std::fs::create_dir_all(&cfg.data_dir)?;
        let core = MeterCore::new(store.clone(), store.clone(), cfg.price_unit)
            .with_dead_letter(cfg.data_dir.join("billing_dead_letter.jsonl"));
        let meter = Meter::start(core, cfg.metering.queue_capacity)?;

        let admin_tokens = cfg.admin_tokens.iter().cloned().collect();

        Ok(Self {
            store,
            admission,
            pool,
            selector,
            meter,
            max_output_tokens: cfg.max_output_tokens,
            price_unit: cfg.price_unit,
            default_user_balance: cfg.default_user_balance,
            trust_forwarded_for: cfg.trust_forwarded_for,
            admin_tokens,
        })
    }

    #[inline]
    pub fn authorize_admin_header(&self, req: &Request<Body>) -> bool {
        let Some(h) = req.headers().get(HDR_ADMIN_TOKEN) else {
            return false;
        };
        match h.to_str() {
            Ok(s) => self.admin_tokens.contains(s.trim()),
            Err(_) => false,
        }
    }

    /// Settles outstanding charges and flushes the database.
    pub async fn shutdown(&self) {
        self.meter.shutdown().await;
        if let Err(e) = self.store.flush() {
            tracing::warn!(error = %e, "db flush on shutdown failed");
        }
    }
}

/// Fresh user API key.
pub fn mint_api_key() -> String {
    format!("tg-{}", uuid::Uuid::new_v4().simple())
}
