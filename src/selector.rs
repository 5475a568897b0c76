use crate::directory::Directory;
use crate::error::GatewayError;
use crate::model::CandidateView;
use crate::upstream::{UpstreamClient, UpstreamPool};
use std::sync::Arc;

/// The winning candidate together with a live handle to its client.
pub struct Selection {
    pub upstream: Arc<UpstreamClient>,
    pub candidate: CandidateView,
}

pub struct Selector {
    directory: Arc<dyn Directory>,
    pool: Arc<UpstreamPool>,
    price_unit: i64,
}

impl Selector {
    pub fn new(directory: Arc<dyn Directory>, pool: Arc<UpstreamPool>, price_unit: i64) -> Self {
        Self {
            directory,
            pool,
            price_unit,
        }
    }

    pub fn select(
        &self,
        api_key: &str,
        model_name: &str,
        estimated_prompt_tokens: u64,
    ) -> Result<Selection, GatewayError> {
        let candidates = self.directory.find_candidates(model_name, api_key)?;
        let Some(candidate) = pick(candidates, estimated_prompt_tokens, self.price_unit) else {
            tracing::debug!(model = model_name, estimated_prompt_tokens, "no affordable candidate");
            return Err(GatewayError::NoAvailableClient);
        };
        tracing::debug!(
            client_id = candidate.client_id,
            model_id = candidate.model_id,
            model = model_name,
            "client selected"
        );
        let upstream = self.pool.get_or_create(candidate.client_id)?;
        Ok(Selection { upstream, candidate })
    }
}

/// Both balances must cover the estimated prompt cost.
pub fn affordable(c: &CandidateView, estimated_prompt_tokens: u64, price_unit: i64) -> bool {
    let need = estimated_prompt_tokens as i128 * c.prompt_price as i128;
    let unit = price_unit as i128;
    c.client_balance as i128 * unit >= need && c.user_balance as i128 * unit >= need
}

/// `floor(client_balance / prompt_price) * weight`; a free model scores highest.
pub fn score(c: &CandidateView) -> u128 {
    if c.client_balance <= 0 {
        return 0;
    }
    let runway = if c.prompt_price <= 0 {
        u64::MAX as u128
    } else {
        (c.client_balance / c.prompt_price) as u128
    };
    runway.saturating_mul(c.client_weight as u128)
}

/// Highest score wins; ties go to the earliest candidate in input order.
pub fn pick(
    candidates: Vec<CandidateView>,
    estimated_prompt_tokens: u64,
    price_unit: i64,
) -> Option<CandidateView> {
    let mut best: Option<(u128, CandidateView)> = None;
    for c in candidates {
        if !affordable(&c, estimated_prompt_tokens, price_unit) {
            continue;
        }
        let s = score(&c);
        match &best {
            Some((top, _)) if s <= *top => {}
            _ => best = Some((s, c)),
        }
    }
    best.map(|(_, c)| c)
}
