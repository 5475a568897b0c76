use crate::model::{CandidateView, ClientSecret, Grant, Model, User};
use crate::permissions::GrantDiff;
use std::collections::{BTreeMap, BTreeSet};

/// Read access to clients, models, users and the permission graph.
pub trait Directory: Send + Sync {
    fn find_user_by_key(&self, api_key: &str) -> anyhow::Result<Option<User>>;

    /// All (client, model, user) joins where `api_key` owns a grant on a model
    /// named `model_name` whose client balance is currently positive, ordered by
    /// ascending client id.
    fn find_candidates(&self, model_name: &str, api_key: &str) -> anyhow::Result<Vec<CandidateView>>;

    fn find_client_secret(&self, client_id: u64) -> anyhow::Result<Option<ClientSecret>>;

    fn list_models_for_client(&self, client_id: u64) -> anyhow::Result<Vec<Model>>;

    /// Models reachable through the grants of the user owning `api_key`.
    fn list_models_for_key(&self, api_key: &str) -> anyhow::Result<Vec<Model>>;

    /// Every user key, used once to warm the key filter.
    fn list_user_api_keys(&self) -> anyhow::Result<Vec<String>>;

    fn grants(&self, user_id: u64) -> anyhow::Result<BTreeSet<Grant>>;

    /// Maps `client name -> model names` to grants; fails if any name is unknown.
    fn resolve_grants(&self, desired: &BTreeMap<String, Vec<String>>) -> anyhow::Result<BTreeSet<Grant>>;

    /// Atomically replaces the stored grant set with `desired`, returning what changed.
    fn reconcile_grants(&self, user_id: u64, desired: &BTreeSet<Grant>) -> anyhow::Result<GrantDiff>;
}
