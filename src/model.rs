use serde::{Deserialize, Serialize};

/// An upstream provider account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: u64,
    /// Unique display name; permissions are granted by this name.
    pub name: String,
    pub api_key: String,
    /// Base endpoint including the version prefix, e.g. `https://api.openai.com/v1`.
    pub endpoint: String,
    pub weight: u32,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// A priced capability offered by exactly one client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: u64,
    pub client_id: u64,
    pub name: String,
    /// Zero means "no model-specific ceiling".
    pub max_tokens: u64,
    pub prompt_price: i64,
    pub completion_price: i64,
    pub rpm_limit: Option<u32>,
    pub tpm_limit: Option<u32>,
    pub updated_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    System,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// A gateway consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub api_key: String,
    pub email: String,
    pub role: Role,
    pub language: String,
    /// Literal IPs and CIDR blocks. Empty means any caller.
    pub allow_ips: Vec<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

/// Right of a user to consume one client+model pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Grant {
    pub client_id: u64,
    pub model_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerAction {
    Initial,
    Consumption,
    Recharge,
    Gift,
    Special,
}

impl LedgerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerAction::Initial => "initial",
            LedgerAction::Consumption => "consumption",
            LedgerAction::Recharge => "recharge",
            LedgerAction::Gift => "gift",
            LedgerAction::Special => "special",
        }
    }

    /// Actions an administrator may record by hand.
    pub fn parse_manual(s: &str) -> Option<Self> {
        match s {
            "recharge" => Some(LedgerAction::Recharge),
            "gift" => Some(LedgerAction::Gift),
            "special" => Some(LedgerAction::Special),
            _ => None,
        }
    }
}

/// One append-only balance change. `remaining` is the snapshot after applying `change`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: u64,
    pub owner_id: u64,
    /// Position in the owner's history, starting at 1 for the baseline.
    pub seq: u64,
    pub change: i64,
    pub remaining: i64,
    pub action: LedgerAction,
    pub reason: String,
    pub created_at_ms: u64,
}

/// One row per settled proxied call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: u64,
    pub client_id: u64,
    pub model_id: u64,
    pub user_id: u64,
    pub caller_ip: String,
    pub request_id: String,
    pub trace_id: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: i64,
    pub created_at_ms: u64,
}

/// What the router needs to reach a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSecret {
    pub client_id: u64,
    pub api_key: String,
    pub endpoint: String,
}

/// The (client, model, user) join evaluated during one selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateView {
    pub client_id: u64,
    pub client_balance: i64,
    pub client_weight: u32,
    pub user_id: u64,
    pub user_balance: i64,
    pub user_role: Role,
    pub model_id: u64,
    pub model_name: String,
    pub model_max_tokens: u64,
    pub prompt_price: i64,
    pub completion_price: i64,
}
