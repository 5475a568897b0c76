use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Gateway listen address, HTTP only.
    pub listen_addr: String,

    /// Tokio runtime worker threads.
    pub worker_threads: Option<usize>,

    /// Upstream request timeout (ms). For streams this bounds the wait for response headers.
    pub request_timeout_ms: u64,

    /// Tokens accepted in `X-Admin-Token` for management API requests.
    pub admin_tokens: Vec<String>,

    /// Directory for persistent data (sled db, dead-letter log).
    pub data_dir: PathBuf,

    /// Gateway-wide ceiling applied to `max_tokens` before forwarding.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u64,

    /// Model prices are expressed in credits per `price_unit` tokens.
    #[serde(default = "default_price_unit")]
    pub price_unit: i64,

    /// Credited to every newly created user.
    #[serde(default)]
    pub default_user_balance: i64,

    /// Take the caller IP from `X-Forwarded-For` instead of the socket peer.
    #[serde(default)]
    pub trust_forwarded_for: bool,

    #[serde(default)]
    pub bloom_filter: BloomFilterConfig,

    #[serde(default)]
    pub metering: MeteringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BloomFilterConfig {
    pub enable: bool,
    /// Expected number of user keys.
    pub capacity: usize,
    pub false_positive_rate: f64,
}

impl Default for BloomFilterConfig {
    fn default() -> Self {
        Self {
            enable: true,
            capacity: 100_000,
            false_positive_rate: 0.001,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeteringConfig {
    /// Bounded settlement queue between responses and ledger writes.
    pub queue_capacity: usize,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
        }
    }
}

fn default_max_output_tokens() -> u64 {
    4096
}

fn default_price_unit() -> i64 {
    1000
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let s = fs::read_to_string(path)?;
        Self::from_toml(&s)
    }

    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        let mut cfg: Config = toml::from_str(s)?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    fn normalize(&mut self) {
        for t in self.admin_tokens.iter_mut() {
            *t = t.trim().to_string();
        }
        self.admin_tokens.retain(|t| !t.is_empty());
        self.listen_addr = self.listen_addr.trim().to_string();
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.admin_tokens.is_empty() {
            anyhow::bail!("config: admin_tokens must not be empty");
        }
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("config: listen_addr must be a socket address");
        }
        if self.max_output_tokens == 0 {
            anyhow::bail!("config: max_output_tokens must be positive");
        }
        if self.price_unit <= 0 {
            anyhow::bail!("config: price_unit must be positive");
        }
        if self.default_user_balance < 0 {
            anyhow::bail!("config: default_user_balance must not be negative");
        }
        let bf = &self.bloom_filter;
        if bf.enable {
            if bf.capacity == 0 {
                anyhow::bail!("config: bloom_filter.capacity must be positive");
            }
            if !(bf.false_positive_rate > 0.0 && bf.false_positive_rate < 1.0) {
                anyhow::bail!("config: bloom_filter.false_positive_rate must be in (0, 1)");
            }
        }
        if self.metering.queue_capacity == 0 {
            anyhow::bail!("config: metering.queue_capacity must be positive");
        }
        Ok(())
    }
}
