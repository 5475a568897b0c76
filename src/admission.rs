use crate::directory::Directory;
use crate::error::GatewayError;
use crate::filter::KeyFilter;
use crate::model::User;
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;

/// First gate of every inference request: key lookup plus caller IP check.
pub struct Admission {
    directory: Arc<dyn Directory>,
    filter: KeyFilter,
}

impl Admission {
    pub fn new(directory: Arc<dyn Directory>, filter: KeyFilter) -> Self {
        Self { directory, filter }
    }

    /// Loads every known user key into the filter.
    pub fn warm(&self) -> anyhow::Result<usize> {
        let keys = self.directory.list_user_api_keys()?;
        for k in &keys {
            self.filter.insert(k);
        }
        Ok(keys.len())
    }

    /// Must be called for every key minted or refreshed after startup.
    pub fn register_key(&self, api_key: &str) {
        self.filter.insert(api_key);
    }

    pub fn authorize(&self, raw_key: &str, caller_ip: IpAddr) -> Result<User, GatewayError> {
        let key = strip_bearer(raw_key);
        if key.is_empty() || !self.filter.might_contain(key) {
            return Err(GatewayError::Unauthenticated);
        }
        let Some(user) = self.directory.find_user_by_key(key)? else {
            return Err(GatewayError::Unauthenticated);
        };
        if !ip_allowed(&user.allow_ips, caller_ip) {
            tracing::debug!(user_id = user.id, %caller_ip, "caller ip not in allow list");
            return Err(GatewayError::IpForbidden);
        }
        Ok(user)
    }
}

fn strip_bearer(raw: &str) -> &str {
    let raw = raw.trim();
    match raw.get(..7) {
        Some(p) if p.eq_ignore_ascii_case("bearer ") => raw[7..].trim(),
        _ => raw,
    }
}

/// True when `allow` is empty or any entry (an IP or CIDR block, optionally
/// several comma-separated in one string) matches `ip`.
pub fn ip_allowed(allow: &[String], ip: IpAddr) -> bool {
    let mut entries = allow
        .iter()
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .peekable();
    if entries.peek().is_none() {
        return true;
    }
    entries.any(|e| entry_matches(e, ip))
}

fn entry_matches(entry: &str, ip: IpAddr) -> bool {
    let ip = canonical(ip);
    if entry.contains('/') {
        return match entry.parse::<IpNet>() {
            Ok(net) => net.contains(&ip),
            Err(_) => false,
        };
    }
    entry.parse::<IpAddr>().map(canonical) == Ok(ip)
}

/// Folds IPv4-mapped IPv6 addresses back to IPv4.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}
