use crate::error::GatewayError;
use bytes::Bytes;
use hyper::{Body, Request};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Very small query parser for `?a=b&c=d`.
/// Returns value for `key` if present. No percent-decoding (ids and timestamps only).
#[inline]
pub fn query_get<'a>(uri: &'a http::Uri, key: &str) -> Option<&'a str> {
    let q = uri.query()?;
    for part in q.split('&') {
        let mut it = part.splitn(2, '=');
        let k = it.next()?;
        if k == key {
            return it.next();
        }
    }
    None
}

/// Typed variant of [`query_get`]; unparsable values count as absent.
pub fn query_parse<T: FromStr>(uri: &http::Uri, key: &str) -> Option<T> {
    query_get(uri, key).and_then(|v| v.parse().ok())
}

/// `sk-abc1****wxyz`: keeps the first 6 and last 4 characters of longer
/// secrets. Secrets of 10 characters or fewer are masked entirely.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 10 {
        return "*".repeat(chars.len());
    }
    let mut out = String::with_capacity(chars.len());
    out.extend(&chars[..6]);
    out.extend(std::iter::repeat('*').take(chars.len() - 10));
    out.extend(&chars[chars.len() - 4..]);
    out
}

/// Buffers the request body, refusing anything larger than `limit` bytes.
pub async fn read_body_limit(mut req: Request<Body>, limit: usize) -> Result<Bytes, GatewayError> {
    use hyper::body::HttpBody;
    let mut buf = Vec::new();
    while let Some(chunk) = req.body_mut().data().await {
        let chunk = chunk.map_err(|e| GatewayError::BadRequest(format!("failed to read body: {e}")))?;
        if buf.len() + chunk.len() > limit {
            return Err(GatewayError::PayloadTooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buf))
}
