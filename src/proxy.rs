use crate::admin;
use crate::billing::Charge;
use crate::directory::Directory;
use crate::error::GatewayError;
use crate::model::{CandidateView, User};
use crate::openai::{
    extract_usage, json_body, ChatCompletionRequest, EmbeddingRequest, GzipDecoder,
    SpeechRequest, SseRelay, TokenUsage,
};
use crate::selector::Selection;
use crate::state::GatewayState;
use crate::upstream::{sanitize_hop_headers, UpstreamReply};
use crate::util::read_body_limit;
use bytes::Bytes;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use std::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

const MAX_REQUEST_BODY_BYTES: usize = 16 * 1024 * 1024;
const HDR_TRACE_ID: &str = "x-trace-id";

/// Serves until `shutdown` resolves, then lets in-flight requests finish.
pub async fn serve<F>(listener: TcpListener, state: Arc<GatewayState>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    listener.set_nonblocking(true)?;
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let state = state.clone();
        let remote_addr = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(req, state, remote_addr).await) }
            }))
        }
    });

    Server::from_tcp(listener)?
        .tcp_nodelay(true)
        .serve(make_svc)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[derive(Clone, Copy)]
enum Route {
    Models,
    Chat,
    Embeddings,
    Speech,
}

/// The authenticated caller of one request.
struct Caller {
    user: User,
    ip: IpAddr,
    trace_id: String,
}

async fn handle(req: Request<Body>, state: Arc<GatewayState>, peer: SocketAddr) -> Response<Body> {
    let path = req.uri().path().to_string();

    if req.method() == Method::GET && path == "/health" {
        return Response::new(Body::from("ok"));
    }
    if path.starts_with("/admin") {
        return admin::handle_admin(req, state).await;
    }

    let route = match (req.method(), path.trim_end_matches('/')) {
        (&Method::GET, "/v1/models") => Route::Models,
        (&Method::POST, "/v1/chat/completions") => Route::Chat,
        (&Method::POST, "/v1/embeddings") => Route::Embeddings,
        (&Method::POST, "/v1/audio/speech") => Route::Speech,
        _ => return GatewayError::NotFound.into_response(),
    };

    let start = Instant::now();
    let ip = caller_ip(req.headers(), peer, state.trust_forwarded_for);
    let trace_id = trace_id(req.headers());
    let raw_key = extract_api_key(req.headers()).unwrap_or_default();
    let user = match state.admission.authorize(&raw_key, ip) {
        Ok(u) => u,
        Err(e) => {
            tracing::debug!(%ip, path = %path, error = %e, "admission refused");
            return with_trace(e.into_response(), &trace_id);
        }
    };
    let caller = Caller { user, ip, trace_id };

    let result = match route {
        Route::Models => list_models(&state, &caller),
        Route::Chat => chat(req, &state, &caller).await,
        Route::Embeddings => embeddings(req, &state, &caller).await,
        Route::Speech => speech(req, &state, &caller).await,
    };

    let resp = match result {
        Ok(resp) => resp,
        Err(e) => {
            match &e {
                GatewayError::LedgerInconsistency(_) => {
                    tracing::error!(trace_id = %caller.trace_id, error = %e, "ledger inconsistency")
                }
                e if e.status().is_server_error() => {
                    tracing::warn!(trace_id = %caller.trace_id, path = %path, error = %e, "request failed")
                }
                _ => {}
            }
            e.into_response()
        }
    };
    tracing::debug!(
        trace_id = %caller.trace_id,
        user_id = caller.user.id,
        path = %path,
        status = resp.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request done"
    );
    with_trace(resp, &caller.trace_id)
}

fn list_models(state: &GatewayState, caller: &Caller) -> Result<Response<Body>, GatewayError> {
    let models = state.store.list_models_for_key(&caller.user.api_key)?;
    let mut by_name: BTreeMap<String, u64> = BTreeMap::new();
    for m in models {
        let created = m.updated_at_ms / 1000;
        by_name
            .entry(m.name)
            .and_modify(|c| *c = (*c).max(created))
            .or_insert(created);
    }
    let data: Vec<serde_json::Value> = by_name
        .into_iter()
        .map(|(id, created)| {
            serde_json::json!({ "id": id, "object": "model", "created": created, "owned_by": "tollgate" })
        })
        .collect();
    Ok(admin::json_ok(&serde_json::json!({ "object": "list", "data": data })))
}

async fn chat(req: Request<Body>, state: &Arc<GatewayState>, caller: &Caller) -> Result<Response<Body>, GatewayError> {
    let mut chat: ChatCompletionRequest = read_json(req).await?;
    let estimate = chat.estimate_prompt_tokens();
    let sel = state.selector.select(&caller.user.api_key, &chat.model, estimate)?;
    chat.clamp_max_tokens(state.max_output_tokens, sel.candidate.model_max_tokens);

    if chat.stream {
        chat.request_stream_usage();
        let payload = encode(&chat)?;
        let resp = state
            .pool
            .open_stream(sel.candidate.client_id, "chat/completions", payload)
            .await?;
        return relay_stream(resp, state.clone(), caller, sel.candidate);
    }

    let payload = encode(&chat)?;
    let reply = sel.upstream.call("chat/completions", payload).await?;
    finish_unary(reply, state, caller, &sel, None).await
}

async fn embeddings(req: Request<Body>, state: &Arc<GatewayState>, caller: &Caller) -> Result<Response<Body>, GatewayError> {
    let emb: EmbeddingRequest = read_json(req).await?;
    let sel = state
        .selector
        .select(&caller.user.api_key, &emb.model, emb.estimate_prompt_tokens())?;
    let reply = sel.upstream.call("embeddings", encode(&emb)?).await?;
    finish_unary(reply, state, caller, &sel, None).await
}

async fn speech(req: Request<Body>, state: &Arc<GatewayState>, caller: &Caller) -> Result<Response<Body>, GatewayError> {
    let speech: SpeechRequest = read_json(req).await?;
    let chars = speech.billed_characters();
    let sel = state.selector.select(&caller.user.api_key, &speech.model, chars)?;
    let reply = sel.upstream.call("audio/speech", encode(&speech)?).await?;
    let usage = TokenUsage {
        prompt_tokens: chars,
        completion_tokens: 0,
    };
    let mut resp = finish_unary(reply, state, caller, &sel, Some(usage)).await?;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(speech.content_type()));
    Ok(resp)
}

/// Bills a fully read upstream answer and hands it to the caller unchanged.
/// `fixed_usage` overrides whatever the body reports.
async fn finish_unary(
    reply: UpstreamReply,
    state: &GatewayState,
    caller: &Caller,
    sel: &Selection,
    fixed_usage: Option<TokenUsage>,
) -> Result<Response<Body>, GatewayError> {
    if !reply.status.is_success() {
        return Err(GatewayError::UpstreamFailure(format!(
            "upstream returned {}",
            reply.status
        )));
    }

    let gzip = is_gzip(&reply.headers);
    let parsed = if fixed_usage.is_some() {
        None
    } else {
        json_body(&reply.body, gzip)
    };
    let usage = fixed_usage
        .or_else(|| parsed.as_ref().and_then(extract_usage))
        .unwrap_or_default();
    let request_id = parsed
        .as_ref()
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| header_str(&reply.headers, "x-request-id"))
        .unwrap_or_default();
    state
        .meter
        .submit(charge_for(&sel.candidate, caller, request_id, usage))
        .await;

    let mut headers = reply.headers;
    sanitize_hop_headers(&mut headers);
    let mut resp = Response::new(Body::from(reply.body));
    *resp.status_mut() = reply.status;
    *resp.headers_mut() = headers;
    Ok(resp)
}

/// Forwards the event stream line by line and bills once it ends.
///
/// The terminal `[DONE]` is always ours. A dropped caller stops the loop,
/// which drops the upstream body; usage seen so far is still charged.
fn relay_stream(
    resp: Response<Body>,
    state: Arc<GatewayState>,
    caller: &Caller,
    candidate: CandidateView,
) -> Result<Response<Body>, GatewayError> {
    let (mut parts, body) = resp.into_parts();
    if !parts.status.is_success() {
        return Err(GatewayError::UpstreamFailure(format!(
            "upstream returned {}",
            parts.status
        )));
    }
    let gzip = is_gzip(&parts.headers);
    sanitize_hop_headers(&mut parts.headers);
    parts.headers.remove(CONTENT_LENGTH);
    parts.headers.remove(CONTENT_ENCODING);
    parts
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));

    let trace_id = caller.trace_id.clone();
    let ip = caller.ip.to_string();
    let user_id = caller.user.id;

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Bytes, io::Error>>(32);
    let owner = state.clone();
    owner.meter.track(async move {
        use hyper::body::HttpBody;

        let mut relay = SseRelay::new();
        let mut decoder = gzip.then(GzipDecoder::new);
        let mut body = body;
        let mut caller_gone = false;

        loop {
            let next = tokio::select! {
                chunk = body.data() => chunk,
                _ = tx.closed() => {
                    caller_gone = true;
                    break;
                }
            };
            let Some(chunk) = next else { break };
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(trace_id = %trace_id, error = %e, "upstream stream broke");
                    break;
                }
            };
            let plain = match decoder.as_mut() {
                Some(d) => match d.push(&chunk) {
                    Ok(p) => Bytes::from(p),
                    Err(e) => {
                        tracing::warn!(trace_id = %trace_id, error = %e, "upstream gzip stream corrupt");
                        break;
                    }
                },
                None => chunk,
            };
            if let Some(out) = relay.push(&plain) {
                if tx.send(Ok(out)).await.is_err() {
                    caller_gone = true;
                    break;
                }
            }
        }
        drop(body);

        if caller_gone {
            tracing::debug!(trace_id = %trace_id, "caller disconnected mid-stream");
        } else {
            let _ = tx.send(Ok(relay.finish())).await;
        }

        let usage = relay.usage().unwrap_or_default();
        let request_id = relay.response_id().unwrap_or_default().to_string();
        state.meter.submit(Charge {
            client_id: candidate.client_id,
            model_id: candidate.model_id,
            model_name: candidate.model_name,
            user_id,
            caller_ip: ip,
            request_id,
            trace_id,
            prompt_price: candidate.prompt_price,
            completion_price: candidate.completion_price,
            usage,
        })
        .await;
    });

    Ok(Response::from_parts(
        parts,
        Body::wrap_stream(ReceiverStream::new(rx)),
    ))
}

fn charge_for(c: &CandidateView, caller: &Caller, request_id: String, usage: TokenUsage) -> Charge {
    Charge {
        client_id: c.client_id,
        model_id: c.model_id,
        model_name: c.model_name.clone(),
        user_id: caller.user.id,
        caller_ip: caller.ip.to_string(),
        request_id,
        trace_id: caller.trace_id.clone(),
        prompt_price: c.prompt_price,
        completion_price: c.completion_price,
        usage,
    }
}

async fn read_json<T: DeserializeOwned>(req: Request<Body>) -> Result<T, GatewayError> {
    let body = read_body_limit(req, MAX_REQUEST_BODY_BYTES).await?;
    serde_json::from_slice(&body).map_err(|e| GatewayError::BadRequest(format!("invalid request body: {e}")))
}

fn encode<T: Serialize>(v: &T) -> Result<Bytes, GatewayError> {
    serde_json::to_vec(v)
        .map(Bytes::from)
        .map_err(|e| GatewayError::BadRequest(format!("cannot encode request: {e}")))
}

fn is_gzip(headers: &hyper::HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("gzip"))
        .unwrap_or(false)
}

fn header_str(headers: &hyper::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

fn trace_id(headers: &hyper::HeaderMap) -> String {
    header_str(headers, HDR_TRACE_ID)
        .or_else(|| header_str(headers, "x-request-id"))
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
}

fn with_trace(mut resp: Response<Body>, trace_id: &str) -> Response<Body> {
    if let Ok(v) = HeaderValue::from_str(trace_id) {
        resp.headers_mut().insert(HDR_TRACE_ID, v);
    }
    resp
}

fn caller_ip(headers: &hyper::HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = header_str(headers, "x-forwarded-for")
            .and_then(|s| s.split(',').next().and_then(|ip| ip.trim().parse().ok()));
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    peer.ip()
}

fn extract_api_key(headers: &hyper::HeaderMap) -> Option<String> {
    if let Some(key) = header_str(headers, "x-api-key") {
        return Some(key);
    }
    let raw = header_str(headers, AUTHORIZATION.as_str())?;
    let key = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .unwrap_or(&raw)
        .trim();
    if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> hyper::HeaderMap {
        let mut h = hyper::HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, HeaderValue::from_static(*v));
        }
        h
    }

    #[test]
    fn api_key_from_bearer_or_x_api_key() {
        assert_eq!(
            extract_api_key(&headers(&[("authorization", "Bearer tg-abc")])).as_deref(),
            Some("tg-abc")
        );
        assert_eq!(
            extract_api_key(&headers(&[("x-api-key", "tg-xyz"), ("authorization", "Bearer tg-abc")])).as_deref(),
            Some("tg-xyz")
        );
        assert_eq!(extract_api_key(&headers(&[("authorization", "Bearer ")])), None);
        assert_eq!(extract_api_key(&hyper::HeaderMap::new()), None);
    }

    #[test]
    fn forwarded_for_is_only_trusted_when_enabled() {
        let peer: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let h = headers(&[("x-forwarded-for", "10.1.2.3, 172.16.0.1")]);
        assert_eq!(caller_ip(&h, peer, true), "10.1.2.3".parse::<IpAddr>().unwrap());
        assert_eq!(caller_ip(&h, peer, false), peer.ip());
        let junk = headers(&[("x-forwarded-for", "unknown")]);
        assert_eq!(caller_ip(&junk, peer, true), peer.ip());
    }

    #[test]
    fn trace_id_prefers_caller_supplied_value() {
        assert_eq!(trace_id(&headers(&[("x-trace-id", "t-1")])), "t-1");
        assert_eq!(trace_id(&headers(&[("x-request-id", "r-9")])), "r-9");
        assert_eq!(trace_id(&hyper::HeaderMap::new()).len(), 32);
    }
}
