use hyper::service::{make_service_fn, service_fn};
use hyper::body::{Bytes, HttpBody};
use hyper::{Body, Client, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tollgate::config::Config;
use tollgate::proxy;
use tollgate::state::GatewayState;
use tollgate::storage::Store;

const ADMIN: &str = "test-admin";

/// What the fake upstream saw, for assertions.
#[derive(Default)]
struct Seen {
    auth: Vec<String>,
    bodies: Vec<Value>,
}

fn bind() -> (std::net::TcpListener, SocketAddr) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn upstream_reply(req: Request<Body>, seen: Arc<Mutex<Seen>>) -> Response<Body> {
    let path = req.uri().path().to_string();
    let auth = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    {
        let mut s = seen.lock().unwrap();
        s.auth.push(auth);
        s.bodies.push(body.clone());
    }

    match path.as_str() {
        "/v1/chat/completions" if body["model"] == "broken-stream" => {
            let (mut sender, stream) = Body::channel();
            tokio::spawn(async move {
                let frame = "data: {\"id\":\"chatcmpl-d1\",\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n";
                let _ = sender.send_data(Bytes::from_static(frame.as_bytes())).await;
                sender.abort();
            });
            event_stream(stream)
        }
        "/v1/chat/completions" if body["model"] == "slow-stream" => {
            let (mut sender, stream) = Body::channel();
            tokio::spawn(async move {
                let frames = [
                    "data: {\"id\":\"chatcmpl-w1\",\"choices\":[{\"delta\":{\"content\":\"thinking\"}}]}\n\n",
                    "data: {\"id\":\"chatcmpl-w1\",\"choices\":[],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":20}}\n\n",
                ];
                for frame in frames {
                    if sender.send_data(Bytes::from_static(frame.as_bytes())).await.is_err() {
                        return;
                    }
                }
                // never finishes on its own
                tokio::time::sleep(Duration::from_secs(30)).await;
                drop(sender);
            });
            event_stream(stream)
        }
        "/v1/chat/completions" if body["model"] == "failing" => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .header("content-type", "application/json")
            .body(Body::from(r#"{"error":{"message":"overloaded"}}"#))
            .unwrap(),
        "/v1/chat/completions" if body["stream"] == json!(true) => {
            let frames = concat!(
                "data: {\"id\":\"chatcmpl-s1\",\"choices\":[{\"delta\":{\"content\":\"hel\"}}]}\n\n",
                "data: {\"id\":\"chatcmpl-s1\",\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
                "data: {\"id\":\"chatcmpl-s1\",\"choices\":[],\"usage\":{\"prompt_tokens\":10,\"completion_tokens\":20,\"total_tokens\":30}}\n\n",
                "data: [DONE]\n\n",
            );
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(Body::from(frames))
                .unwrap()
        }
        "/v1/chat/completions" => Response::builder()
            .header("content-type", "application/json")
            .body(Body::from(
                json!({
                    "id": "chatcmpl-u1",
                    "object": "chat.completion",
                    "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}}],
                    "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}
                })
                .to_string(),
            ))
            .unwrap(),
        "/v1/embeddings" => Response::builder()
            .header("content-type", "application/json")
            .body(Body::from(
                json!({
                    "object": "list",
                    "data": [{"object": "embedding", "index": 0, "embedding": [0.1, 0.2]}],
                    "usage": {"prompt_tokens": 4, "total_tokens": 4}
                })
                .to_string(),
            ))
            .unwrap(),
        "/v1/audio/speech" => Response::builder()
            .header("content-type", "application/octet-stream")
            .body(Body::from(vec![0u8; 16]))
            .unwrap(),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap(),
    }
}

fn event_stream(body: Body) -> Response<Body> {
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(body)
        .unwrap()
}

fn spawn_upstream() -> (SocketAddr, Arc<Mutex<Seen>>) {
    let (listener, addr) = bind();
    let seen = Arc::new(Mutex::new(Seen::default()));
    let shared = seen.clone();
    let make_svc = make_service_fn(move |_| {
        let seen = shared.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let seen = seen.clone();
                async move { Ok::<_, Infallible>(upstream_reply(req, seen).await) }
            }))
        }
    });
    let server = Server::from_tcp(listener).unwrap().serve(make_svc);
    tokio::spawn(async move {
        let _ = server.await;
    });
    (addr, seen)
}

struct Harness {
    base: String,
    state: Arc<GatewayState>,
    http: Client<hyper::client::HttpConnector>,
    seen: Arc<Mutex<Seen>>,
    upstream: SocketAddr,
}

impl Harness {
    async fn start() -> Self {
        let (upstream, seen) = spawn_upstream();
        let dir = std::env::temp_dir().join(format!("tollgate-it-{}", uuid::Uuid::new_v4().simple()));
        let cfg = Config::from_toml(&format!(
            r#"
listen_addr = "127.0.0.1:0"
request_timeout_ms = 5000
admin_tokens = ["{ADMIN}"]
data_dir = '{}'
max_output_tokens = 4096
price_unit = 1000
"#,
            dir.display()
        ))
        .unwrap();
        let state = Arc::new(GatewayState::with_store(cfg, Arc::new(Store::temporary().unwrap())).unwrap());
        let (listener, addr) = bind();
        tokio::spawn(proxy::serve(listener, state.clone(), std::future::pending::<()>()));
        Harness {
            base: format!("http://{addr}"),
            state,
            http: Client::new(),
            seen,
            upstream,
        }
    }

    async fn send(&self, method: Method, path: &str, headers: &[(&str, &str)], body: Option<Value>) -> (StatusCode, hyper::HeaderMap, Vec<u8>) {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("{}{}", self.base, path));
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        let req = builder
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty))
            .unwrap();
        let resp = self.http.request(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        (status, headers, bytes.to_vec())
    }

    async fn admin(&self, method: Method, path: &str, body: Option<Value>) -> Value {
        let (status, _, bytes) = self
            .send(method, &format!("/admin/api/v1{path}"), &[("x-admin-token", ADMIN)], body)
            .await;
        assert!(status.is_success(), "admin {path} -> {status}: {}", String::from_utf8_lossy(&bytes));
        serde_json::from_slice(&bytes).unwrap()
    }

    /// One client with `gpt-4` at 1000/2000 per 1000 tokens, one user granted it.
    async fn seed(&self, allow_ips: Value) -> (u64, u64, String) {
        let client = self
            .admin(
                Method::POST,
                "/clients",
                Some(json!({
                    "name": "acme",
                    "api_key": "sk-upstream-secret",
                    "endpoint": format!("http://{}/v1", self.upstream),
                    "balance": 100000
                })),
            )
            .await;
        let client_id = client["id"].as_u64().unwrap();
        self.admin(
            Method::POST,
            &format!("/clients/{client_id}/models"),
            Some(json!({"name": "gpt-4", "max_tokens": 64, "prompt_price": 1000, "completion_price": 2000})),
        )
        .await;
        let user = self
            .admin(
                Method::POST,
                "/users",
                Some(json!({"email": "dev@example.com", "balance": 1000, "allow_ips": allow_ips})),
            )
            .await;
        let user_id = user["id"].as_u64().unwrap();
        self.admin(
            Method::PUT,
            &format!("/users/{user_id}/permissions"),
            Some(json!({"acme": ["gpt-4"]})),
        )
        .await;
        (client_id, user_id, user["api_key"].as_str().unwrap().to_string())
    }

    /// Adds models priced like `gpt-4` to the client and grants every one of them.
    async fn grant_models(&self, client_id: u64, user_id: u64, names: &[&str]) {
        for name in names {
            self.admin(
                Method::POST,
                &format!("/clients/{client_id}/models"),
                Some(json!({"name": name, "prompt_price": 1000, "completion_price": 2000})),
            )
            .await;
        }
        let mut all = vec!["gpt-4"];
        all.extend_from_slice(names);
        self.admin(
            Method::PUT,
            &format!("/users/{user_id}/permissions"),
            Some(json!({ "acme": all })),
        )
        .await;
    }

    async fn wait_for_usage_rows(&self, want: usize) -> Value {
        for _ in 0..100 {
            let rows = self.admin(Method::GET, "/usage", None).await;
            if rows.as_array().map(Vec::len) == Some(want) {
                return rows;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("usage log never reached {want} rows");
    }

    async fn log_actions(&self, path: &str) -> Vec<(String, i64)> {
        self.admin(Method::GET, path, None)
            .await
            .as_array()
            .unwrap()
            .iter()
            .map(|e| (e["action"].as_str().unwrap().to_string(), e["change"].as_i64().unwrap()))
            .collect()
    }

    async fn user_balance(&self, user_id: u64) -> i64 {
        self.admin(Method::GET, &format!("/users/{user_id}"), None).await["balance"]
            .as_i64()
            .unwrap()
    }

    /// Settlement is asynchronous; wait for the user balance to reach `want`.
    async fn wait_for_user_balance(&self, user_id: u64, want: i64) {
        for _ in 0..100 {
            if self.user_balance(user_id).await == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("user {user_id} balance never reached {want}, is {}", self.user_balance(user_id).await);
    }
}

fn chat_body(stream: bool) -> Value {
    json!({
        "model": "gpt-4",
        "stream": stream,
        "max_tokens": 10000,
        "messages": [{"role": "user", "content": "say hello"}]
    })
}

#[tokio::test]
async fn non_stream_chat_is_forwarded_and_charged() {
    let h = Harness::start().await;
    let (client_id, user_id, key) = h.seed(json!([])).await;
    let bearer = format!("Bearer {key}");

    let (status, headers, body) = h
        .send(
            Method::POST,
            "/v1/chat/completions",
            &[("authorization", bearer.as_str()), ("x-trace-id", "trace-abc")],
            Some(chat_body(false)),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-trace-id"], "trace-abc");
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["id"], "chatcmpl-u1");

    {
        let seen = h.seen.lock().unwrap();
        assert_eq!(seen.auth, vec!["Bearer sk-upstream-secret".to_string()]);
        assert_eq!(seen.bodies[0]["max_tokens"], 64);
    }

    // ceil((10 * 1000 + 20 * 2000) / 1000) = 50
    h.wait_for_user_balance(user_id, 950).await;
    let clients = h.admin(Method::GET, "/clients", None).await;
    assert_eq!(clients[0]["id"], client_id);
    assert_eq!(clients[0]["balance"], 99950);

    let usage = h.admin(Method::GET, "/usage?limit=10", None).await;
    assert_eq!(usage[0]["request_id"], "chatcmpl-u1");
    assert_eq!(usage[0]["trace_id"], "trace-abc");
    assert_eq!(usage[0]["cost"], 50);
    h.state.shutdown().await;
}

#[tokio::test]
async fn stream_ends_with_one_done_and_is_charged() {
    let h = Harness::start().await;
    let (_, user_id, key) = h.seed(json!([])).await;

    let (status, headers, body) = h
        .send(
            Method::POST,
            "/v1/chat/completions",
            &[("x-api-key", key.as_str())],
            Some(chat_body(true)),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "text/event-stream");
    let text = String::from_utf8(body).unwrap();
    assert_eq!(text.matches("data: [DONE]").count(), 1, "{text}");
    assert!(text.ends_with("data: [DONE]\n\n"));
    assert!(text.contains("\"hel\""));

    let sent = h.seen.lock().unwrap().bodies[0].clone();
    assert_eq!(sent["stream_options"]["include_usage"], true);

    h.wait_for_user_balance(user_id, 950).await;
    let usage = h.admin(Method::GET, "/usage", None).await;
    assert_eq!(usage[0]["request_id"], "chatcmpl-s1");
    assert_eq!(usage[0]["completion_tokens"], 20);
    h.state.shutdown().await;
}

#[tokio::test]
async fn embeddings_and_speech_are_metered() {
    let h = Harness::start().await;
    let (client_id, user_id, key) = h.seed(json!([])).await;
    h.admin(
        Method::POST,
        &format!("/clients/{client_id}/models"),
        Some(json!({"name": "embed-small", "prompt_price": 1000, "completion_price": 0})),
    )
    .await;
    h.admin(
        Method::POST,
        &format!("/clients/{client_id}/models"),
        Some(json!({"name": "tts-1", "prompt_price": 1000, "completion_price": 0})),
    )
    .await;
    h.admin(
        Method::PUT,
        &format!("/users/{user_id}/permissions"),
        Some(json!({"acme": ["gpt-4", "embed-small", "tts-1"]})),
    )
    .await;
    let bearer = format!("Bearer {key}");

    let (status, _, _) = h
        .send(
            Method::POST,
            "/v1/embeddings",
            &[("authorization", bearer.as_str())],
            Some(json!({"model": "embed-small", "input": "hello world"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    h.wait_for_user_balance(user_id, 996).await;

    let (status, headers, audio) = h
        .send(
            Method::POST,
            "/v1/audio/speech",
            &[("authorization", bearer.as_str())],
            Some(json!({"model": "tts-1", "input": "hi there", "voice": "alloy", "response_format": "wav"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["content-type"], "audio/wav");
    assert_eq!(audio.len(), 16);
    // eight characters at one credit each
    h.wait_for_user_balance(user_id, 988).await;
    h.state.shutdown().await;
}

#[tokio::test]
async fn models_lists_only_granted_names() {
    let h = Harness::start().await;
    let (_, _, key) = h.seed(json!([])).await;
    let (status, _, body) = h
        .send(Method::GET, "/v1/models", &[("x-api-key", key.as_str())], None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["gpt-4"]);
    h.state.shutdown().await;
}

#[tokio::test]
async fn refusals_never_reach_upstream() {
    let h = Harness::start().await;
    let (_, user_id, key) = h.seed(json!([])).await;

    let (status, _, body) = h
        .send(
            Method::POST,
            "/v1/chat/completions",
            &[("authorization", "Bearer tg-not-a-key")],
            Some(chat_body(false)),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"]["code"], "invalid_api_key");

    let mut unknown = chat_body(false);
    unknown["model"] = json!("gpt-9");
    let (status, _, body) = h
        .send(Method::POST, "/v1/chat/completions", &[("x-api-key", key.as_str())], Some(unknown))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"]["code"], "no_available_client");

    h.admin(
        Method::PUT,
        &format!("/users/{user_id}"),
        Some(json!({"allow_ips": ["10.0.0.0/8"]})),
    )
    .await;
    let (status, _, body) = h
        .send(Method::POST, "/v1/chat/completions", &[("x-api-key", key.as_str())], Some(chat_body(false)))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"]["code"], "ip_forbidden");

    assert!(h.seen.lock().unwrap().bodies.is_empty());
    assert_eq!(h.user_balance(user_id).await, 1000);
    h.state.shutdown().await;
}

#[tokio::test]
async fn unaffordable_user_is_refused() {
    let h = Harness::start().await;
    let (_, user_id, key) = h.seed(json!([])).await;
    h.admin(
        Method::POST,
        &format!("/users/{user_id}/balance"),
        Some(json!({"change": -1000, "action": "special", "reason": "drained"})),
    )
    .await;

    let (status, _, _) = h
        .send(Method::POST, "/v1/chat/completions", &[("x-api-key", key.as_str())], Some(chat_body(false)))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(h.seen.lock().unwrap().bodies.is_empty());
    h.state.shutdown().await;
}

#[tokio::test]
async fn upstream_drop_mid_stream_charges_exactly_once() {
    let h = Harness::start().await;
    let (client_id, user_id, key) = h.seed(json!([])).await;
    h.grant_models(client_id, user_id, &["broken-stream"]).await;

    let mut body = chat_body(true);
    body["model"] = json!("broken-stream");
    let (status, _, text) = h
        .send(Method::POST, "/v1/chat/completions", &[("x-api-key", key.as_str())], Some(body))
        .await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(text).unwrap();
    assert!(text.contains("\"hi\""));
    assert_eq!(text.matches("data: [DONE]").count(), 1);
    assert!(text.ends_with("data: [DONE]\n\n"));

    let rows = h.wait_for_usage_rows(1).await;
    assert_eq!(rows[0]["request_id"], "chatcmpl-d1");
    assert_eq!(rows[0]["cost"], 0);
    // give a duplicate settlement the chance to show up
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.admin(Method::GET, "/usage", None).await.as_array().unwrap().len(), 1);

    let user_log = h.log_actions(&format!("/users/{user_id}/balance_logs")).await;
    assert_eq!(
        user_log,
        vec![("initial".into(), 0), ("gift".into(), 1000), ("consumption".into(), 0)]
    );
    let client_log = h.log_actions(&format!("/clients/{client_id}/balance_logs")).await;
    assert_eq!(client_log.iter().filter(|(a, _)| a == "consumption").count(), 1);
    h.state.shutdown().await;
}

#[tokio::test]
async fn caller_disconnect_still_charges_observed_usage() {
    let h = Harness::start().await;
    let (client_id, user_id, key) = h.seed(json!([])).await;
    h.grant_models(client_id, user_id, &["slow-stream"]).await;

    let mut body = chat_body(true);
    body["model"] = json!("slow-stream");
    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("{}/v1/chat/completions", h.base))
        .header("x-api-key", key.as_str())
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = h.http.request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let mut stream = resp.into_body();
    let mut seen = String::new();
    while !seen.contains("usage") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), stream.data())
            .await
            .expect("frame within timeout")
            .expect("stream still open")
            .unwrap();
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }
    drop(stream);

    // ceil((10 * 1000 + 20 * 2000) / 1000) = 50
    h.wait_for_user_balance(user_id, 950).await;
    let rows = h.wait_for_usage_rows(1).await;
    assert_eq!(rows[0]["request_id"], "chatcmpl-w1");
    h.state.shutdown().await;
}

#[tokio::test]
async fn upstream_failures_are_500_and_free() {
    let h = Harness::start().await;
    let (client_id, user_id, key) = h.seed(json!([])).await;
    h.grant_models(client_id, user_id, &["failing"]).await;

    let mut body = chat_body(false);
    body["model"] = json!("failing");
    let (status, _, resp) = h
        .send(Method::POST, "/v1/chat/completions", &[("x-api-key", key.as_str())], Some(body))
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let resp: Value = serde_json::from_slice(&resp).unwrap();
    assert_eq!(resp["error"]["code"], "upstream_error");
    assert!(resp["error"]["message"].is_string());

    // a second account whose endpoint refuses connections
    let dead = h
        .admin(
            Method::POST,
            "/clients",
            Some(json!({"name": "deadco", "api_key": "sk-dead", "endpoint": "http://127.0.0.1:1/v1", "balance": 100000})),
        )
        .await;
    let dead_id = dead["id"].as_u64().unwrap();
    h.admin(
        Method::POST,
        &format!("/clients/{dead_id}/models"),
        Some(json!({"name": "unreachable", "prompt_price": 1000, "completion_price": 2000})),
    )
    .await;
    h.admin(
        Method::PUT,
        &format!("/users/{user_id}/permissions"),
        Some(json!({"acme": ["gpt-4", "failing"], "deadco": ["unreachable"]})),
    )
    .await;

    for stream in [false, true] {
        let mut body = chat_body(stream);
        body["model"] = json!("unreachable");
        let (status, _, resp) = h
            .send(Method::POST, "/v1/chat/completions", &[("x-api-key", key.as_str())], Some(body))
            .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let resp: Value = serde_json::from_slice(&resp).unwrap();
        assert_eq!(resp["error"]["code"], "upstream_error");
    }

    h.state.shutdown().await;
    assert_eq!(h.admin(Method::GET, "/usage", None).await.as_array().unwrap().len(), 0);
    assert_eq!(h.user_balance(user_id).await, 1000);
}
