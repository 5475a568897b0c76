use crate::directory::Directory;
use crate::error::{json_error, GatewayError};
use crate::ledger::{Account, Ledger, LedgerQuery};
use crate::model::{Client, LedgerAction, Role, User};
use crate::permissions::sync_permissions;
use crate::state::{mint_api_key, GatewayState};
use crate::storage::{ClientUpdate, NewClient, NewModel, NewUser, Rejected, UserUpdate};
use crate::util::{mask_secret, query_get, query_parse, read_body_limit};
use hyper::{Body, Method, Request, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const MAX_ADMIN_BODY_BYTES: usize = 256 * 1024;
const MAX_PAGE_SIZE: usize = 500;

type ApiResult = Result<Response<Body>, GatewayError>;

pub async fn handle_admin(req: Request<Body>, state: Arc<GatewayState>) -> Response<Body> {
    if req.uri().path().starts_with("/admin/api/") {
        return handle_api(req, state).await;
    }
    GatewayError::NotFound.into_response()
}

async fn handle_api(req: Request<Body>, state: Arc<GatewayState>) -> Response<Body> {
    let path = req.uri().path().trim_end_matches('/').to_string();
    let method = req.method().clone();

    // All admin API endpoints require admin token.
    if !state.authorize_admin_header(&req) {
        return json_error(
            http::StatusCode::UNAUTHORIZED,
            "missing or invalid admin token",
            "admin_unauthorized",
        );
    }

    let result = match (&method, path.as_str()) {
        (&Method::GET, "/admin/api/v1/clients") => api_list_clients(&state),
        (&Method::POST, "/admin/api/v1/clients") => api_create_client(req, &state).await,
        (&Method::GET, "/admin/api/v1/models") => api_models_by_client_name(&state, req.uri()),
        (&Method::GET, "/admin/api/v1/users") => api_list_users(&state),
        (&Method::POST, "/admin/api/v1/users") => api_create_user(req, &state).await,
        (&Method::POST, "/admin/api/v1/users/balance") => api_batch_user_balance(req, &state).await,
        (&Method::GET, "/admin/api/v1/usage") => api_usage(&state, req.uri()),
        _ => {
            if let Some(rest) = path.strip_prefix("/admin/api/v1/clients/") {
                handle_client_subroutes(req, &state, rest).await
            } else if let Some(rest) = path.strip_prefix("/admin/api/v1/users/") {
                handle_user_subroutes(req, &state, rest).await
            } else {
                Err(GatewayError::NotFound)
            }
        }
    };

    result.unwrap_or_else(|e| {
        if e.status().is_server_error() {
            tracing::warn!(%method, path = %path, error = %e, "admin request failed");
        }
        e.into_response()
    })
}

fn method_not_allowed() -> Response<Body> {
    json_error(
        http::StatusCode::METHOD_NOT_ALLOWED,
        "method not allowed",
        "method_not_allowed",
    )
}

fn rejected(r: Rejected) -> Response<Body> {
    match r {
        Rejected::NotFound => GatewayError::NotFound.into_response(),
        Rejected::Duplicate(what) => json_error(
            http::StatusCode::CONFLICT,
            &format!("{what} already in use"),
            "conflict",
        ),
    }
}

fn parse_id(raw: &str) -> Result<u64, GatewayError> {
    raw.parse()
        .map_err(|_| GatewayError::BadRequest(format!("invalid id {raw:?}")))
}

async fn read_json<T: DeserializeOwned>(req: Request<Body>) -> Result<T, GatewayError> {
    let body = read_body_limit(req, MAX_ADMIN_BODY_BYTES).await?;
    serde_json::from_slice(&body).map_err(|e| GatewayError::BadRequest(format!("invalid json: {e}")))
}

pub(crate) fn json_ok<T: ?Sized + Serialize>(v: &T) -> Response<Body> {
    json_status(http::StatusCode::OK, v)
}

fn json_status<T: ?Sized + Serialize>(status: http::StatusCode, v: &T) -> Response<Body> {
    let body = match serde_json::to_vec(v) {
        Ok(b) => b,
        Err(_) => br#"{"error":"json"}"#.to_vec(),
    };
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-store"),
    );
    resp
}

fn balance_of(state: &GatewayState, account: Account) -> Result<i64, GatewayError> {
    Ok(state.store.balance(account)?.unwrap_or(0))
}

fn ledger_query(uri: &http::Uri) -> LedgerQuery {
    let mut q = LedgerQuery {
        start_ms: query_parse(uri, "start"),
        end_ms: query_parse(uri, "end"),
        ..LedgerQuery::default()
    };
    if let Some(page) = query_parse(uri, "page") {
        q.page = page;
    }
    if let Some(size) = query_parse::<usize>(uri, "size") {
        q.page_size = size.clamp(1, MAX_PAGE_SIZE);
    }
    q
}

#[derive(Deserialize)]
struct BalanceBody {
    change: i64,
    action: String,
    #[serde(default)]
    reason: String,
}

/// Manual credit or debit; the core-only actions are refused.
async fn adjust_balance(req: Request<Body>, state: &GatewayState, account: Account) -> ApiResult {
    let body: BalanceBody = read_json(req).await?;
    let Some(action) = LedgerAction::parse_manual(&body.action) else {
        return Err(GatewayError::BadRequest(format!(
            "action must be recharge, gift or special, got {:?}",
            body.action
        )));
    };
    let entry = state.store.append(account, body.change, action, &body.reason)?;
    tracing::info!(%account, change = body.change, action = action.as_str(), "manual balance change");
    Ok(json_ok(&entry))
}

fn balance_logs(state: &GatewayState, account: Account, uri: &http::Uri) -> ApiResult {
    let entries = state.store.entries(account, &ledger_query(uri))?;
    Ok(json_ok(&entries))
}

// ---- clients ----

#[derive(Serialize)]
struct ClientView {
    id: u64,
    name: String,
    api_key: String,
    endpoint: String,
    weight: u32,
    balance: i64,
    created_at_ms: u64,
    updated_at_ms: u64,
}

fn client_view(state: &GatewayState, c: Client) -> Result<ClientView, GatewayError> {
    Ok(ClientView {
        balance: balance_of(state, Account::Client(c.id))?,
        id: c.id,
        name: c.name,
        api_key: mask_secret(&c.api_key),
        endpoint: c.endpoint,
        weight: c.weight,
        created_at_ms: c.created_at_ms,
        updated_at_ms: c.updated_at_ms,
    })
}

fn api_list_clients(state: &GatewayState) -> ApiResult {
    let clients = state.store.list_clients()?;
    let mut out = Vec::with_capacity(clients.len());
    for c in clients {
        out.push(client_view(state, c)?);
    }
    Ok(json_ok(&out))
}

#[derive(Deserialize)]
struct CreateClientBody {
    name: String,
    api_key: String,
    endpoint: String,
    #[serde(default = "default_weight")]
    weight: u32,
    #[serde(default)]
    balance: i64,
}

fn default_weight() -> u32 {
    1
}

fn validate_endpoint(endpoint: &str) -> Result<(), GatewayError> {
    let uri: http::Uri = endpoint
        .parse()
        .map_err(|_| GatewayError::BadRequest("endpoint is not a valid URL".into()))?;
    match uri.scheme_str() {
        Some("http") | Some("https") if uri.authority().is_some() => Ok(()),
        _ => Err(GatewayError::BadRequest("endpoint must be an absolute http(s) URL".into())),
    }
}

async fn api_create_client(req: Request<Body>, state: &GatewayState) -> ApiResult {
    let body: CreateClientBody = read_json(req).await?;
    let name = body.name.trim().to_string();
    if name.is_empty() {
        return Err(GatewayError::BadRequest("name must not be empty".into()));
    }
    validate_endpoint(body.endpoint.trim())?;

    let client = match state.store.create_client(NewClient {
        name,
        api_key: body.api_key.trim().to_string(),
        endpoint: body.endpoint.trim().to_string(),
        weight: body.weight,
    })? {
        Ok(c) => c,
        Err(r) => return Ok(rejected(r)),
    };
    if body.balance != 0 {
        state.store.append(
            Account::Client(client.id),
            body.balance,
            LedgerAction::Recharge,
            "opening balance",
        )?;
    }
    tracing::info!(client_id = client.id, name = %client.name, "client created");
    Ok(json_status(http::StatusCode::CREATED, &client_view(state, client)?))
}

async fn handle_client_subroutes(req: Request<Body>, state: &GatewayState, rest: &str) -> ApiResult {
    let mut parts = rest.split('/');
    let id = parse_id(parts.next().unwrap_or(""))?;
    let action = parts.next().unwrap_or("");
    if parts.next().is_some() {
        return Err(GatewayError::NotFound);
    }
    if state.store.get_client(id)?.is_none() {
        return Err(GatewayError::NotFound);
    }

    match (action, req.method().clone()) {
        ("", Method::PUT) => api_update_client(req, state, id).await,
        ("balance", Method::POST) => adjust_balance(req, state, Account::Client(id)).await,
        ("balance_logs", Method::GET) => balance_logs(state, Account::Client(id), req.uri()),
        ("models", Method::GET) => Ok(json_ok(&state.store.list_models_for_client(id)?)),
        ("models", Method::POST) => api_upsert_model(req, state, id).await,
        ("" | "balance" | "balance_logs" | "models", _) => Ok(method_not_allowed()),
        _ => Err(GatewayError::NotFound),
    }
}

async fn api_update_client(req: Request<Body>, state: &GatewayState, id: u64) -> ApiResult {
    let update: ClientUpdate = read_json(req).await?;
    if let Some(endpoint) = &update.endpoint {
        validate_endpoint(endpoint.trim())?;
    }
    let Some(client) = state.store.update_client(id, update)? else {
        return Err(GatewayError::NotFound);
    };
    state.pool.invalidate(id);
    tracing::info!(client_id = id, "client updated, upstream handle invalidated");
    Ok(json_ok(&client_view(state, client)?))
}

/// `?client=<name>`: the models one client offers.
fn api_models_by_client_name(state: &GatewayState, uri: &http::Uri) -> ApiResult {
    let Some(name) = query_get(uri, "client").map(str::trim).filter(|n| !n.is_empty()) else {
        return Err(GatewayError::BadRequest("client query parameter is required".into()));
    };
    let Some(client) = state.store.client_by_name(name)? else {
        return Err(GatewayError::NotFound);
    };
    Ok(json_ok(&state.store.list_models_for_client(client.id)?))
}

async fn api_upsert_model(req: Request<Body>, state: &GatewayState, client_id: u64) -> ApiResult {
    let mut body: NewModel = read_json(req).await?;
    body.name = body.name.trim().to_string();
    if body.name.is_empty() {
        return Err(GatewayError::BadRequest("model name must not be empty".into()));
    }
    if body.prompt_price < 0 || body.completion_price < 0 {
        return Err(GatewayError::BadRequest("prices must not be negative".into()));
    }
    match state.store.upsert_model(client_id, body)? {
        Ok(model) => Ok(json_ok(&model)),
        Err(r) => Ok(rejected(r)),
    }
}

// ---- users ----

#[derive(Serialize)]
struct UserView {
    #[serde(flatten)]
    user: User,
    balance: i64,
}

fn user_view(state: &GatewayState, user: User) -> Result<UserView, GatewayError> {
    Ok(UserView {
        balance: balance_of(state, Account::User(user.id))?,
        user,
    })
}

#[derive(Deserialize)]
struct CreateUserBody {
    email: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    allow_ips: Vec<String>,
    /// Overrides the configured welcome balance.
    #[serde(default)]
    balance: Option<i64>,
}

async fn api_create_user(req: Request<Body>, state: &GatewayState) -> ApiResult {
    let body: CreateUserBody = read_json(req).await?;
    let email = body.email.trim().to_string();
    if email.is_empty() {
        return Err(GatewayError::BadRequest("email must not be empty".into()));
    }
    let role = match body.role.as_deref() {
        None => Role::User,
        Some(r) => Role::parse(r)
            .ok_or_else(|| GatewayError::BadRequest(format!("unknown role {r:?}")))?,
    };

    let key = mint_api_key();
    let user = match state.store.create_user(
        NewUser {
            email,
            role,
            language: body.language.unwrap_or_else(|| "en".to_string()),
            allow_ips: body.allow_ips,
        },
        &key,
    )? {
        Ok(u) => u,
        Err(r) => return Ok(rejected(r)),
    };
    state.admission.register_key(&user.api_key);

    let gift = body.balance.unwrap_or(state.default_user_balance);
    if gift != 0 {
        state
            .store
            .append(Account::User(user.id), gift, LedgerAction::Gift, "welcome balance")?;
    }
    tracing::info!(user_id = user.id, "user created");
    Ok(json_status(http::StatusCode::CREATED, &user_view(state, user)?))
}

fn api_list_users(state: &GatewayState) -> ApiResult {
    let users = state.store.list_users()?;
    let mut out = Vec::with_capacity(users.len());
    for u in users {
        out.push(user_view(state, u)?);
    }
    Ok(json_ok(&out))
}

#[derive(Deserialize)]
struct BatchBalanceBody {
    users: Vec<u64>,
    change: i64,
    action: String,
    #[serde(default)]
    reason: String,
}

/// Same change for every listed user; unknown ids abort before any write.
async fn api_batch_user_balance(req: Request<Body>, state: &GatewayState) -> ApiResult {
    let body: BatchBalanceBody = read_json(req).await?;
    let Some(action) = LedgerAction::parse_manual(&body.action) else {
        return Err(GatewayError::BadRequest(format!(
            "action must be recharge, gift or special, got {:?}",
            body.action
        )));
    };
    if body.users.is_empty() {
        return Err(GatewayError::BadRequest("users must not be empty".into()));
    }
    let mut ids = body.users;
    ids.sort_unstable();
    ids.dedup();
    for id in &ids {
        if state.store.get_user(*id)?.is_none() {
            return Err(GatewayError::BadRequest(format!("unknown user {id}")));
        }
    }

    let mut entries = Vec::with_capacity(ids.len());
    for id in ids {
        entries.push(state.store.append(Account::User(id), body.change, action, &body.reason)?);
    }
    tracing::info!(users = entries.len(), change = body.change, action = action.as_str(), "batch balance change");
    Ok(json_ok(&entries))
}

#[derive(Deserialize)]
struct UpdateUserBody {
    #[serde(flatten)]
    update: UserUpdate,
    #[serde(default)]
    refresh_api_key: bool,
}

async fn handle_user_subroutes(req: Request<Body>, state: &GatewayState, rest: &str) -> ApiResult {
    let mut parts = rest.split('/');
    let id = parse_id(parts.next().unwrap_or(""))?;
    let action = parts.next().unwrap_or("");
    if parts.next().is_some() {
        return Err(GatewayError::NotFound);
    }
    let Some(user) = state.store.get_user(id)? else {
        return Err(GatewayError::NotFound);
    };

    match (action, req.method().clone()) {
        ("", Method::GET) => Ok(json_ok(&user_view(state, user)?)),
        ("", Method::PUT) => api_update_user(req, state, id).await,
        ("balance", Method::POST) => adjust_balance(req, state, Account::User(id)).await,
        ("balance_logs", Method::GET) => balance_logs(state, Account::User(id), req.uri()),
        ("permissions", Method::GET) => Ok(json_ok(&state.store.grants(id)?)),
        ("permissions", Method::PUT) => api_sync_permissions(req, state, id).await,
        ("" | "balance" | "balance_logs" | "permissions", _) => Ok(method_not_allowed()),
        _ => Err(GatewayError::NotFound),
    }
}

async fn api_update_user(req: Request<Body>, state: &GatewayState, id: u64) -> ApiResult {
    let body: UpdateUserBody = read_json(req).await?;
    let mut user = match state.store.update_user(id, body.update)? {
        Ok(u) => u,
        Err(r) => return Ok(rejected(r)),
    };
    if body.refresh_api_key {
        let key = mint_api_key();
        user = match state.store.refresh_user_key(id, &key)? {
            Ok(u) => u,
            Err(r) => return Ok(rejected(r)),
        };
        state.admission.register_key(&user.api_key);
        tracing::info!(user_id = id, "user api key refreshed");
    }
    Ok(json_ok(&user_view(state, user)?))
}

async fn api_sync_permissions(req: Request<Body>, state: &GatewayState, id: u64) -> ApiResult {
    let desired: BTreeMap<String, Vec<String>> = read_json(req).await?;
    let diff = sync_permissions(state.store.as_ref(), id, &desired)
        .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
    Ok(json_ok(&serde_json::json!({
        "inserted": diff.insert.len(),
        "deleted": diff.delete.len(),
    })))
}

fn api_usage(state: &GatewayState, uri: &http::Uri) -> ApiResult {
    let limit = query_parse::<usize>(uri, "limit").unwrap_or(100).clamp(1, 1000);
    Ok(json_ok(&state.store.recent_usage(limit)?))
}
