use crate::config::{Config, ServiceConfig};
use crate::model::{ServiceEndpointConfig, ServiceKind, ServiceSummary};
use crate::security::Vault;
use crate::subscription::{BridgeEvent, SubscriptionBridge};
use crate::upstream::{
    allowlisted_endpoints, EndpointCall, HttpMethod, ProxyError, ServiceClient, UpstreamFailure,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    sync::Arc,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast::error::RecvError, watch};

const RESOURCE_ID_PARAM: &str = "resource_id";
const TOKEN_PARAM: &str = "token";

pub struct AppState {
    token: String,
    config: Config,
    // Read-only once serving; vault writes happen in the CLI before startup.
    vault: Vault,
    bridge: SubscriptionBridge,
}

impl AppState {
    pub fn new(token: String, config: Config, vault: Vault, bridge: SubscriptionBridge) -> Self {
        Self {
            token,
            config,
            vault,
            bridge,
        }
    }
}

type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/services", get(list_services))
        .route("/api/kinds/:kind/services", get(list_kind_services))
        .route("/api/endpoints", get(list_endpoints))
        .route("/api/test-connection", post(test_connection))
        .route("/api/instances/:id/call/*endpoint", get(call_endpoint))
        .route("/api/instances/:id/proxy", post(proxy_endpoint))
        .route("/api/instances/:id/download", get(download_same_origin))
        .route("/api/unraid/:id/subscribe", post(unraid_subscribe))
        .route("/api/unraid/:id/unsubscribe", post(unraid_unsubscribe))
        .route("/api/unraid/:id/connected", get(unraid_connected))
        .route("/api/unraid/:id/events", get(unraid_events))
        .with_state(state)
}

pub async fn start(
    addr: SocketAddr,
    state: SharedState,
    shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "http server listening");
    serve(listener, state, shutdown_rx).await
}

pub async fn serve(
    listener: TcpListener,
    state: SharedState,
    mut shutdown_rx: watch::Receiver<bool>,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
}

fn is_token_valid(headers: &HeaderMap, query_token: Option<&str>, token: &str) -> bool {
    // Bearer header for API clients, ?token= for the dashboard's websocket.
    if let Some(auth_header) = headers.get("authorization") {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(provided) = auth_str.strip_prefix("Bearer ") {
                return ct_eq(provided, token);
            }
        }
    }
    query_token.map(|t| ct_eq(t, token)).unwrap_or(false)
}

fn ct_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let len = a.len().max(b.len());
    let mut diff = u8::from(a.len() != b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= x ^ y;
    }
    diff == 0
}

fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> Result<(), Response> {
    if is_token_valid(headers, query.get(TOKEN_PARAM).map(String::as_str), &state.token) {
        Ok(())
    } else {
        Err(error_response(StatusCode::UNAUTHORIZED, "unauthorized", "missing or invalid token"))
    }
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "error": code, "message": message.into() })),
    )
        .into_response()
}

fn proxy_error_response(err: &ProxyError) -> Response {
    let message = err.to_string();
    match err {
        ProxyError::InvalidConfiguration(rejection) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "error": "invalid_configuration",
                "reason": rejection.reason(),
                "message": message,
            })),
        )
            .into_response(),
        ProxyError::InvalidArgument { .. } => {
            error_response(StatusCode::BAD_REQUEST, "invalid_argument", message)
        }
        ProxyError::EndpointNotAllowlisted { .. } => {
            error_response(StatusCode::NOT_FOUND, "endpoint_not_allowlisted", message)
        }
        ProxyError::Upstream(UpstreamFailure::Status { status, body }) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "error": "upstream_status",
                "upstream_status": status,
                "body": body,
                "message": message,
            })),
        )
            .into_response(),
        ProxyError::Upstream(UpstreamFailure::Timeout) => {
            error_response(StatusCode::GATEWAY_TIMEOUT, "upstream_timeout", message)
        }
        ProxyError::Upstream(UpstreamFailure::Connect(_)) => {
            error_response(StatusCode::BAD_GATEWAY, "upstream_unreachable", message)
        }
        ProxyError::Upstream(UpstreamFailure::Transport(_)) => {
            error_response(StatusCode::BAD_GATEWAY, "upstream_transport", message)
        }
        ProxyError::Upstream(UpstreamFailure::SessionRejected) => {
            error_response(StatusCode::BAD_GATEWAY, "upstream_login_rejected", message)
        }
    }
}

fn find_service<'a>(state: &'a AppState, id: &str) -> Result<&'a ServiceConfig, Response> {
    let service = state.config.service(id).ok_or_else(|| {
        error_response(StatusCode::NOT_FOUND, "not_found", format!("no service '{id}'"))
    })?;
    if !service.enabled {
        return Err(error_response(
            StatusCode::CONFLICT,
            "disabled",
            format!("service '{id}' is disabled"),
        ));
    }
    Ok(service)
}

fn resolve_endpoint(state: &AppState, service: &ServiceConfig) -> Result<ServiceEndpointConfig, Response> {
    service.endpoint(&state.vault).map_err(|err| {
        tracing::error!(service = %service.id, error = %err, "credential lookup failed");
        error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "credentials_unavailable",
            format!("credentials for '{}' could not be loaded", service.id),
        )
    })
}

fn build_client(
    state: &AppState,
    kind: ServiceKind,
    endpoint: &ServiceEndpointConfig,
) -> Result<ServiceClient, Response> {
    ServiceClient::for_endpoint(kind, endpoint)
        .timeout(state.config.upstream.timeout())
        .address_policy(state.config.upstream.address_policy())
        .build()
        .map_err(|err| proxy_error_response(&err))
}

fn client_for_service(state: &AppState, id: &str) -> Result<ServiceClient, Response> {
    let service = find_service(state, id)?;
    let endpoint = resolve_endpoint(state, service)?;
    build_client(state, service.kind, &endpoint)
}

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "timestamp": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
        })),
    )
}

async fn list_services(
    State(state): State<SharedState>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, &query.0) {
        return resp;
    }
    let mut grouped: BTreeMap<ServiceKind, Vec<ServiceSummary>> = BTreeMap::new();
    for service in &state.config.services {
        grouped.entry(service.kind).or_default().push(service.summary());
    }
    Json(grouped).into_response()
}

async fn list_kind_services(
    State(state): State<SharedState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, &query.0) {
        return resp;
    }
    let kind: ServiceKind = match kind.parse() {
        Ok(kind) => kind,
        Err(err) => return error_response(StatusCode::NOT_FOUND, "not_found", format!("{err}")),
    };
    let services: Vec<ServiceSummary> = state.config.services_of(kind).map(ServiceConfig::summary).collect();
    Json(services).into_response()
}

async fn list_endpoints(
    State(state): State<SharedState>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, &query.0) {
        return resp;
    }
    Json(allowlisted_endpoints()).into_response()
}

#[derive(Debug, Deserialize)]
struct TestConnectionRequest {
    kind: ServiceKind,
    url: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

async fn test_connection(
    State(state): State<SharedState>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    Json(payload): Json<TestConnectionRequest>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, &query.0) {
        return resp;
    }
    let endpoint = ServiceEndpointConfig {
        base_url: payload.url,
        api_key: payload.api_key,
        username: payload.username,
        password: payload.password,
    };
    let client = match build_client(&state, payload.kind, &endpoint) {
        Ok(client) => client,
        Err(resp) => return resp,
    };
    match client.status().await {
        Ok(data) => Json(json!({ "success": true, "data": data })).into_response(),
        Err(err) => proxy_error_response(&err),
    }
}

async fn call_endpoint(
    State(state): State<SharedState>,
    Path((id, endpoint)): Path<(String, String)>,
    headers: HeaderMap,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let query_token = pairs
        .iter()
        .find(|(key, _)| key == TOKEN_PARAM)
        .map(|(_, value)| value.as_str());
    if !is_token_valid(&headers, query_token, &state.token) {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized", "missing or invalid token");
    }

    let client = match client_for_service(&state, &id) {
        Ok(client) => client,
        Err(resp) => return resp,
    };
    let mut call = EndpointCall::get(endpoint.trim_start_matches('/'));
    for (key, value) in pairs {
        match key.as_str() {
            TOKEN_PARAM => {}
            RESOURCE_ID_PARAM => call = call.resource(value),
            _ => call = call.query(key, value),
        }
    }
    match client.execute(&call).await {
        Ok(value) => Json(value).into_response(),
        Err(err) => proxy_error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct ProxyRequest {
    endpoint: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    resource_id: Option<String>,
    #[serde(default)]
    query: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<Value>,
}

async fn proxy_endpoint(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
    Json(payload): Json<ProxyRequest>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, &query.0) {
        return resp;
    }
    let method = match payload.method.as_deref() {
        None => HttpMethod::Get,
        Some(raw) => match HttpMethod::parse(raw) {
            Some(method) => method,
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "invalid_argument",
                    format!("unsupported method '{raw}'"),
                )
            }
        },
    };
    let client = match client_for_service(&state, &id) {
        Ok(client) => client,
        Err(resp) => return resp,
    };

    let mut call = EndpointCall::new(method, payload.endpoint);
    if let Some(resource_id) = payload.resource_id {
        call = call.resource(resource_id);
    }
    for (key, value) in payload.query {
        call = call.query(key, value);
    }
    if let Some(body) = payload.body {
        call = call.body(body);
    }
    match client.execute(&call).await {
        Ok(value) => Json(value).into_response(),
        Err(err) => proxy_error_response(&err),
    }
}

async fn download_same_origin(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, &query.0) {
        return resp;
    }
    let Some(raw) = query.0.get("url") else {
        return error_response(StatusCode::BAD_REQUEST, "invalid_argument", "missing url parameter");
    };
    let client = match client_for_service(&state, &id) {
        Ok(client) => client,
        Err(resp) => return resp,
    };
    match client.fetch_same_origin(raw).await {
        Ok(file) => {
            let filename = file.filename.unwrap_or_else(|| "download.torrent".to_string());
            (
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "application/x-bittorrent".to_string()),
                    (
                        header::CONTENT_DISPOSITION,
                        format!("attachment; filename=\"{filename}\""),
                    ),
                ],
                file.bytes,
            )
                .into_response()
        }
        Err(err) => proxy_error_response(&err),
    }
}

fn find_streaming_service<'a>(state: &'a AppState, id: &str) -> Result<&'a ServiceConfig, Response> {
    let service = find_service(state, id)?;
    if !service.kind.supports_subscriptions() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_argument",
            format!("{} services do not stream subscriptions", service.kind),
        ));
    }
    Ok(service)
}

async fn unraid_subscribe(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, &query.0) {
        return resp;
    }
    let endpoint = match find_streaming_service(&state, &id)
        .and_then(|service| resolve_endpoint(&state, service))
    {
        Ok(endpoint) => endpoint,
        Err(resp) => return resp,
    };
    match state
        .bridge
        .subscribe(&id, &endpoint.base_url, endpoint.api_key.as_deref())
    {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => proxy_error_response(&err),
    }
}

async fn unraid_unsubscribe(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, &query.0) {
        return resp;
    }
    state.bridge.unsubscribe(&id);
    Json(json!({ "success": true })).into_response()
}

async fn unraid_connected(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, &query.0) {
        return resp;
    }
    Json(json!({
        "connected": state.bridge.is_connected(&id),
        "state": state.bridge.state(&id),
        "connection": state.bridge.snapshot(&id),
    }))
    .into_response()
}

async fn unraid_events(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    query: Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers, &query.0) {
        return resp;
    }
    if let Err(resp) = find_streaming_service(&state, &id) {
        return resp;
    }
    let rx = state.bridge.events(&id);
    ws.on_upgrade(move |socket| relay_events(socket, id, rx))
}

async fn relay_events(
    mut socket: WebSocket,
    instance_id: String,
    mut rx: tokio::sync::broadcast::Receiver<BridgeEvent>,
) {
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    let payload = match serde_json::to_string(&event) {
                        Ok(payload) => payload,
                        Err(err) => {
                            tracing::warn!(instance = %instance_id, error = %err, "event not serializable");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(instance = %instance_id, skipped, "dashboard client lagging; events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::BridgeOptions;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN: &str = "test-token";

    struct Harness {
        base: String,
        http: reqwest::Client,
        _dir: tempfile::TempDir,
        _shutdown: watch::Sender<bool>,
    }

    impl Harness {
        async fn start(config_toml: &str) -> Self {
            let config: Config = toml::from_str(config_toml).unwrap();
            let dir = tempfile::tempdir().unwrap();
            let vault = Vault::new(dir.path().join("vault.json").to_str()).unwrap();
            let bridge = SubscriptionBridge::new(BridgeOptions::default()).unwrap();
            let state = Arc::new(AppState::new(TOKEN.to_string(), config, vault, bridge));

            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(serve(listener, state, shutdown_rx));

            Self {
                base: format!("http://{addr}"),
                http: reqwest::Client::new(),
                _dir: dir,
                _shutdown: shutdown_tx,
            }
        }

        async fn get(&self, path: &str) -> (StatusCode, Value) {
            let resp = self
                .http
                .get(format!("{}{}", self.base, path))
                .bearer_auth(TOKEN)
                .send()
                .await
                .unwrap();
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
            (status, resp.json().await.unwrap_or(Value::Null))
        }

        async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
            let resp = self
                .http
                .post(format!("{}{}", self.base, path))
                .bearer_auth(TOKEN)
                .json(&body)
                .send()
                .await
                .unwrap();
            let status = StatusCode::from_u16(resp.status().as_u16()).unwrap();
            (status, resp.json().await.unwrap_or(Value::Null))
        }
    }

    fn config_for(upstream: &str) -> String {
        format!(
            r#"
[[services]]
id = "sonarr-main"
kind = "sonarr"
url = "{upstream}"
api_key = "k"

[[services]]
id = "sonarr-old"
kind = "sonarr"
url = "{upstream}"
enabled = false

[[services]]
id = "broken"
kind = "radarr"
url = "gopher://{upstream}"

[[services]]
id = "tower"
kind = "unraid"
url = "{upstream}"

[[services]]
id = "indexers"
kind = "prowlarr"
url = "{upstream}"
api_key = "p"
"#
        )
    }

    #[test]
    fn token_comparison_is_exact() {
        assert!(ct_eq("abc", "abc"));
        assert!(!ct_eq("abc", "abd"));
        assert!(!ct_eq("abc", "abcd"));
        assert!(!ct_eq("", "a"));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc".parse().unwrap());
        assert!(is_token_valid(&headers, None, "abc"));
        assert!(!is_token_valid(&HeaderMap::new(), Some("abd"), "abc"));
        assert!(is_token_valid(&HeaderMap::new(), Some("abc"), "abc"));
    }

    #[tokio::test]
    async fn health_is_public_and_api_requires_token() {
        let harness = Harness::start(&config_for("http://127.0.0.1:9")).await;
        let resp = harness
            .http
            .get(format!("{}/health", harness.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);

        let resp = harness
            .http
            .get(format!("{}/api/services", harness.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 401);

        let resp = harness
            .http
            .get(format!("{}/api/services?token={TOKEN}", harness.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
    }

    #[tokio::test]
    async fn service_listing_strips_credentials() {
        let harness = Harness::start(&config_for("http://127.0.0.1:9")).await;
        let (status, body) = harness.get("/api/services").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sonarr"].as_array().unwrap().len(), 2);
        assert_eq!(body["sonarr"][0]["has_api_key"], true);
        assert!(!body.to_string().contains("\"k\""));

        let (status, body) = harness.get("/api/kinds/unraid/services").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], "tower");

        let (status, _) = harness.get("/api/kinds/plex/services").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = harness.get("/api/endpoints").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["sonarr"]
            .as_array()
            .unwrap()
            .contains(&json!("v3/system/status")));
    }

    #[tokio::test]
    async fn call_route_proxies_allowlisted_get() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/series/12"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 12})))
            .expect(1)
            .mount(&upstream)
            .await;

        let harness = Harness::start(&config_for(&upstream.uri())).await;
        let (status, body) = harness
            .get("/api/instances/sonarr-main/call/v3/series?resource_id=12")
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"id": 12}));
    }

    #[tokio::test]
    async fn call_route_maps_errors_to_statuses() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/system/status"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&upstream)
            .await;

        let harness = Harness::start(&config_for(&upstream.uri())).await;

        let (status, body) = harness.get("/api/instances/sonarr-main/call/v3/system/status").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["upstream_status"], 500);
        assert_eq!(body["body"], "boom");

        let (status, _) = harness.get("/api/instances/nope/call/v3/system/status").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = harness.get("/api/instances/sonarr-old/call/v3/system/status").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "disabled");

        let (status, body) = harness.get("/api/instances/broken/call/v3/system/status").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["reason"], "scheme-not-allowed");

        let (status, body) = harness.get("/api/instances/sonarr-main/call/v3/admin").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "endpoint_not_allowlisted");

        let (status, body) = harness
            .get("/api/instances/sonarr-main/call/v3/series?resource_id=1a")
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_argument");
    }

    #[tokio::test]
    async fn proxy_route_forwards_method_and_body() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v3/command"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 99, "name": "RssSync"})))
            .expect(1)
            .mount(&upstream)
            .await;

        let harness = Harness::start(&config_for(&upstream.uri())).await;
        let (status, body) = harness
            .post(
                "/api/instances/sonarr-main/proxy",
                json!({"endpoint": "v3/command", "method": "post", "body": {"name": "RssSync"}}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], 99);

        let (status, _) = harness
            .post(
                "/api/instances/sonarr-main/proxy",
                json!({"endpoint": "v3/command", "method": "PATCH"}),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_connection_reports_invalid_urls() {
        let harness = Harness::start(&config_for("http://127.0.0.1:9")).await;
        let (status, body) = harness
            .post(
                "/api/test-connection",
                json!({"kind": "sonarr", "url": "file:///etc/passwd"}),
            )
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["reason"], "scheme-not-allowed");
    }

    #[tokio::test]
    async fn subscription_routes_only_serve_streaming_services() {
        let harness = Harness::start(&config_for("http://127.0.0.1:9")).await;
        let (status, _) = harness.post("/api/unraid/sonarr-main/subscribe", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = harness.get("/api/unraid/tower/connected").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connected"], false);
        assert_eq!(body["state"], Value::Null);
        assert_eq!(body["connection"], Value::Null);

        let (status, body) = harness.post("/api/unraid/tower/unsubscribe", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn download_route_only_fetches_from_the_instance_origin() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/2/download"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-disposition", "attachment; filename=\"Show.S01.torrent\"")
                    .set_body_bytes(b"d4:infoe".to_vec()),
            )
            .expect(1)
            .mount(&upstream)
            .await;

        let harness = Harness::start(&config_for(&upstream.uri())).await;

        let foreign = "http://evil.example.com/2/download";
        let resp = harness
            .http
            .get(format!("{}/api/instances/indexers/download", harness.base))
            .query(&[("token", TOKEN), ("url", foreign)])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);

        let own = format!("{}/2/download", upstream.uri());
        let resp = harness
            .http
            .get(format!("{}/api/instances/indexers/download", harness.base))
            .query(&[("token", TOKEN), ("url", own.as_str())])
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(
            resp.headers()["content-disposition"],
            "attachment; filename=\"Show.S01.torrent\""
        );
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"d4:infoe");
    }
}
