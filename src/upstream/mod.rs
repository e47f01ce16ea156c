pub mod endpoints;
pub mod sanitize;

use crate::model::{ServiceEndpointConfig, ServiceKind};
use crate::validator::{validate, AddressPolicy, UrlRejection, ValidatedUrl};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_DISPOSITION, COOKIE, HOST, SET_COOKIE},
    redirect, Client, Request, Response, StatusCode, Url,
};
use serde_json::{json, Value};
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use thiserror::Error;

pub use endpoints::{
    allowlisted_endpoints, lookup, session_login, EndpointAllowlistEntry, HttpMethod, LoginForm,
    SessionLogin,
};
pub use sanitize::validate_relative_path;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const API_KEY_HEADER: &str = "x-api-key";
const REDACTED_QUERY_KEYS: [&str; 5] = ["apikey", "api_key", "token", "password", "pass"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamFailure {
    #[error("upstream returned status {status}")]
    Status { status: u16, body: String },
    #[error("upstream request timed out")]
    Timeout,
    #[error("could not connect to upstream: {0}")]
    Connect(String),
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("upstream rejected the session login")]
    SessionRejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    #[error("invalid service configuration: {0}")]
    InvalidConfiguration(#[from] UrlRejection),
    #[error("invalid {what}: {reason}")]
    InvalidArgument { what: &'static str, reason: String },
    #[error("endpoint '{key}' is not allowlisted for {kind}")]
    EndpointNotAllowlisted { kind: ServiceKind, key: String },
    #[error(transparent)]
    Upstream(#[from] UpstreamFailure),
}

/// One call against the allowlist: a symbolic key plus the only parts a caller may vary.
#[derive(Debug, Clone)]
pub struct EndpointCall {
    pub method: HttpMethod,
    pub key: String,
    pub resource_id: Option<String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl EndpointCall {
    pub fn new(method: HttpMethod, key: impl Into<String>) -> Self {
        Self {
            method,
            key: key.into(),
            resource_id: None,
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, key)
    }

    pub fn post(key: impl Into<String>, body: Value) -> Self {
        Self::new(HttpMethod::Post, key).body(body)
    }

    pub fn resource(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Clone)]
pub struct ServiceClient {
    http: Client,
    kind: ServiceKind,
    base: ValidatedUrl,
    base_url: Url,
    api_key: Option<String>,
    username: Option<String>,
    password: Option<String>,
    headers: HeaderMap,
    // `Cookie` value from the last session login, shared by clones.
    session: Arc<Mutex<Option<HeaderValue>>>,
}

/// Body of a same-origin download plus the filename the upstream suggested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub bytes: Vec<u8>,
    pub filename: Option<String>,
}

impl fmt::Debug for ServiceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceClient")
            .field("kind", &self.kind)
            .field("base", &self.base.base())
            .field("has_api_key", &self.api_key.is_some())
            .field("has_username", &self.username.is_some())
            .field("has_password", &self.password.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct ServiceClientBuilder {
    kind: ServiceKind,
    base_url: String,
    api_key: Option<String>,
    username: Option<String>,
    password: Option<String>,
    headers: Vec<(String, String)>,
    timeout: Duration,
    policy: AddressPolicy,
}

impl ServiceClientBuilder {
    pub fn new(kind: ServiceKind, base_url: impl Into<String>) -> Self {
        Self {
            kind,
            base_url: base_url.into(),
            api_key: None,
            username: None,
            password: None,
            headers: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            policy: AddressPolicy::AllowPrivate,
        }
    }

    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into();
        self.api_key = (!api_key.is_empty()).then_some(api_key);
        self
    }

    /// Sent as HTTP basic auth, or used for the session login on cookie-session kinds.
    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Password without a username (Deluge's web UI login).
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address_policy(mut self, policy: AddressPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Result<ServiceClient, ProxyError> {
        ServiceClient::from_parts(self)
    }
}

impl ServiceClient {
    pub fn builder(kind: ServiceKind, base_url: impl Into<String>) -> ServiceClientBuilder {
        ServiceClientBuilder::new(kind, base_url)
    }

    /// Builder preloaded with the credentials of a stored service.
    pub fn for_endpoint(kind: ServiceKind, config: &ServiceEndpointConfig) -> ServiceClientBuilder {
        let mut builder = Self::builder(kind, config.base_url.clone());
        if let Some(api_key) = &config.api_key {
            builder = builder.api_key(api_key.clone());
        }
        match (&config.username, &config.password) {
            (Some(username), Some(password)) => {
                builder = builder.basic_auth(username.clone(), password.clone());
            }
            (None, Some(password)) => builder = builder.password(password.clone()),
            _ => {}
        }
        builder
    }

    fn from_parts(parts: ServiceClientBuilder) -> Result<Self, ProxyError> {
        let base = validate(&parts.base_url, parts.policy)?;
        let base_url = Url::parse(&base.base()).map_err(|err| {
            ProxyError::InvalidConfiguration(UrlRejection::Malformed(err.to_string()))
        })?;

        let mut headers = HeaderMap::new();
        for (name, value) in &parts.headers {
            let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|err| {
                ProxyError::InvalidArgument {
                    what: "header",
                    reason: err.to_string(),
                }
            })?;
            if name == HOST || name == AUTHORIZATION || name.as_str() == API_KEY_HEADER {
                return Err(ProxyError::InvalidArgument {
                    what: "header",
                    reason: format!("'{name}' cannot be set by callers"),
                });
            }
            let value = HeaderValue::from_str(value).map_err(|err| ProxyError::InvalidArgument {
                what: "header",
                reason: format!("'{name}': {err}"),
            })?;
            headers.insert(name, value);
        }
        if let Some(api_key) = &parts.api_key {
            let mut value = HeaderValue::from_str(api_key).map_err(|_| ProxyError::InvalidArgument {
                what: "api key",
                reason: "contains characters that cannot be sent in a header".to_string(),
            })?;
            value.set_sensitive(true);
            headers.insert(API_KEY_HEADER, value);
        }

        let http = Client::builder()
            .timeout(parts.timeout)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|err| UpstreamFailure::Transport(err.without_url().to_string()))?;

        Ok(Self {
            http,
            kind: parts.kind,
            base,
            base_url,
            api_key: parts.api_key,
            username: parts.username,
            password: parts.password,
            headers,
            session: Arc::new(Mutex::new(None)),
        })
    }

    pub fn kind(&self) -> ServiceKind {
        self.kind
    }

    pub fn base(&self) -> &ValidatedUrl {
        &self.base
    }

    pub fn build_request(&self, call: &EndpointCall) -> Result<Request, ProxyError> {
        let entry = lookup(self.kind, &call.key).ok_or_else(|| ProxyError::EndpointNotAllowlisted {
            kind: self.kind,
            key: call.key.clone(),
        })?;
        if !entry.allows_method(call.method) {
            return Err(ProxyError::InvalidArgument {
                what: "method",
                reason: format!("{} is not permitted for '{}'", call.method.as_str(), entry.key),
            });
        }

        if call.body.is_some() && entry.fixed_body.is_some() {
            return Err(ProxyError::InvalidArgument {
                what: "body",
                reason: format!("'{}' sends a fixed body", entry.key),
            });
        }

        let path = match &call.resource_id {
            Some(_) if !entry.accepts_resource_id => {
                return Err(ProxyError::InvalidArgument {
                    what: "resource id",
                    reason: format!("'{}' does not take a resource id", entry.key),
                });
            }
            Some(id) => {
                sanitize::validate_resource_id(id)?;
                format!("{}/{}", entry.path, id)
            }
            None => entry.path.to_string(),
        };
        validate_relative_path(&path)?;

        for (key, value) in &call.query {
            sanitize::validate_query_key(key)?;
            if entry.reserves_query_key(key) {
                return Err(ProxyError::InvalidArgument {
                    what: "query key",
                    reason: format!("'{key}' is fixed for '{}'", entry.key),
                });
            }
            sanitize::validate_query_value(value)?;
        }

        let mut url = Url::parse(&format!("{}{}", self.base.base(), path)).map_err(|err| {
            ProxyError::InvalidArgument {
                what: "path",
                reason: err.to_string(),
            }
        })?;
        if url.origin() != self.base_url.origin() {
            return Err(ProxyError::InvalidArgument {
                what: "path",
                reason: "request would leave the configured origin".to_string(),
            });
        }

        let api_key_param = entry.api_key_query.zip(self.api_key.as_deref());
        if !entry.fixed_query.is_empty() || api_key_param.is_some() || !call.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in entry.fixed_query {
                pairs.append_pair(key, value);
            }
            if let Some((key, value)) = api_key_param {
                pairs.append_pair(key, value);
            }
            for (key, value) in &call.query {
                pairs.append_pair(key, value);
            }
        }

        let mut builder = self
            .http
            .request(call.method.as_reqwest(), url)
            .headers(self.headers.clone());
        if session_login(self.kind).is_none() {
            if let (Some(username), Some(password)) = (&self.username, &self.password) {
                builder = builder.basic_auth(username, Some(password));
            }
        }
        if let Some(fixed) = entry.fixed_body {
            let body: Value = serde_json::from_str(fixed).map_err(|err| ProxyError::InvalidArgument {
                what: "body",
                reason: err.to_string(),
            })?;
            builder = builder.json(&body);
        } else if let Some(body) = &call.body {
            builder = builder.json(body);
        }
        builder.build().map_err(|err| ProxyError::InvalidArgument {
            what: "request",
            reason: err.without_url().to_string(),
        })
    }

    pub async fn execute(&self, call: &EndpointCall) -> Result<Value, ProxyError> {
        let mut request = self.build_request(call)?;
        if let Some(cookie) = self.ensure_session().await? {
            request.headers_mut().insert(COOKIE, cookie);
        }
        let method = request.method().clone();
        let url = redact_url(request.url());
        tracing::info!(service = %self.kind, method = %method, url = %url, "upstream request");

        let response = match self.http.execute(request).await {
            Ok(response) => response,
            Err(err) => {
                let failure = classify(err);
                tracing::warn!(service = %self.kind, url = %url, error = %failure, "upstream request failed");
                return Err(failure.into());
            }
        };
        let status = response.status();
        let body = response.text().await.map_err(|err| {
            let failure = classify(err);
            tracing::warn!(service = %self.kind, url = %url, error = %failure, "upstream body read failed");
            ProxyError::from(failure)
        })?;

        let parsed = parse_response(status, &body);
        if let Err(err) = &parsed {
            tracing::warn!(service = %self.kind, url = %url, error = %err, "upstream returned an error");
        }
        parsed
    }

    pub async fn get(&self, key: &str, query: &[(&str, &str)]) -> Result<Value, ProxyError> {
        let mut call = EndpointCall::get(key);
        for (k, v) in query {
            call = call.query(*k, *v);
        }
        self.execute(&call).await
    }

    pub async fn get_resource(&self, key: &str, id: &str) -> Result<Value, ProxyError> {
        self.execute(&EndpointCall::get(key).resource(id)).await
    }

    pub async fn post(&self, key: &str, body: Value) -> Result<Value, ProxyError> {
        self.execute(&EndpointCall::post(key, body)).await
    }

    pub async fn put(&self, key: &str, id: &str, body: Value) -> Result<Value, ProxyError> {
        self.execute(&EndpointCall::new(HttpMethod::Put, key).resource(id).body(body))
            .await
    }

    pub async fn delete(&self, key: &str, id: &str) -> Result<Value, ProxyError> {
        self.execute(&EndpointCall::new(HttpMethod::Delete, key).resource(id))
            .await
    }

    /// Calls the kind's status endpoint; used by connection tests.
    pub async fn status(&self) -> Result<Value, ProxyError> {
        let key = self.kind.status_endpoint();
        let method = lookup(self.kind, key)
            .map(EndpointAllowlistEntry::default_method)
            .unwrap_or(HttpMethod::Get);
        self.execute(&EndpointCall::new(method, key)).await
    }

    /// Opens a fresh cookie session for kinds that need one. `Ok(false)` when the kind has
    /// no session login or the credentials it needs are not configured.
    pub async fn login(&self) -> Result<bool, ProxyError> {
        let Some(login) = session_login(self.kind) else {
            return Ok(false);
        };
        let Some(request) = self.build_login_request(login)? else {
            return Ok(false);
        };
        let cookie = self.send_login(login, request).await?;
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(cookie);
        Ok(true)
    }

    async fn ensure_session(&self) -> Result<Option<HeaderValue>, ProxyError> {
        let cached = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if cached.is_some() {
            return Ok(cached);
        }
        if !self.login().await? {
            return Ok(None);
        }
        Ok(self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn build_login_request(&self, login: &SessionLogin) -> Result<Option<Request>, ProxyError> {
        validate_relative_path(login.path)?;
        let url = Url::parse(&format!("{}{}", self.base.base(), login.path)).map_err(|err| {
            ProxyError::InvalidArgument {
                what: "path",
                reason: err.to_string(),
            }
        })?;
        let builder = self.http.post(url);
        let builder = match (login.form, &self.username, &self.password) {
            (LoginForm::UsernamePassword, Some(username), Some(password)) => {
                builder.form(&[("username", username.as_str()), ("password", password.as_str())])
            }
            (LoginForm::DelugeRpc, _, Some(password)) => builder.json(&json!({
                "method": "auth.login",
                "params": [password],
                "id": 1,
            })),
            _ => return Ok(None),
        };
        builder.build().map(Some).map_err(|err| ProxyError::InvalidArgument {
            what: "request",
            reason: err.without_url().to_string(),
        })
    }

    async fn send_login(&self, login: &SessionLogin, request: Request) -> Result<HeaderValue, ProxyError> {
        tracing::info!(service = %self.kind, path = login.path, "session login");
        let response = self.http.execute(request).await.map_err(|err| {
            let failure = classify(err);
            tracing::warn!(service = %self.kind, error = %failure, "session login failed");
            ProxyError::from(failure)
        })?;
        let status = response.status();
        let cookie = session_cookie(&response, login.cookie);
        let body = response.text().await.map_err(|err| ProxyError::from(classify(err)))?;
        if !status.is_success() {
            return Err(UpstreamFailure::Status {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        // qBittorrent answers a bad password with 200 "Fails." and no cookie.
        let mut value = cookie.ok_or_else(|| {
            tracing::warn!(service = %self.kind, "session login returned no cookie");
            ProxyError::from(UpstreamFailure::SessionRejected)
        })?;
        value.set_sensitive(true);
        Ok(value)
    }

    /// Fetches an absolute URL handed over by a caller (a Prowlarr download link), but only
    /// when it passes the service URL rules and has exactly this client's origin.
    pub async fn fetch_same_origin(&self, raw: &str) -> Result<FetchedFile, ProxyError> {
        let validated = validate(raw, AddressPolicy::AllowPrivate).map_err(|rejection| {
            ProxyError::InvalidArgument {
                what: "download url",
                reason: rejection.to_string(),
            }
        })?;
        let url = Url::parse(&validated.to_string()).map_err(|err| ProxyError::InvalidArgument {
            what: "download url",
            reason: err.to_string(),
        })?;
        if url.origin() != self.base_url.origin() {
            return Err(ProxyError::InvalidArgument {
                what: "download url",
                reason: format!("origin does not match the configured {} instance", self.kind),
            });
        }

        let redacted = redact_url(&url);
        tracing::info!(service = %self.kind, url = %redacted, "same-origin download");
        let response = self
            .http
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|err| ProxyError::from(classify(err)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamFailure::Status {
                status: status.as_u16(),
                body,
            }
            .into());
        }
        let filename = attachment_filename(&response);
        let bytes = response
            .bytes()
            .await
            .map_err(|err| ProxyError::from(classify(err)))?;
        Ok(FetchedFile {
            bytes: bytes.to_vec(),
            filename,
        })
    }
}

/// `name=value` pair of the named cookie from the response's `Set-Cookie` headers.
fn session_cookie(response: &Response, name: &str) -> Option<HeaderValue> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .map(str::trim)
        .find(|pair| {
            pair.split_once('=')
                .map(|(key, _)| key.trim() == name)
                .unwrap_or(false)
        })
        .and_then(|pair| HeaderValue::from_str(pair).ok())
}

fn attachment_filename(response: &Response) -> Option<String> {
    let header = response.headers().get(CONTENT_DISPOSITION)?.to_str().ok()?;
    let (_, rest) = header.split_once("filename=")?;
    let name = rest.split(';').next()?.trim().trim_matches('"');
    let name: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ' | '[' | ']' | '(' | ')'))
        .collect();
    (!name.trim().is_empty()).then_some(name)
}

/// Downstream body as JSON: parsed when possible, a JSON string otherwise, `null` when empty.
pub fn parse_response(status: StatusCode, body: &str) -> Result<Value, ProxyError> {
    if !status.is_success() {
        return Err(UpstreamFailure::Status {
            status: status.as_u16(),
            body: body.to_string(),
        }
        .into());
    }
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string())))
}

fn classify(err: reqwest::Error) -> UpstreamFailure {
    if err.is_timeout() {
        UpstreamFailure::Timeout
    } else if err.is_connect() {
        UpstreamFailure::Connect(err.without_url().to_string())
    } else {
        UpstreamFailure::Transport(err.without_url().to_string())
    }
}

/// URL for logs with credential-bearing query values masked.
pub fn redact_url(url: &Url) -> String {
    let mut redacted = url.clone();
    if url.query().is_some() {
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(key, value)| {
                let masked = REDACTED_QUERY_KEYS
                    .iter()
                    .any(|secret| key.eq_ignore_ascii_case(secret));
                let value = if masked { "REDACTED".into() } else { value.into_owned() };
                (key.into_owned(), value)
            })
            .collect();
        redacted.query_pairs_mut().clear().extend_pairs(pairs);
    }
    redacted.to_string()
}
