use crate::model::ServiceKind;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Delete => reqwest::Method::DELETE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One callable downstream endpoint. `path` is a literal; callers can only append a
/// numeric id (when `accepts_resource_id`) and validated query pairs.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct EndpointAllowlistEntry {
    pub key: &'static str,
    pub path: &'static str,
    pub kinds: &'static [ServiceKind],
    pub methods: &'static [HttpMethod],
    pub accepts_resource_id: bool,
    pub fixed_query: &'static [(&'static str, &'static str)],
    pub api_key_query: Option<&'static str>,
    /// JSON body sent on every call; callers cannot supply their own.
    pub fixed_body: Option<&'static str>,
}

impl EndpointAllowlistEntry {
    pub fn permits(&self, kind: ServiceKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn allows_method(&self, method: HttpMethod) -> bool {
        self.methods.contains(&method)
    }

    /// First listed method; what `status()` and other key-only calls use.
    pub fn default_method(&self) -> HttpMethod {
        self.methods.first().copied().unwrap_or(HttpMethod::Get)
    }

    /// Query keys the caller may not set for this entry.
    pub fn reserves_query_key(&self, key: &str) -> bool {
        self.fixed_query
            .iter()
            .any(|(fixed, _)| fixed.eq_ignore_ascii_case(key))
            || self
                .api_key_query
                .map(|param| param.eq_ignore_ascii_case(key))
                .unwrap_or(false)
    }
}

use HttpMethod::{Delete, Get, Post, Put};
use ServiceKind::*;

const READ: &[HttpMethod] = &[Get];
const WRITE: &[HttpMethod] = &[Post];
const READ_WRITE: &[HttpMethod] = &[Get, Post];
const CRUD: &[HttpMethod] = &[Get, Post, Put, Delete];

const ARR_V3: &[ServiceKind] = &[Sonarr, Radarr];
const ARR_V1: &[ServiceKind] = &[Lidarr, Readarr, Prowlarr];

const fn entry(
    key: &'static str,
    path: &'static str,
    kinds: &'static [ServiceKind],
    methods: &'static [HttpMethod],
) -> EndpointAllowlistEntry {
    EndpointAllowlistEntry {
        key,
        path,
        kinds,
        methods,
        accepts_resource_id: false,
        fixed_query: &[],
        api_key_query: None,
        fixed_body: None,
    }
}

const fn with_id(mut e: EndpointAllowlistEntry) -> EndpointAllowlistEntry {
    e.accepts_resource_id = true;
    e
}

const fn with_query(
    mut e: EndpointAllowlistEntry,
    fixed_query: &'static [(&'static str, &'static str)],
    api_key_query: Option<&'static str>,
) -> EndpointAllowlistEntry {
    e.fixed_query = fixed_query;
    e.api_key_query = api_key_query;
    e
}

const fn with_body(mut e: EndpointAllowlistEntry, body: &'static str) -> EndpointAllowlistEntry {
    e.fixed_body = Some(body);
    e
}

/// How a kind opens a cookie session before its other calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoginForm {
    /// `username=..&password=..` form post.
    UsernamePassword,
    /// Deluge JSON-RPC `auth.login` with the password as the only param.
    DelugeRpc,
}

/// Login call for kinds that authenticate with a session cookie. The body is always
/// built from stored credentials.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SessionLogin {
    pub kind: ServiceKind,
    pub path: &'static str,
    pub form: LoginForm,
    pub cookie: &'static str,
}

pub static SESSION_LOGINS: &[SessionLogin] = &[
    SessionLogin {
        kind: Qbittorrent,
        path: "/api/v2/auth/login",
        form: LoginForm::UsernamePassword,
        cookie: "SID",
    },
    SessionLogin {
        kind: Deluge,
        path: "/json",
        form: LoginForm::DelugeRpc,
        cookie: "_session_id",
    },
];

pub fn session_login(kind: ServiceKind) -> Option<&'static SessionLogin> {
    SESSION_LOGINS.iter().find(|login| login.kind == kind)
}

pub static ENDPOINTS: &[EndpointAllowlistEntry] = &[
    // Sonarr / Radarr
    entry("v3/system/status", "/api/v3/system/status", ARR_V3, READ),
    with_id(entry("v3/series", "/api/v3/series", &[Sonarr], CRUD)),
    entry("v3/series/lookup", "/api/v3/series/lookup", &[Sonarr], READ),
    with_id(entry("v3/movie", "/api/v3/movie", &[Radarr], CRUD)),
    entry("v3/movie/lookup", "/api/v3/movie/lookup", &[Radarr], READ),
    with_id(entry("v3/queue", "/api/v3/queue", ARR_V3, &[Get, Delete])),
    entry("v3/calendar", "/api/v3/calendar", ARR_V3, READ),
    entry("v3/history", "/api/v3/history", ARR_V3, READ),
    with_id(entry("v3/command", "/api/v3/command", ARR_V3, READ_WRITE)),
    // Lidarr / Readarr / Prowlarr
    entry("v1/system/status", "/api/v1/system/status", ARR_V1, READ),
    with_id(entry("v1/artist", "/api/v1/artist", &[Lidarr], CRUD)),
    entry("v1/artist/lookup", "/api/v1/artist/lookup", &[Lidarr], READ),
    with_id(entry("v1/author", "/api/v1/author", &[Readarr], CRUD)),
    with_id(entry("v1/book", "/api/v1/book", &[Readarr], READ)),
    with_id(entry("v1/indexer", "/api/v1/indexer", &[Prowlarr], READ)),
    entry("v1/search", "/api/v1/search", &[Readarr, Prowlarr, Overseerr], READ),
    // Overseerr
    entry("v1/status", "/api/v1/status", &[Overseerr], READ),
    with_id(entry("v1/request", "/api/v1/request", &[Overseerr], CRUD)),
    // Tautulli
    with_query(
        entry("tautulli/activity", "/api/v2", &[Tautulli], READ),
        &[("cmd", "get_activity")],
        Some("apikey"),
    ),
    with_query(
        entry("tautulli/history", "/api/v2", &[Tautulli], READ),
        &[("cmd", "get_history")],
        Some("apikey"),
    ),
    with_query(
        entry("tautulli/libraries", "/api/v2", &[Tautulli], READ),
        &[("cmd", "get_libraries")],
        Some("apikey"),
    ),
    // SABnzbd
    with_query(
        entry("sabnzbd/version", "/api", &[Sabnzbd], READ),
        &[("mode", "version"), ("output", "json")],
        Some("apikey"),
    ),
    with_query(
        entry("sabnzbd/queue", "/api", &[Sabnzbd], READ),
        &[("mode", "queue"), ("output", "json")],
        Some("apikey"),
    ),
    with_query(
        entry("sabnzbd/history", "/api", &[Sabnzbd], READ),
        &[("mode", "history"), ("output", "json")],
        Some("apikey"),
    ),
    with_query(
        entry("sabnzbd/pause", "/api", &[Sabnzbd], WRITE),
        &[("mode", "pause"), ("output", "json")],
        Some("apikey"),
    ),
    with_query(
        entry("sabnzbd/resume", "/api", &[Sabnzbd], WRITE),
        &[("mode", "resume"), ("output", "json")],
        Some("apikey"),
    ),
    // NZBGet
    entry("nzbget/version", "/jsonrpc/version", &[Nzbget], READ),
    entry("nzbget/jsonrpc", "/jsonrpc", &[Nzbget], WRITE),
    // qBittorrent
    entry("v2/app/version", "/api/v2/app/version", &[Qbittorrent], READ),
    entry("v2/torrents/info", "/api/v2/torrents/info", &[Qbittorrent], READ),
    entry("v2/torrents/pause", "/api/v2/torrents/pause", &[Qbittorrent], WRITE),
    entry("v2/torrents/resume", "/api/v2/torrents/resume", &[Qbittorrent], WRITE),
    entry("v2/torrents/add", "/api/v2/torrents/add", &[Qbittorrent], WRITE),
    // Deluge
    entry("deluge/json", "/json", &[Deluge], WRITE),
    with_body(
        entry("deluge/check-session", "/json", &[Deluge], WRITE),
        r#"{"method":"auth.check_session","params":[],"id":1}"#,
    ),
    // Jackett
    with_query(
        entry("jackett/indexers", "/api/v2.0/indexers", &[Jackett], READ),
        &[],
        Some("apikey"),
    ),
    with_query(
        entry("jackett/results", "/api/v2.0/indexers/all/results", &[Jackett], READ),
        &[],
        Some("apikey"),
    ),
    // Unraid
    entry(
        "unraid/system-stats",
        "/plugins/dynamix/include/SystemStats.php",
        &[Unraid],
        READ,
    ),
    with_query(
        entry(
            "unraid/docker",
            "/plugins/dynamix.docker.manager/include/DockerClient.php",
            &[Unraid],
            READ,
        ),
        &[("action", "list_containers")],
        None,
    ),
    entry(
        "unraid/docker-action",
        "/plugins/dynamix.docker.manager/include/DockerClient.php",
        &[Unraid],
        WRITE,
    ),
    entry(
        "unraid/vms",
        "/plugins/dynamix.vm.manager/include/VMMachines.php",
        &[Unraid],
        READ,
    ),
    entry(
        "unraid/array",
        "/plugins/dynamix/include/ArrayStatus.php",
        &[Unraid],
        READ,
    ),
];

pub fn lookup(kind: ServiceKind, key: &str) -> Option<&'static EndpointAllowlistEntry> {
    ENDPOINTS
        .iter()
        .find(|entry| entry.key == key && entry.permits(kind))
}

/// Allowlist keys per service kind, for the `endpoints` listing.
pub fn allowlisted_endpoints() -> BTreeMap<ServiceKind, Vec<&'static str>> {
    let mut grouped: BTreeMap<ServiceKind, Vec<&'static str>> = BTreeMap::new();
    for entry in ENDPOINTS {
        for kind in entry.kinds {
            grouped.entry(*kind).or_default().push(entry.key);
        }
    }
    grouped
}
