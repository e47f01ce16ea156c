use crate::model::{ServiceEndpointConfig, ServiceKind, ServiceSummary};
use crate::security::Vault;
use crate::subscription::BridgeOptions;
use crate::upstream::validate_relative_path;
use crate::validator::AddressPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "media-connector";
const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "MEDIA_CONNECTOR_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub vault: VaultConfig,
    pub upstream: UpstreamConfig,
    pub subscriptions: SubscriptionsConfig,
    pub services: Vec<ServiceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3001,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct VaultConfig {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub timeout_ms: u64,
    /// Service URLs are operator-configured; set false to apply the strict address policy.
    pub allow_private_addresses: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            allow_private_addresses: true,
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn address_policy(&self) -> AddressPolicy {
        if self.allow_private_addresses {
            AddressPolicy::AllowPrivate
        } else {
            AddressPolicy::DenyPrivate
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SubscriptionsConfig {
    pub endpoint_path: String,
    pub connect_timeout_ms: u64,
    pub event_buffer: usize,
}

impl Default for SubscriptionsConfig {
    fn default() -> Self {
        let defaults = BridgeOptions::default();
        Self {
            endpoint_path: defaults.endpoint_path,
            connect_timeout_ms: defaults.connect_timeout.as_millis() as u64,
            event_buffer: defaults.event_buffer,
        }
    }
}

impl SubscriptionsConfig {
    pub fn bridge_options(&self) -> BridgeOptions {
        BridgeOptions {
            endpoint_path: self.endpoint_path.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            event_buffer: self.event_buffer,
        }
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    pub id: String,
    pub kind: ServiceKind,
    #[serde(default)]
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_key: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_key_key", &self.api_key_key)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_key", &self.password_key)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl ServiceConfig {
    /// Connection material with vault references resolved. Inline values win.
    pub fn endpoint(&self, vault: &Vault) -> Result<ServiceEndpointConfig, Box<dyn std::error::Error>> {
        let api_key = resolve_secret(vault, self.api_key.as_deref(), self.api_key_key.as_deref())?;
        let password = resolve_secret(vault, self.password.as_deref(), self.password_key.as_deref())?;
        Ok(ServiceEndpointConfig {
            base_url: self.url.clone(),
            api_key,
            username: self.username.clone().filter(|u| !u.is_empty()),
            password,
        })
    }

    pub fn summary(&self) -> ServiceSummary {
        ServiceSummary {
            id: self.id.clone(),
            kind: self.kind,
            name: if self.name.is_empty() {
                self.kind.to_string()
            } else {
                self.name.clone()
            },
            url: self.url.clone(),
            enabled: self.enabled,
            has_api_key: self.api_key.is_some() || self.api_key_key.is_some(),
            has_basic_auth: self.username.is_some()
                && (self.password.is_some() || self.password_key.is_some()),
        }
    }
}

fn resolve_secret(
    vault: &Vault,
    inline: Option<&str>,
    key: Option<&str>,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    if let Some(value) = inline.filter(|v| !v.is_empty()) {
        return Ok(Some(value.to_string()));
    }
    match key {
        Some(key) => vault
            .retrieve(key)
            .map(Some)
            .map_err(|err| format!("vault key '{key}': {err}").into()),
        None => Ok(None),
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::load_from(active_config_path())?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a config file without env overrides; a missing file yields defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        toml::from_str::<Config>(&raw)
            .map_err(|err| format!("{}: {err}", path.display()).into())
    }

    fn apply_env_overrides(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        // Server settings
        if let Ok(val) = env::var(format!("{}SERVER_BIND", ENV_PREFIX)) {
            self.server.bind = val;
        }
        if let Ok(val) = env::var(format!("{}SERVER_PORT", ENV_PREFIX)) {
            self.server.port = val
                .parse()
                .map_err(|_| format!("{}SERVER_PORT must be a port number", ENV_PREFIX))?;
        }
        if let Ok(val) = env::var(format!("{}SERVER_TOKEN", ENV_PREFIX)) {
            self.server.token = Some(val);
        }

        // Vault settings
        if let Ok(val) = env::var(format!("{}VAULT_PATH", ENV_PREFIX)) {
            self.vault.path = Some(val);
        }

        // Upstream settings
        if let Ok(val) = env::var(format!("{}UPSTREAM_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(timeout) = val.parse() {
                self.upstream.timeout_ms = timeout;
            }
        }
        if let Ok(val) = env::var(format!("{}UPSTREAM_ALLOW_PRIVATE", ENV_PREFIX)) {
            self.upstream.allow_private_addresses = val.parse().unwrap_or(true);
        }

        // Subscription settings
        if let Ok(val) = env::var(format!("{}SUBSCRIPTIONS_ENDPOINT_PATH", ENV_PREFIX)) {
            self.subscriptions.endpoint_path = val;
        }
        if let Ok(val) = env::var(format!("{}SUBSCRIPTIONS_CONNECT_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(timeout) = val.parse() {
                self.subscriptions.connect_timeout_ms = timeout;
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.port == 0 {
            return Err("server.port must be non-zero".into());
        }
        if self.server.bind.parse::<IpAddr>().is_err() {
            return Err("server.bind must be an IP address".into());
        }
        if self.upstream.timeout_ms < 1000 {
            return Err("upstream.timeout_ms must be >= 1000".into());
        }
        if self.subscriptions.connect_timeout_ms < 500 {
            return Err("subscriptions.connect_timeout_ms must be >= 500".into());
        }
        if self.subscriptions.event_buffer == 0 {
            return Err("subscriptions.event_buffer must be non-zero".into());
        }
        if let Err(err) = validate_relative_path(&self.subscriptions.endpoint_path) {
            return Err(format!("subscriptions.endpoint_path: {err}").into());
        }

        let mut seen = HashSet::new();
        for service in &self.services {
            if service.id.trim().is_empty() {
                return Err("services[].id must be set".into());
            }
            if !seen.insert(service.id.as_str()) {
                return Err(format!("duplicate service id '{}'", service.id).into());
            }
        }
        Ok(())
    }

    pub fn service(&self, id: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|service| service.id == id)
    }

    pub fn services_of(&self, kind: ServiceKind) -> impl Iterator<Item = &ServiceConfig> {
        self.services.iter().filter(move |service| service.kind == kind)
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        Config::default().save_to(path)
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        self.validate()?;
        let data = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

/// Per-user directory for config and vault files.
pub fn config_dir() -> PathBuf {
    let base = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| env::var("HOME").map(|home| Path::new(&home).join(".config")))
        .unwrap_or_else(|_| PathBuf::from("."));
    base.join(APP_DIR)
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    config_dir().join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[server]
port = 4000

[[services]]
id = "sonarr-main"
kind = "sonarr"
name = "Sonarr"
url = "http://192.168.1.50:8989"
api_key = "inline-key"

[[services]]
id = "tower"
kind = "unraid"
url = "http://tower.lan"
api_key_key = "unraid_api_key"
username = "root"
password_key = "unraid_password"
enabled = false
"#;

    fn sample() -> Config {
        toml::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.subscriptions.endpoint_path, "/graphql");
        assert_eq!(parsed.upstream.timeout_ms, 30_000);
    }

    #[test]
    fn sample_parses_with_defaults_filled_in() {
        let cfg = sample();
        cfg.validate().unwrap();
        assert_eq!(cfg.server.port, 4000);
        assert_eq!(cfg.server.bind, "127.0.0.1");
        assert_eq!(cfg.services.len(), 2);
        assert!(cfg.service("sonarr-main").unwrap().enabled);
        assert!(!cfg.service("tower").unwrap().enabled);
        assert_eq!(cfg.services_of(ServiceKind::Unraid).count(), 1);
        assert!(cfg.service("missing").is_none());
    }

    #[test]
    fn validate_rejects_zero_port_and_short_timeouts() {
        let mut cfg = Config::default();
        cfg.server.port = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.upstream.timeout_ms = 999;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.subscriptions.connect_timeout_ms = 100;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.subscriptions.event_buffer = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.server.bind = "localhost:80".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unsafe_endpoint_path() {
        let mut cfg = Config::default();
        cfg.subscriptions.endpoint_path = "http://evil.example.com/graphql".to_string();
        assert!(cfg.validate().is_err());
        cfg.subscriptions.endpoint_path = "graphql".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_or_blank_ids() {
        let mut cfg = sample();
        cfg.services[1].id = "sonarr-main".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = sample();
        cfg.services[0].id = "  ".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_service_url_does_not_block_loading() {
        let mut cfg = sample();
        cfg.services[0].url = "file:///etc/passwd".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn endpoint_resolves_vault_references() {
        let dir = tempfile::tempdir().unwrap();
        let vault_path = dir.path().join("vault.json");
        let mut vault = Vault::new(vault_path.to_str()).unwrap();
        vault.store("unraid_api_key", "from-vault").unwrap();
        vault.store("unraid_password", "pw").unwrap();

        let cfg = sample();
        let tower = cfg.service("tower").unwrap().endpoint(&vault).unwrap();
        assert_eq!(tower.base_url, "http://tower.lan");
        assert_eq!(tower.api_key.as_deref(), Some("from-vault"));
        assert_eq!(tower.username.as_deref(), Some("root"));
        assert_eq!(tower.password.as_deref(), Some("pw"));

        let sonarr = cfg.service("sonarr-main").unwrap().endpoint(&vault).unwrap();
        assert_eq!(sonarr.api_key.as_deref(), Some("inline-key"));
        assert!(sonarr.password.is_none());
    }

    #[test]
    fn missing_vault_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::new(dir.path().join("vault.json").to_str()).unwrap();
        let cfg = sample();
        let err = cfg.service("tower").unwrap().endpoint(&vault).unwrap_err();
        assert!(err.to_string().contains("unraid_api_key"));
    }

    #[test]
    fn summary_and_debug_hide_credentials() {
        let cfg = sample();
        let sonarr = cfg.service("sonarr-main").unwrap();
        let summary = serde_json::to_string(&sonarr.summary()).unwrap();
        assert!(!summary.contains("inline-key"));
        assert!(summary.contains("\"has_api_key\":true"));
        assert!(!format!("{sonarr:?}").contains("inline-key"));

        let tower = cfg.service("tower").unwrap().summary();
        assert_eq!(tower.name, "unraid");
        assert!(tower.has_basic_auth);
    }

    #[test]
    fn save_and_load_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        sample().save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.services.len(), 2);
        assert_eq!(loaded.service("tower").unwrap().api_key_key.as_deref(), Some("unraid_api_key"));
        assert!(Config::write_default(&path).is_err());
    }

    #[test]
    fn load_from_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[[services]]\nid = \"x\"\nkind = \"plex\"\nurl = \"http://a\"\n").unwrap();
        assert!(Config::load_from(&path).is_err());
        assert!(Config::load_from(dir.path().join("absent.toml")).unwrap().services.is_empty());
    }

    #[test]
    fn env_overrides_apply_on_top_of_file_values() {
        let mut cfg = sample();
        env::set_var("MEDIA_CONNECTOR_SUBSCRIPTIONS_ENDPOINT_PATH", "/api/graphql");
        env::set_var("MEDIA_CONNECTOR_UPSTREAM_ALLOW_PRIVATE", "false");
        let result = cfg.apply_env_overrides();
        env::remove_var("MEDIA_CONNECTOR_SUBSCRIPTIONS_ENDPOINT_PATH");
        env::remove_var("MEDIA_CONNECTOR_UPSTREAM_ALLOW_PRIVATE");
        result.unwrap();

        assert_eq!(cfg.subscriptions.endpoint_path, "/api/graphql");
        assert_eq!(cfg.upstream.address_policy(), AddressPolicy::DenyPrivate);
        assert_eq!(cfg.subscriptions.bridge_options().endpoint_path, "/api/graphql");
    }
}
