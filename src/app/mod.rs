use crate::config::Config;
use crate::security::Vault;
use crate::server::AppState;
use crate::subscription::SubscriptionBridge;
use crate::upstream::{allowlisted_endpoints, ServiceClient};
use crate::validator::{validate, AddressPolicy};
use rand::{distributions::Alphanumeric, Rng};
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::watch;

const SERVER_TOKEN_KEY: &str = "server_token";

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("config-init") => handle_config_init(),
        Some("vault-set") => handle_vault_set(&Config::load()?, args),
        Some("vault-get") => handle_vault_get(&Config::load()?, args),
        Some("vault-list") => handle_vault_list(&Config::load()?),
        Some("check-url") => handle_check_url(args),
        Some("endpoints") => handle_endpoints(),
        Some("check-service") => handle_check_service(&Config::load()?, args).await,
        Some(other) => Err(format!("unknown command '{other}'").into()),
        None => run_server(Config::load()?).await,
    }
}

async fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut vault = Vault::new(config.vault.path.as_deref())?;
    let token = resolve_server_token(&config, &mut vault);

    let ip: IpAddr = config.server.bind.parse()?;
    let addr = SocketAddr::new(ip, config.server.port);

    let bridge = SubscriptionBridge::new(config.subscriptions.bridge_options())?;
    tracing::info!(
        services = config.services.len(),
        upstream_timeout_ms = config.upstream.timeout_ms,
        allow_private = config.upstream.allow_private_addresses,
        "configuration loaded"
    );
    println!("API: http://{}/api/services?token={}", addr, token);

    let state = Arc::new(AppState::new(token, config, vault, bridge.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = tokio::select! {
        res = crate::server::start(addr, state, shutdown_rx) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
            let _ = shutdown_tx.send(true);
            Ok(())
        }
    };

    bridge.unsubscribe_all();
    result?;
    Ok(())
}

/// Configured token first, then the vault, otherwise a fresh one that is persisted.
fn resolve_server_token(config: &Config, vault: &mut Vault) -> String {
    if let Some(token) = config.server.token.as_deref().filter(|t| !t.trim().is_empty()) {
        return token.to_string();
    }
    if let Ok(existing) = vault.retrieve(SERVER_TOKEN_KEY) {
        return existing;
    }
    let token = generate_token(32);
    if let Err(err) = vault.store(SERVER_TOKEN_KEY, &token) {
        tracing::warn!(error = %err, "failed to persist server token; it will change on restart");
    }
    token
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn handle_vault_set(
    config: &Config,
    mut args: impl Iterator<Item = String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let key = args.next().ok_or("missing key")?;
    let value = args.next().ok_or("missing value")?;

    let mut vault = Vault::new(config.vault.path.as_deref())?;
    vault.store(&key, &value)?;

    println!("Stored vault key: {}", key);
    Ok(())
}

fn handle_vault_get(
    config: &Config,
    mut args: impl Iterator<Item = String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let key = args.next().ok_or("missing key")?;

    let vault = Vault::new(config.vault.path.as_deref())?;
    let value = vault.retrieve(&key)?;

    println!("{}", value);
    Ok(())
}

fn handle_vault_list(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let vault = Vault::new(config.vault.path.as_deref())?;
    for key in vault.list_keys() {
        println!("{}", key);
    }
    Ok(())
}

fn handle_check_url(args: impl Iterator<Item = String>) -> Result<(), Box<dyn std::error::Error>> {
    let mut raw = None;
    let mut policy = AddressPolicy::AllowPrivate;
    for arg in args {
        if arg == "--strict" {
            policy = AddressPolicy::DenyPrivate;
        } else if raw.is_none() {
            raw = Some(arg);
        } else {
            return Err(format!("unexpected argument '{arg}'").into());
        }
    }
    let raw = raw.ok_or("missing url (usage: check-url <url> [--strict])")?;

    let report = url_report(&raw, policy);
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report["valid"] == Value::Bool(true) {
        Ok(())
    } else {
        Err("url rejected".into())
    }
}

fn url_report(raw: &str, policy: AddressPolicy) -> Value {
    match validate(raw, policy) {
        Ok(url) => json!({
            "valid": true,
            "scheme": url.scheme().as_str(),
            "host": url.host().to_string(),
            "port": url.port(),
            "path": url.path(),
            "query": url.query(),
            "normalized": url.to_string(),
        }),
        Err(rejection) => json!({
            "valid": false,
            "reason": rejection.reason(),
            "detail": rejection.to_string(),
        }),
    }
}

fn handle_endpoints() -> Result<(), Box<dyn std::error::Error>> {
    for (kind, keys) in allowlisted_endpoints() {
        println!("{kind}");
        for key in keys {
            println!("  {key}");
        }
    }
    Ok(())
}

async fn handle_check_service(
    config: &Config,
    mut args: impl Iterator<Item = String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let id = args
        .next()
        .ok_or("missing service id (usage: check-service <service-id>)")?;
    let service = config
        .service(&id)
        .ok_or_else(|| format!("no service '{id}' in config"))?;

    let endpoint = {
        let vault = Vault::new(config.vault.path.as_deref())?;
        service.endpoint(&vault)?
    };
    let client = ServiceClient::for_endpoint(service.kind, &endpoint)
        .timeout(config.upstream.timeout())
        .address_policy(config.upstream.address_policy())
        .build()?;

    let status = client.status().await?;
    tracing::info!(service = %id, kind = %service.kind, "service check succeeded");
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn generate_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_vault(dir: &tempfile::TempDir) -> Vault {
        Vault::new(dir.path().join("vault.json").to_str()).unwrap()
    }

    #[test]
    fn generated_tokens_are_alphanumeric() {
        let token = generate_token(32);
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(token, generate_token(32));
    }

    #[test]
    fn configured_token_wins() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = temp_vault(&dir);
        vault.store(SERVER_TOKEN_KEY, "from-vault").unwrap();
        let mut config = Config::default();
        config.server.token = Some("from-config".to_string());
        assert_eq!(resolve_server_token(&config, &mut vault), "from-config");
    }

    #[test]
    fn generated_token_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = temp_vault(&dir);
        let config = Config::default();
        let first = resolve_server_token(&config, &mut vault);
        assert_eq!(vault.retrieve(SERVER_TOKEN_KEY).unwrap(), first);

        let mut reopened = temp_vault(&dir);
        assert_eq!(resolve_server_token(&config, &mut reopened), first);
    }

    #[test]
    fn url_report_describes_accepted_urls() {
        let report = url_report("https://Sonarr.Example.com:8443/base?x=1", AddressPolicy::AllowPrivate);
        assert_eq!(report["valid"], true);
        assert_eq!(report["scheme"], "https");
        assert_eq!(report["port"], 8443);
        assert_eq!(report["path"], "/base");
    }

    #[test]
    fn url_report_names_rejection_reason() {
        let report = url_report("http://192.168.1.10:8989", AddressPolicy::DenyPrivate);
        assert_eq!(report["valid"], false);
        assert_eq!(report["reason"], "blocked-address");

        let report = url_report("http://192.168.1.10:8989", AddressPolicy::AllowPrivate);
        assert_eq!(report["valid"], true);

        let report = url_report("ftp://example.com", AddressPolicy::AllowPrivate);
        assert_eq!(report["reason"], "scheme-not-allowed");
    }
}
