use crate::config::config_dir;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::PathBuf};

/// Named secrets (service API keys, passwords, the server token) kept out of config.toml.
///
/// Values are base64-encoded on disk, not encrypted; the file is created owner-only.
#[derive(Debug)]
pub struct Vault {
    path: PathBuf,
    store: VaultStore,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VaultStore {
    entries: BTreeMap<String, String>,
}

impl Vault {
    pub fn new(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        let path = match path {
            Some(p) => PathBuf::from(p),
            None => default_vault_path(),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let store = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw)
                .map_err(|err| format!("vault {} is corrupt: {err}", path.display()))?
        } else {
            VaultStore::default()
        };

        Ok(Self { path, store })
    }

    pub fn store(&mut self, key: &str, value: &str) -> Result<(), Box<dyn std::error::Error>> {
        if key.trim().is_empty() {
            return Err("vault key must not be empty".into());
        }
        let encoded = general_purpose::STANDARD.encode(value.as_bytes());
        self.store.entries.insert(key.to_string(), encoded);
        self.persist()
    }

    pub fn retrieve(&self, key: &str) -> Result<String, Box<dyn std::error::Error>> {
        let encoded = self.store.entries.get(key).ok_or("missing vault key")?;
        let decoded = general_purpose::STANDARD.decode(encoded)?;
        Ok(String::from_utf8(decoded)?)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.entries.contains_key(key)
    }

    pub fn list_keys(&self) -> Vec<String> {
        self.store.entries.keys().cloned().collect()
    }

    fn persist(&self) -> Result<(), Box<dyn std::error::Error>> {
        let data = serde_json::to_string_pretty(&self.store)?;
        fs::write(&self.path, data)?;
        restrict_permissions(&self.path)?;
        Ok(())
    }
}

fn default_vault_path() -> PathBuf {
    config_dir().join("vault.json")
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let path_str = path.to_str().unwrap();

        let mut vault = Vault::new(Some(path_str)).unwrap();
        vault.store("sonarr_api_key", "abc123").unwrap();
        vault.store("server_token", "tok").unwrap();

        let reopened = Vault::new(Some(path_str)).unwrap();
        assert_eq!(reopened.retrieve("sonarr_api_key").unwrap(), "abc123");
        assert!(reopened.contains("server_token"));
        assert_eq!(reopened.list_keys(), vec!["server_token", "sonarr_api_key"]);
    }

    #[test]
    fn values_are_not_stored_in_plain_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let mut vault = Vault::new(path.to_str()).unwrap();
        vault.store("k", "plain-secret").unwrap();
        let raw = fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("plain-secret"));
    }

    #[cfg(unix)]
    #[test]
    fn vault_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        let mut vault = Vault::new(path.to_str()).unwrap();
        vault.store("k", "v").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn missing_and_empty_keys_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = Vault::new(dir.path().join("vault.json").to_str()).unwrap();
        assert!(vault.retrieve("nope").is_err());
        assert!(vault.store(" ", "v").is_err());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.json");
        fs::write(&path, "{not json").unwrap();
        assert!(Vault::new(path.to_str()).is_err());
    }
}
