use crate::system::error::ConfigError;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// Key/value credential store persisted as a user-owned JSON file.
///
/// The file is created with mode `0600`; saves are atomic (write-temp-then-rename). A
/// missing file loads as an empty store.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<IndexMap<String, String>, ConfigError> {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|err| ConfigError::Credentials(format!("parse {}: {err}", self.path.display()))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(IndexMap::new()),
            Err(err) => Err(ConfigError::Credentials(format!(
                "read {}: {err}",
                self.path.display()
            ))),
        }
    }

    pub fn save(&self, credentials: &IndexMap<String, String>) -> Result<(), ConfigError> {
        let raw = serde_json::to_string_pretty(credentials)
            .map_err(|err| ConfigError::Credentials(format!("serialise: {err}")))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                ConfigError::Credentials(format!("create {}: {err}", parent.display()))
            })?;
        }

        let temp = self.path.with_extension("tmp");
        std::fs::write(&temp, raw)
            .map_err(|err| ConfigError::Credentials(format!("write {}: {err}", temp.display())))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp, std::fs::Permissions::from_mode(0o600)).map_err(
                |err| ConfigError::Credentials(format!("chmod {}: {err}", temp.display())),
            )?;
        }

        std::fs::rename(&temp, &self.path).map_err(|err| {
            ConfigError::Credentials(format!("rename to {}: {err}", self.path.display()))
        })
    }

    /// Insert or replace a single credential.
    pub fn set<K: Into<String>, V: Into<String>>(
        &self,
        key: K,
        value: V,
    ) -> Result<(), ConfigError> {
        let mut credentials = self.load()?;
        credentials.insert(key.into(), value.into());
        self.save(&credentials)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        Ok(self.load()?.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (CredentialStore, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "stratequeue-credentials-{}",
            uuid::Uuid::new_v4()
        ));
        let path = dir.join("credentials.json");
        (CredentialStore::new(&path), dir)
    }

    #[test]
    fn missing_file_loads_empty() {
        let (store, dir) = store();
        assert!(store.load().unwrap().is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn set_get_round_trip() {
        let (store, dir) = store();
        store.set("alpaca_api_key", "key-123").unwrap();
        store.set("alpaca_api_secret", "secret-456").unwrap();

        assert_eq!(store.get("alpaca_api_key").unwrap().unwrap(), "key-123");
        assert_eq!(store.get("alpaca_api_secret").unwrap().unwrap(), "secret-456");
        assert_eq!(store.get("missing").unwrap(), None);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[cfg(unix)]
    #[test]
    fn file_is_user_only() {
        use std::os::unix::fs::PermissionsExt;

        let (store, dir) = store();
        store.set("key", "value").unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let _ = std::fs::remove_dir_all(dir);
    }
}
