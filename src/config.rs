use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::service::{Credentials, Service};

/// Cached API keys and session for the scrobbling service.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: Service,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

impl Config {
    pub fn set_keys(&mut self, api_key: &str, api_secret: &str) {
        if self.api_key.as_deref() != Some(api_key) {
            self.session_key = None;
            self.username = None;
        }
        self.api_key = Some(api_key.to_string());
        self.api_secret = Some(api_secret.to_string());
    }

    pub fn set_session(&mut self, username: &str, session_key: &str) {
        self.username = Some(username.to_string());
        self.session_key = Some(session_key.to_string());
    }

    pub fn reset_session(&mut self) -> bool {
        let had_session = self.session_key.is_some();
        self.session_key = None;
        self.username = None;
        had_session
    }

    /// Keys without a session, for the authentication calls.
    pub fn service_keys(&self) -> Result<(String, String)> {
        match (non_empty(&self.api_key), non_empty(&self.api_secret)) {
            (Some(key), Some(secret)) => Ok((key, secret)),
            _ => bail!("Missing API key or secret. Run `backscrobble credentials set` first."),
        }
    }

    pub fn credentials(&self) -> Result<Credentials> {
        let (api_key, api_secret) = self.service_keys()?;
        let Some(session_key) = non_empty(&self.session_key) else {
            bail!("No session key cached. Run `backscrobble auth login` first.");
        };
        Ok(Credentials {
            api_key,
            api_secret,
            session_key,
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

pub fn default_config_path() -> PathBuf {
    let fallback = PathBuf::from(".config/backscrobble/config.json");
    dirs::home_dir().map_or(fallback, |home| {
        home.join(".config/backscrobble/config.json")
    })
}

pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed reading config at {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .with_context(|| format!("Failed parsing config at {}", path.display()))?;
    Ok(config)
}

/// Replaces the cache atomically through a sibling temporary file.
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed creating config directory {}", dir.display()))?;
    let serialized =
        serde_json::to_string_pretty(config).context("Failed serializing config to JSON")?;
    let mut file = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed creating temporary file in {}", dir.display()))?;
    writeln!(file, "{serialized}")
        .with_context(|| format!("Failed writing config at {}", path.display()))?;
    file.persist(path)
        .with_context(|| format!("Failed replacing config at {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = load_config(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert!(config.credentials().is_err());
    }

    #[test]
    fn round_trips_credentials() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/config.json");
        let mut config = Config::default();
        config.set_keys("key", "secret");
        config.set_session("listener", "session");
        save_config(&config, &path).unwrap();

        let loaded = load_config(&path).unwrap();
        let credentials = loaded.credentials().unwrap();
        assert_eq!(credentials.api_key, "key");
        assert_eq!(credentials.session_key, "session");
        assert_eq!(loaded.service, Service::LastFm);

        config.reset_session();
        save_config(&config, &path).unwrap();
        assert!(load_config(&path).unwrap().session_key.is_none());
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn changing_api_key_forgets_session() {
        let mut config = Config::default();
        config.set_keys("key", "secret");
        config.set_session("listener", "session");
        config.set_keys("key", "new secret");
        assert!(config.session_key.is_some());
        config.set_keys("other", "secret");
        assert!(config.session_key.is_none());
        assert!(!config.reset_session());
    }
}
