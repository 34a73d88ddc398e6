//! Loads `~/.oauth2imaprc` (6. EXTERNAL INTERFACES). The search path is
//! fixed by design — see SPEC_FULL.md §6 on why the Non-goal around
//! "configuration-file discovery format" doesn't extend to this.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct DownstreamConfig {
    pub server: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub downstream: DownstreamConfig,
    /// Raw key/value table: `provider` selects the registry entry, every
    /// other key is an optional [`crate::provider::Provider`] override.
    pub upstream: BTreeMap<String, String>,
}

impl Config {
    pub fn provider_name(&self) -> Result<&str> {
        self.upstream
            .get("provider")
            .map(String::as_str)
            .ok_or_else(|| anyhow!("[upstream] is missing `provider`"))
    }

    pub fn tokens_file(&self) -> PathBuf {
        match self.upstream.get("tokens-file") {
            Some(path) => expand_home(path),
            None => expand_home("~/.oauth2imap.tokens"),
        }
    }
}

pub fn default_path() -> PathBuf {
    expand_home("~/.oauth2imaprc")
}

pub fn load() -> Result<Config> {
    load_from(&default_path())
}

pub fn load_from(path: &PathBuf) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parsing config file {}", path.display()))
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let toml = r#"
            [downstream]
            server = "127.0.0.1"
            port = 143

            [upstream]
            provider = "google"
            username = "user@example.com"
            client-id = "abc"
            client-secret = "def"
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.downstream.port, 143);
        assert_eq!(cfg.provider_name().unwrap(), "google");
        assert!(cfg.downstream.username.is_none());
    }

    #[test]
    fn missing_provider_key_fails() {
        let toml = r#"
            [downstream]
            server = "127.0.0.1"
            port = 143

            [upstream]
            username = "user@example.com"
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert!(cfg.provider_name().is_err());
    }

    #[test]
    fn tokens_file_falls_back_to_default() {
        let toml = r#"
            [downstream]
            server = "127.0.0.1"
            port = 143

            [upstream]
            provider = "google"
        "#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert!(cfg.tokens_file().ends_with(".oauth2imap.tokens"));
    }
}
