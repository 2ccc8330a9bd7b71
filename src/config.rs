use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::api::DEFAULT_BASE_URL;
use crate::feed::DEFAULT_PAGE_SIZE;

const DEFAULT_ENV_PREFIX: &str = "AVITOLOG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub listings: ListingsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            timeout: default_timeout(),
        }
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_user_agent() -> String {
    format!("avitolog/{}", crate::VERSION)
}

fn default_timeout() -> Duration {
    Duration::from_secs(20)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_wait_timeout", with = "humantime_serde")]
    pub wait_timeout: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            wait_timeout: default_wait_timeout(),
        }
    }
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_wait_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListingsConfig {
    #[serde(default = "default_popular_limit")]
    pub popular_limit: usize,
}

impl Default for ListingsConfig {
    fn default() -> Self {
        Self {
            popular_limit: default_popular_limit(),
        }
    }
}

fn default_popular_limit() -> usize {
    12
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    cfg = merge_config(cfg, load_env(prefix));

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Overlays `other` onto `base`; empty or default-valued fields in `other` keep the base value.
fn merge_config(mut base: Config, other: Config) -> Config {
    let defaults = Config::default();

    if !other.api.base_url.trim().is_empty() && other.api.base_url != defaults.api.base_url {
        base.api.base_url = other.api.base_url;
    }
    if !other.api.user_agent.trim().is_empty() && other.api.user_agent != defaults.api.user_agent {
        base.api.user_agent = other.api.user_agent;
    }
    if !other.api.timeout.is_zero() && other.api.timeout != defaults.api.timeout {
        base.api.timeout = other.api.timeout;
    }

    if other.feed.page_size != 0 && other.feed.page_size != defaults.feed.page_size {
        base.feed.page_size = other.feed.page_size;
    }
    if !other.feed.wait_timeout.is_zero() && other.feed.wait_timeout != defaults.feed.wait_timeout {
        base.feed.wait_timeout = other.feed.wait_timeout;
    }

    if other.listings.popular_limit != 0
        && other.listings.popular_limit != defaults.listings.popular_limit
    {
        base.listings.popular_limit = other.listings.popular_limit;
    }

    if other.storage.path.is_some() {
        base.storage.path = other.storage.path;
    }

    base
}

fn load_env(prefix: &str) -> Config {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    let mut cfg = Config::default();
    for (key, value) in map {
        apply_env_value(&mut cfg, &key, value);
    }
    cfg
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "api.base_url" => cfg.api.base_url = value,
        "api.user_agent" => cfg.api.user_agent = value,
        "api.timeout" => match humantime::parse_duration(&value) {
            Ok(duration) => cfg.api.timeout = duration,
            Err(err) => tracing::warn!(%value, "ignoring invalid api.timeout: {err}"),
        },
        "feed.page_size" => match value.parse::<usize>() {
            Ok(parsed) => cfg.feed.page_size = parsed,
            Err(err) => tracing::warn!(%value, "ignoring invalid feed.page_size: {err}"),
        },
        "feed.wait_timeout" => match humantime::parse_duration(&value) {
            Ok(duration) => cfg.feed.wait_timeout = duration,
            Err(err) => tracing::warn!(%value, "ignoring invalid feed.wait_timeout: {err}"),
        },
        "listings.popular_limit" => match value.parse::<usize>() {
            Ok(parsed) => cfg.listings.popular_limit = parsed,
            Err(err) => tracing::warn!(%value, "ignoring invalid listings.popular_limit: {err}"),
        },
        "storage.path" => {
            if !value.trim().is_empty() {
                cfg.storage.path = Some(PathBuf::from(value));
            }
        }
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("avitolog").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn isolated(prefix: &str, dir: &tempfile::TempDir) -> LoadOptions {
        LoadOptions {
            config_file: Some(dir.path().join("missing.yaml")),
            env_prefix: Some(prefix.to_string()),
        }
    }

    #[test]
    fn load_defaults_without_files() {
        let dir = tempdir().unwrap();
        let cfg = load(isolated("AVITOLOG_TEST_DEFAULTS", &dir)).unwrap();
        assert_eq!(cfg.api.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.api.timeout, Duration::from_secs(20));
        assert_eq!(cfg.feed.page_size, 10);
        assert_eq!(cfg.feed.wait_timeout, Duration::from_secs(30));
        assert_eq!(cfg.listings.popular_limit, 12);
        assert!(cfg.storage.path.is_none());
    }

    #[test]
    fn reads_yaml_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "api:\n  base_url: https://comments.example.com/\n  timeout: 5s\nfeed:\n  page_size: 25\n",
        )
        .unwrap();
        let cfg = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("AVITOLOG_TEST_FILE".into()),
        })
        .unwrap();
        assert_eq!(cfg.api.base_url, "https://comments.example.com/");
        assert_eq!(cfg.api.timeout, Duration::from_secs(5));
        assert_eq!(cfg.feed.page_size, 25);
        assert_eq!(cfg.listings.popular_limit, 12);
    }

    #[test]
    fn env_overrides() {
        let dir = tempdir().unwrap();
        env::set_var("AVITOLOG_TEST_ENV_FEED__PAGE_SIZE", "5");
        env::set_var("AVITOLOG_TEST_ENV_STORAGE__PATH", "/tmp/avitolog-test.db");
        env::set_var("AVITOLOG_TEST_ENV_API__TIMEOUT", "not a duration");
        let cfg = load(isolated("AVITOLOG_TEST_ENV", &dir)).unwrap();
        assert_eq!(cfg.feed.page_size, 5);
        assert_eq!(
            cfg.storage.path.as_deref(),
            Some(Path::new("/tmp/avitolog-test.db"))
        );
        assert_eq!(cfg.api.timeout, Duration::from_secs(20));
        env::remove_var("AVITOLOG_TEST_ENV_FEED__PAGE_SIZE");
        env::remove_var("AVITOLOG_TEST_ENV_STORAGE__PATH");
        env::remove_var("AVITOLOG_TEST_ENV_API__TIMEOUT");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "feed: [not, a, map]\n").unwrap();
        let err = load(LoadOptions {
            config_file: Some(path),
            env_prefix: Some("AVITOLOG_TEST_BAD".into()),
        })
        .unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config file"));
    }
}
