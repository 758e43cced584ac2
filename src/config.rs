use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, env, path::PathBuf};
use thiserror::Error;
use tracing::{error, info};

pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const OPENAI_URL: &str = "OPENAI_URL";
pub const OLLAMA_URL: &str = "OLLAMA_URL";
pub const STORAGE_DIR: &str = "OPENPLUGIN_STORAGE_DIR";
pub const HTTP_TIMEOUT_SECS: &str = "OPENPLUGIN_HTTP_TIMEOUT_SECS";

pub const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// A read-only source of settings, snapshotted once into a [`Config`].
#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, seeded once from a `.env` file at construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            dotenvy::from_path(&env_file).ok();
            info!("Loaded .env from {}", env_file.display());
        } else {
            error!("could not load .env from {}", env_file.display())
        }

        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// In-memory settings, mostly for tests and embedding.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Box<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Box::new(Self {
            map: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        })
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }

    pub fn del(&self, key: &str) {
        self.map.remove(key);
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// Explicit settings handed down the pipeline call chain.
///
/// Credentials only ever live here: providers and processors read them from the
/// `Config` they are given instead of from process-wide state.
#[derive(Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub ollama_url: String,
    /// Where file-producing processors write. A temp dir is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,
    pub http_timeout_secs: u64,
    /// Everything else the loader saw, for processors with custom settings.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_base_url: DEFAULT_OPENAI_URL.to_string(),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            storage_dir: None,
            http_timeout_secs: 60,
            extra: BTreeMap::new(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("openai_api_key", &self.openai_api_key.as_ref().map(|_| "***"))
            .field("openai_base_url", &self.openai_base_url)
            .field("ollama_url", &self.ollama_url)
            .field("storage_dir", &self.storage_dir)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("extra_keys", &self.extra.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Config {
    /// Snapshot the manager into an explicit `Config`.
    pub async fn from_manager(manager: &ConfigManager) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        if let Some(key) = manager.0.get(OPENAI_API_KEY).await {
            if !key.trim().is_empty() {
                config.openai_api_key = Some(key);
            }
        }
        if let Some(url) = manager.0.get(OPENAI_URL).await {
            config.openai_base_url = url;
        }
        if let Some(url) = manager.0.get(OLLAMA_URL).await {
            config.ollama_url = url;
        }
        if let Some(dir) = manager.0.get(STORAGE_DIR).await {
            config.storage_dir = Some(PathBuf::from(dir));
        }
        if let Some(raw) = manager.0.get(HTTP_TIMEOUT_SECS).await {
            config.http_timeout_secs = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: HTTP_TIMEOUT_SECS.to_string(),
                reason: format!("{e}"),
            })?;
        }
        for key in manager.0.keys().await {
            if key.starts_with("OPENPLUGIN_") {
                if let Some(value) = manager.0.get(&key).await {
                    config.extra.insert(key, value);
                }
            }
        }
        Ok(config)
    }

    pub fn with_openai_key(mut self, key: impl Into<String>) -> Self {
        self.openai_api_key = Some(key.into());
        self
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_map_config_manager_basic() {
        let mgr = MapConfigManager::new();

        mgr.set("foo", "bar");
        assert_eq!(mgr.get("foo").await, Some("bar".to_string()));

        mgr.set("foo", "baz");
        assert_eq!(mgr.get("foo").await, Some("baz".to_string()));

        let keys = mgr.keys().await;
        assert_eq!(keys, vec!["foo".to_string()]);

        mgr.del("foo");
        assert_eq!(mgr.get("foo").await, None);
    }

    #[tokio::test]
    async fn test_config_manager_round_trips_through_serde() {
        let mgr = ConfigManager(MapConfigManager::from_pairs([(OPENAI_URL, "http://llm.local/v1")]));
        let json = serde_json::to_string(&mgr).unwrap();
        let back: ConfigManager = serde_json::from_str(&json).unwrap();
        assert_eq!(back.0.get(OPENAI_URL).await.as_deref(), Some("http://llm.local/v1"));
        assert_eq!(back.0.as_vec().await.len(), 1);
    }

    #[tokio::test]
    async fn test_config_from_manager_reads_known_keys() {
        let mgr = ConfigManager(MapConfigManager::from_pairs([
            (OPENAI_API_KEY, "sk-test"),
            (OLLAMA_URL, "http://ollama:11434"),
            (HTTP_TIMEOUT_SECS, "15"),
            ("OPENPLUGIN_S3_BUCKET", "bucket"),
            ("UNRELATED", "x"),
        ]));
        let config = Config::from_manager(&mgr).await.unwrap();
        assert_eq!(config.openai_api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.ollama_url, "http://ollama:11434");
        assert_eq!(config.openai_base_url, DEFAULT_OPENAI_URL);
        assert_eq!(config.http_timeout_secs, 15);
        assert_eq!(config.extra.get("OPENPLUGIN_S3_BUCKET").map(String::as_str), Some("bucket"));
        assert!(!config.extra.contains_key("UNRELATED"));
    }

    #[tokio::test]
    async fn test_config_rejects_bad_timeout() {
        let mgr = ConfigManager(MapConfigManager::from_pairs([(HTTP_TIMEOUT_SECS, "soon")]));
        let err = Config::from_manager(&mgr).await.unwrap_err();
        assert!(err.to_string().contains(HTTP_TIMEOUT_SECS));
    }

    #[test]
    fn test_config_debug_hides_key() {
        let config = Config::default().with_openai_key("sk-secret");
        let out = format!("{config:?}");
        assert!(!out.contains("sk-secret"));
        assert!(out.contains("***"));
    }

    #[tokio::test]
    async fn test_env_config_manager_with_temp_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");

        let content = "OPENPLUGIN_TEST_API_KEY=abc123\nOPENPLUGIN_TEST_LOG_LEVEL=debug\n";
        write(&env_path, content).unwrap();

        let mgr = EnvConfigManager::new(env_path.clone());

        assert_eq!(mgr.get("OPENPLUGIN_TEST_API_KEY").await, Some("abc123".to_string()));
        assert_eq!(mgr.get("OPENPLUGIN_TEST_LOG_LEVEL").await, Some("debug".to_string()));
    }
}
