//! Sync configuration loaded from TOML

use std::path::{Path, PathBuf};
use std::time::Duration;

use lowband_store::{Schema, DEFAULT_MAX_ATTEMPTS};
use serde::{Deserialize, Serialize};

use crate::download::DownloadConfig;
use crate::engine::EngineConfig;
use crate::errors::{Result, SyncError};
use crate::resilience::RetryPolicy;
use crate::upload::UploadConfig;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub store: StoreSettings,
    pub remote: RemoteSettings,
    pub retry: RetrySettings,
    pub upload: UploadSettings,
    pub download: DownloadSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("lowband.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    pub endpoint: String,
    /// Sent as the `apikey` header when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:54321".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub max_delay_ms: u64,
    pub attempt_timeout_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            backoff_multiplier: policy.backoff_multiplier,
            jitter: policy.jitter,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            attempt_timeout_ms: policy.attempt_timeout.as_millis() as u64,
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
            max_delay: Duration::from_millis(self.max_delay_ms),
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    pub batch_size: usize,
    /// Attempts given to newly queued operations
    pub max_attempts: u32,
    pub interval_secs: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    pub page_size: usize,
    pub table_timeout_secs: u64,
    /// Tables pulled on startup; empty means every table in the schema
    pub tables: Vec<String>,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            table_timeout_secs: 120,
            tables: Vec::new(),
        }
    }
}

impl SyncConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote.endpoint.trim().is_empty() {
            return Err(SyncError::InvalidConfig("remote.endpoint is empty".into()));
        }
        if self.retry.backoff_multiplier < 1.0 || !self.retry.backoff_multiplier.is_finite() {
            return Err(SyncError::InvalidConfig(format!(
                "retry.backoff_multiplier must be >= 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }
        if self.retry.attempt_timeout_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "retry.attempt_timeout_ms must be positive".into(),
            ));
        }
        if self.upload.batch_size == 0 {
            return Err(SyncError::InvalidConfig("upload.batch_size must be positive".into()));
        }
        if self.upload.max_attempts == 0 {
            return Err(SyncError::InvalidConfig("upload.max_attempts must be positive".into()));
        }
        if self.upload.interval_secs == 0 {
            return Err(SyncError::InvalidConfig("upload.interval_secs must be positive".into()));
        }
        if self.download.page_size == 0 {
            return Err(SyncError::InvalidConfig("download.page_size must be positive".into()));
        }
        if self.download.table_timeout_secs == 0 {
            return Err(SyncError::InvalidConfig(
                "download.table_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Configured download tables, checked against the schema
    pub fn tables(&self, schema: &Schema) -> Result<Vec<String>> {
        if self.download.tables.is_empty() {
            return Ok(schema.table_names());
        }
        for table in &self.download.tables {
            schema.table(table)?;
        }
        Ok(self.download.tables.clone())
    }

    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            retry: self.retry.policy(),
        }
    }

    pub fn download_config(&self) -> DownloadConfig {
        DownloadConfig {
            table_timeout: Duration::from_secs(self.download.table_timeout_secs),
            retry: self.retry.policy(),
        }
    }

    pub fn engine_config(&self, schema: &Schema) -> Result<EngineConfig> {
        Ok(EngineConfig {
            upload_interval: Duration::from_secs(self.upload.interval_secs),
            upload_batch_size: self.upload.batch_size,
            download_page_size: self.download.page_size,
            tables: self.tables(schema)?,
            download_on_startup: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_valid() {
        let config = SyncConfig::from_toml_str("").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.retry.policy(), RetryPolicy::default());
        assert_eq!(config.upload.batch_size, 50);
        assert_eq!(config.upload.max_attempts, 5);
        assert_eq!(config.download.page_size, 100);
        assert_eq!(config.download.table_timeout_secs, 120);
    }

    #[test]
    fn test_partial_sections() {
        let config = SyncConfig::from_toml_str(
            r#"
            [remote]
            endpoint = "https://sync.example"

            [retry]
            max_retries = 2
            jitter = false

            [download]
            tables = ["posts", "comments"]
            "#,
        )
        .unwrap();

        assert_eq!(config.remote.endpoint, "https://sync.example");
        assert_eq!(config.retry.max_retries, 2);
        assert!(!config.retry.jitter);
        assert_eq!(config.retry.base_delay_ms, 2000);
        assert_eq!(
            config.tables(&Schema::social()).unwrap(),
            vec!["posts".to_string(), "comments".to_string()]
        );
    }

    #[test]
    fn test_rejects_invalid_values() {
        for content in [
            "[upload]\nbatch_size = 0",
            "[download]\npage_size = 0",
            "[retry]\nbackoff_multiplier = 0.5",
            "[retry]\nattempt_timeout_ms = 0",
        ] {
            let err = SyncConfig::from_toml_str(content).unwrap_err();
            assert!(matches!(err, SyncError::InvalidConfig(_)), "{}", content);
        }

        assert!(matches!(
            SyncConfig::from_toml_str("[upload]\nbatch_size = \"many\"").unwrap_err(),
            SyncError::ConfigParse(_)
        ));
    }

    #[test]
    fn test_unknown_download_table() {
        let config = SyncConfig::from_toml_str("[download]\ntables = [\"nope\"]").unwrap();
        assert!(config.tables(&Schema::social()).is_err());
    }

    #[test]
    fn test_serialized_default_round_trips() {
        let rendered = toml::to_string_pretty(&SyncConfig::default()).unwrap();
        assert_eq!(SyncConfig::from_toml_str(&rendered).unwrap(), SyncConfig::default());
    }
}
