//! Configuration for the annotee binary
//!
//! Settings come from an optional TOML file, then environment variables,
//! then command-line flags (applied by the binary).
//!
//! ```toml
//! base = "annotee"
//! buffer_size = 8192
//! metering = { interval = "5s" }
//! log_level = "debug"
//!
//! [link]
//! host = "logs.example.com"
//! project = "chromium"
//! prefix = "bb/linux/123"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::link::{LinkGenerator, ViewerLinkGenerator};
use crate::processor::{MeterPolicy, DEFAULT_BUFFER_SIZE};
use crate::stream::StreamName;

pub const DEFAULT_BASE: &str = "annotee";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnnoteeConfig {
    /// Naming base prepended to every stream
    pub base: String,
    /// Read buffer size for the child's output streams
    pub buffer_size: usize,
    /// How often step snapshots are published
    pub metering: MeterPolicy,
    pub log_level: Option<String>,
    /// Viewer link settings; no links are injected when absent
    pub link: Option<ViewerLinkGenerator>,
}

impl Default for AnnoteeConfig {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE.to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            metering: MeterPolicy::default(),
            log_level: None,
            link: None,
        }
    }
}

impl AnnoteeConfig {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ANNOTEE_BASE` and `ANNOTEE_LOG_LEVEL` from the process environment
    pub fn merge_env_vars(&mut self) {
        self.merge_env(|key| std::env::var(key).ok());
    }

    fn merge_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(base) = var("ANNOTEE_BASE") {
            self.base = base;
        }
        if let Some(level) = var("ANNOTEE_LOG_LEVEL") {
            self.log_level = Some(level);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.base_name()?;
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "buffer_size",
                message: "must be greater than zero".to_string(),
            });
        }
        if let Some(link) = &self.link {
            if link.host.is_empty() || link.project.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "link",
                    message: "host and project are required".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn base_name(&self) -> Result<StreamName, ConfigError> {
        StreamName::new(self.base.as_str()).map_err(|e| ConfigError::Invalid {
            field: "base",
            message: e.to_string(),
        })
    }

    pub fn link_generator(&self) -> Option<Arc<dyn LinkGenerator>> {
        self.link
            .clone()
            .map(|link| Arc::new(link) as Arc<dyn LinkGenerator>)
    }
}
