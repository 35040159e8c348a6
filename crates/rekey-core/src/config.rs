//! Configuration for a pipeline run.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration. Sections:
//!
//! | Section    | Purpose                                                 |
//! |------------|---------------------------------------------------------|
//! | `store`    | Where the document store gateway lives                  |
//! | `query`    | Fields and the aggregation descriptor for the read phase |
//! | `key`      | Modulus and the field the write phase sets              |
//! | `write`    | Bulk-mutation chunk size                                |
//! | `read`     | Read-ahead between the cursor and key derivation        |
//! | `progress` | Logging cadence                                         |

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::error::{PipelineError, Result};

/// Top-level configuration for a pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub store: StoreConfig,
    pub query: QueryConfig,
    pub key: KeyConfig,
    pub write: WriteConfig,
    pub read: ReadConfig,
    pub progress: ProgressConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the store gateway.
    pub url: String,
    pub database: String,
    pub collection: String,
    /// Per-request timeout for the HTTP store.
    pub request_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            database: "gdelt2".to_string(),
            collection: "gdelt2".to_string(),
            request_timeout_ms: 60_000,
        }
    }
}

impl StoreConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Read-phase query settings.
///
/// The generated pipeline filters on `filter_field > filter_gt`, limits the
/// result count, and adds `hex_field` as the string form of `id_field`.
/// Setting `pipeline` replaces the generated stages wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub id_field: String,
    pub hex_field: String,
    pub filter_field: String,
    pub filter_gt: i64,
    pub limit: u64,
    pub allow_disk_use: bool,
    pub cursor_batch_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Vec<Value>>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            id_field: "_id".to_string(),
            hex_field: "hex".to_string(),
            filter_field: "Day".to_string(),
            filter_gt: 20230901,
            limit: 1_000_000,
            allow_disk_use: true,
            cursor_batch_size: 1000,
            pipeline: None,
        }
    }
}

impl QueryConfig {
    /// The aggregation stages sent to the store.
    pub fn stages(&self) -> Vec<Value> {
        if let Some(stages) = &self.pipeline {
            return stages.clone();
        }
        vec![
            json!({ "$match": { self.filter_field.as_str(): { "$gt": self.filter_gt } } }),
            json!({ "$limit": self.limit }),
            json!({ "$set": { self.hex_field.as_str(): { "$toString": format!("${}", self.id_field) } } }),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Divisor applied to each parsed hex value.
    pub modulus: u32,
    /// Field set on each document during the write phase.
    pub field: String,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            modulus: 43,
            field: "key".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    /// Maximum update operations per bulk-mutation call.
    pub batch_size: usize,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self { batch_size: 5000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadConfig {
    /// Documents fetched ahead of key derivation.
    pub prefetch: usize,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self { prefetch: 10_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub log_every: u64,
    pub supervisor_interval_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            log_every: 1000,
            supervisor_interval_ms: 3000,
        }
    }
}

impl ProgressConfig {
    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor_interval_ms)
    }
}

impl PipelineConfig {
    /// Parse and validate a configuration from TOML text.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Render the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PipelineError::Serialization(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.key.modulus == 0 {
            return Err(PipelineError::Config("key.modulus must be greater than 0".to_string()));
        }
        if self.key.field.trim().is_empty() {
            return Err(PipelineError::Config("key.field must not be empty".to_string()));
        }
        if self.write.batch_size == 0 {
            return Err(PipelineError::Config(
                "write.batch_size must be greater than 0".to_string(),
            ));
        }
        if self.read.prefetch == 0 {
            return Err(PipelineError::Config(
                "read.prefetch must be greater than 0".to_string(),
            ));
        }
        if self.read.prefetch > Semaphore::MAX_PERMITS {
            return Err(PipelineError::Config(format!(
                "read.prefetch must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.progress.supervisor_interval_ms == 0 {
            return Err(PipelineError::Config(
                "progress.supervisor_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.store.request_timeout_ms == 0 {
            return Err(PipelineError::Config(
                "store.request_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.progress.log_every == 0 {
            return Err(PipelineError::Config(
                "progress.log_every must be greater than 0".to_string(),
            ));
        }
        if self.query.id_field.trim().is_empty() {
            return Err(PipelineError::Config("query.id_field must not be empty".to_string()));
        }
        if self.query.hex_field.trim().is_empty() {
            return Err(PipelineError::Config("query.hex_field must not be empty".to_string()));
        }
        if matches!(&self.query.pipeline, Some(stages) if stages.is_empty()) {
            return Err(PipelineError::Config(
                "query.pipeline must contain at least one stage".to_string(),
            ));
        }
        Ok(())
    }
}
