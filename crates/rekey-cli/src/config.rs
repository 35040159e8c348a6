//! Configuration resolution for the rekey CLI

use std::path::Path;

use anyhow::{Context, Result};
use rekey_core::PipelineConfig;

/// Command-line values that take precedence over the config file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub store_url: Option<String>,
    pub database: Option<String>,
    pub collection: Option<String>,
    pub batch_size: Option<usize>,
    pub modulus: Option<u32>,
}

/// Load the config file (or defaults), apply overrides, then validate.
pub fn resolve(path: Option<&Path>, overrides: &Overrides) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };

    if let Some(url) = &overrides.store_url {
        config.store.url = url.clone();
    }
    if let Some(database) = &overrides.database {
        config.store.database = database.clone();
    }
    if let Some(collection) = &overrides.collection {
        config.store.collection = collection.clone();
    }
    if let Some(batch_size) = overrides.batch_size {
        config.write.batch_size = batch_size;
    }
    if let Some(modulus) = overrides.modulus {
        config.key.modulus = modulus;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}
