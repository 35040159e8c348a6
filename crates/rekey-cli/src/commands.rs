//! Subcommand implementations

use std::sync::Arc;

use anyhow::{Context, Result};
use rekey_core::{HttpDocumentStore, KeyDeriver, Pipeline, PipelineConfig};
use tracing::{info, warn};

/// Run the full read-then-write pipeline against the configured store.
pub async fn run(config: PipelineConfig) -> Result<()> {
    info!(
        url = %config.store.url,
        database = %config.store.database,
        collection = %config.store.collection,
        modulus = config.key.modulus,
        batch_size = config.write.batch_size,
        "starting rekey run"
    );

    let store = Arc::new(HttpDocumentStore::from_config(&config)?);
    let pipeline = Pipeline::new(store, config)?;

    let token = pipeline.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received Ctrl-C, cancelling run");
            token.cancel();
        }
    });

    let report = pipeline.run().await.context("rekey run failed")?;

    for batch in &report.write.batches {
        println!("{} records updated", batch.modified);
    }
    println!(
        "✅ {} records read, {} records updated in {} batches",
        report.records_read,
        report.write.total_modified(),
        report.write.batches.len()
    );
    Ok(())
}

/// Print `value<TAB>key` for every hex value.
pub fn derive(config: &PipelineConfig, values: &[String]) -> Result<()> {
    let deriver = KeyDeriver::new(config.key.modulus)?;
    for value in values {
        let key = deriver
            .derive(value)
            .with_context(|| format!("cannot derive a key from {:?}", value))?;
        println!("{}\t{}", value, key);
    }
    Ok(())
}

/// Print the effective configuration.
pub fn show_config(config: &PipelineConfig) -> Result<()> {
    print!("{}", config.to_toml_string()?);
    Ok(())
}
