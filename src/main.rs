use anyhow::{Context, Result};
use metabase::config::MetabaseConfig;
use metabase::models::{BucketLocation, CollectBucketTallies};
use metabase::services::Metabase;
use std::io::Write;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = MetabaseConfig::from_env_and_args()?;

    tracing::info!("Starting metabase with config: {:?}", cfg);

    // --- Cancel in-flight backend calls on ctrl-c ---
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    let metabase = Metabase::open(&cfg)
        .await
        .context("opening metabase adapters")?;

    // --- Handle migration mode ---
    if migrate {
        metabase
            .migrate(&cancel)
            .await
            .context("running migrations")?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Tally every bucket ---
    let opts = CollectBucketTallies {
        consistency: cfg.consistency(),
        use_partition_query: cfg.use_partition_query,
        ..CollectBucketTallies::new(BucketLocation::min(), BucketLocation::max())
    };
    let tallies = metabase
        .collect_bucket_tallies(&cancel, opts)
        .await
        .context("collecting bucket tallies")?;

    let mut out = std::io::stdout().lock();
    for tally in &tallies {
        serde_json::to_writer(&mut out, tally)?;
        writeln!(out)?;
    }
    tracing::info!("Reported {} buckets", tallies.len());

    Ok(())
}
