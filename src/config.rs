use crate::adapters::AdapterOptions;
use crate::models::Consistency;
use anyhow::{Context, Result};
use clap::Parser;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Centralized metabase configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct MetabaseConfig {
    /// Relational database; owns every project not routed elsewhere.
    pub database_url: String,
    pub distributed_url: Option<String>,
    /// Projects served by the distributed adapter.
    pub distributed_projects: Vec<Uuid>,
    pub max_connections: u32,
    pub partition_workers: usize,
    pub use_partition_query: bool,
    pub max_staleness: Option<Duration>,
}

impl Default for MetabaseConfig {
    fn default() -> Self {
        let options = AdapterOptions::default();
        Self {
            database_url: "sqlite://./data/metabase.db".into(),
            distributed_url: None,
            distributed_projects: Vec::new(),
            max_connections: options.max_connections,
            partition_workers: options.partition_workers,
            use_partition_query: false,
            max_staleness: None,
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Object storage metabase: migrations and bucket tallies")]
pub struct Args {
    /// Relational database URL (overrides METABASE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Distributed engine URL (overrides METABASE_DISTRIBUTED_URL)
    #[arg(long)]
    pub distributed_url: Option<String>,

    /// Project routed to the distributed engine, repeatable
    /// (overrides METABASE_DISTRIBUTED_PROJECTS)
    #[arg(long = "distributed-project")]
    pub distributed_projects: Vec<Uuid>,

    /// Connection pool size (overrides METABASE_MAX_CONNECTIONS)
    #[arg(long)]
    pub max_connections: Option<u32>,

    /// Concurrent partitions per partitioned tally (overrides METABASE_PARTITION_WORKERS)
    #[arg(long)]
    pub partition_workers: Option<usize>,

    /// Tally with the partitioned scan where supported
    #[arg(long)]
    pub use_partition_query: bool,

    /// Accept tallies up to this many seconds stale
    #[arg(long)]
    pub max_staleness_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(name)
        .map(|value| {
            value
                .parse::<T>()
                .with_context(|| format!("parsing {} value `{}`", name, value))
        })
        .transpose()
}

impl MetabaseConfig {
    /// Parse environment variables + CLI args into MetabaseConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::merge(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merges `args` over the variables visible through `lookup` and the defaults.
    pub fn merge(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        // --- Environment fallback ---
        let env_db = lookup("METABASE_DATABASE_URL").unwrap_or(defaults.database_url);
        let env_distributed = lookup("METABASE_DISTRIBUTED_URL").filter(|url| !url.is_empty());
        let env_projects = match lookup("METABASE_DISTRIBUTED_PROJECTS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    Uuid::parse_str(s).with_context(|| {
                        format!("parsing METABASE_DISTRIBUTED_PROJECTS entry `{}`", s)
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        let env_connections = parse_var(&lookup, "METABASE_MAX_CONNECTIONS")?;
        let env_workers = parse_var(&lookup, "METABASE_PARTITION_WORKERS")?;

        // --- Merge ---
        let cfg = Self {
            database_url: args.database_url.unwrap_or(env_db),
            distributed_url: args.distributed_url.or(env_distributed),
            distributed_projects: if args.distributed_projects.is_empty() {
                env_projects
            } else {
                args.distributed_projects
            },
            max_connections: args
                .max_connections
                .or(env_connections)
                .unwrap_or(defaults.max_connections),
            partition_workers: args
                .partition_workers
                .or(env_workers)
                .unwrap_or(defaults.partition_workers),
            use_partition_query: args.use_partition_query,
            max_staleness: args.max_staleness_secs.map(Duration::from_secs),
        };

        if cfg.distributed_url.is_none() && !cfg.distributed_projects.is_empty() {
            anyhow::bail!("distributed projects are configured without a distributed URL");
        }
        Ok(cfg)
    }

    /// Read consistency requested for tallies.
    pub fn consistency(&self) -> Consistency {
        self.max_staleness
            .map_or(Consistency::Strong, Consistency::BoundedStaleness)
    }

    pub fn adapter_options(&self) -> AdapterOptions {
        AdapterOptions {
            max_connections: self.max_connections,
            partition_workers: self.partition_workers,
            ..AdapterOptions::default()
        }
    }
}
