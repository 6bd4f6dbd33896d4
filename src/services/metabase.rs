//! The façade callers talk to: routes requests to adapters and merges their results.

use super::alias_cache::{NodeAliasCache, NodeAliasStore};
use crate::adapters::{Adapter, open_adapter};
use crate::config::MetabaseConfig;
use crate::errors::{MetabaseError, MetabaseResult};
use crate::models::{
    BucketTally, CollectBucketTallies, Consistency, NodeAliasEntry, NodeId, RawCopy, RawObject,
    RawSegment, RawState,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::try_join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Maps every project to exactly one adapter.
///
/// Projects without an explicit assignment belong to the default adapter,
/// which also holds segments, copies and node aliases.
pub struct PartitionRouter {
    adapters: Vec<Arc<dyn Adapter>>,
    default: usize,
    projects: HashMap<Uuid, usize>,
}

impl PartitionRouter {
    pub fn new(default: Arc<dyn Adapter>) -> Self {
        Self {
            adapters: vec![default],
            default: 0,
            projects: HashMap::new(),
        }
    }

    /// Adds an adapter serving `projects`. A project assigned twice keeps the last assignment.
    pub fn with_adapter(
        mut self,
        adapter: Arc<dyn Adapter>,
        projects: impl IntoIterator<Item = Uuid>,
    ) -> Self {
        let index = self.adapters.len();
        self.adapters.push(adapter);
        self.projects
            .extend(projects.into_iter().map(|project| (project, index)));
        self
    }

    pub fn adapters(&self) -> &[Arc<dyn Adapter>] {
        &self.adapters
    }

    pub fn default_adapter(&self) -> &Arc<dyn Adapter> {
        &self.adapters[self.default]
    }

    fn index_for(&self, project: &Uuid) -> usize {
        self.projects.get(project).copied().unwrap_or(self.default)
    }

    pub fn adapter_for(&self, project: &Uuid) -> &Arc<dyn Adapter> {
        &self.adapters[self.index_for(project)]
    }
}

/// Exposes an adapter's alias table to the cache.
struct AdapterAliasStore(Arc<dyn Adapter>);

#[async_trait]
impl NodeAliasStore for AdapterAliasStore {
    async fn ensure_node_aliases(
        &self,
        cancel: &CancellationToken,
        nodes: &[NodeId],
    ) -> MetabaseResult<()> {
        self.0.ensure_node_aliases(cancel, nodes).await
    }

    async fn list_node_aliases(
        &self,
        cancel: &CancellationToken,
    ) -> MetabaseResult<Vec<NodeAliasEntry>> {
        self.0.list_node_aliases(cancel).await
    }
}

/// Sorts per-adapter tallies into one sequence ordered by bucket location.
///
/// A location reported by two adapters means projects are not partitioned
/// disjointly; that is surfaced instead of emitting the bucket twice.
pub fn merge_tallies(parts: Vec<Vec<BucketTally>>) -> MetabaseResult<Vec<BucketTally>> {
    let mut tallies: Vec<BucketTally> = parts.into_iter().flatten().collect();
    tallies.sort_by(|a, b| a.location.cmp(&b.location));
    if let Some(pair) = tallies.windows(2).find(|w| w[0].location == w[1].location) {
        return Err(MetabaseError::data_integrity(format!(
            "bucket {} reported by more than one adapter",
            pair[0].location
        )));
    }
    Ok(tallies)
}

pub struct Metabase {
    router: PartitionRouter,
    aliases: Arc<NodeAliasCache>,
}

impl Metabase {
    pub fn new(router: PartitionRouter) -> Self {
        let store = AdapterAliasStore(router.default_adapter().clone());
        Self {
            aliases: Arc::new(NodeAliasCache::new(Arc::new(store))),
            router,
        }
    }

    /// Opens the adapters named by `config`.
    pub async fn open(config: &MetabaseConfig) -> MetabaseResult<Self> {
        let options = config.adapter_options();
        let mut router = PartitionRouter::new(open_adapter(&config.database_url, &options).await?);
        if let Some(url) = &config.distributed_url {
            let adapter = open_adapter(url, &options).await?;
            router = router.with_adapter(adapter, config.distributed_projects.iter().copied());
        }
        info!(
            adapters = router.adapters().len(),
            routed_projects = config.distributed_projects.len(),
            "metabase opened"
        );
        Ok(Self::new(router))
    }

    pub fn router(&self) -> &PartitionRouter {
        &self.router
    }

    pub fn alias_cache(&self) -> &Arc<NodeAliasCache> {
        &self.aliases
    }

    pub async fn migrate(&self, cancel: &CancellationToken) -> MetabaseResult<()> {
        for adapter in self.router.adapters() {
            adapter.migrate(cancel).await?;
            info!(adapter = adapter.name(), "migration complete");
        }
        Ok(())
    }

    /// Tallies every bucket in `[opts.from, opts.to]`, ordered by location.
    pub async fn collect_bucket_tallies(
        &self,
        cancel: &CancellationToken,
        mut opts: CollectBucketTallies,
    ) -> MetabaseResult<Vec<BucketTally>> {
        opts.verify()?;
        if opts.now.is_none() {
            opts.now = Some(Utc::now());
        }

        debug!(
            from = %opts.from,
            to = %opts.to,
            adapters = self.router.adapters().len(),
            partitioned = opts.use_partition_query,
            "collect bucket tallies"
        );
        let opts = &opts;
        let parts = try_join_all(
            self.router
                .adapters()
                .iter()
                .map(|adapter| adapter.collect_bucket_tallies(cancel, opts)),
        )
        .await?;
        merge_tallies(parts)
    }

    /// Dumps every table of every adapter, sorted canonically.
    pub async fn testing_get_state(
        &self,
        cancel: &CancellationToken,
        consistency: Consistency,
    ) -> MetabaseResult<RawState> {
        let mut state = RawState::default();
        for adapter in self.router.adapters() {
            state
                .objects
                .extend(adapter.testing_get_all_objects(cancel, consistency).await?);
            state.segments.extend(
                adapter
                    .testing_get_all_segments(cancel, consistency, &self.aliases)
                    .await?,
            );
            state
                .copies
                .extend(adapter.testing_get_all_copies(cancel, consistency).await?);
        }
        state.sort();
        Ok(state)
    }

    /// Wipes every adapter and forgets the cached aliases.
    pub async fn testing_delete_all(&self, cancel: &CancellationToken) -> MetabaseResult<()> {
        for adapter in self.router.adapters() {
            adapter.testing_delete_all(cancel).await?;
        }
        self.aliases.reset().await;
        Ok(())
    }

    /// Inserts objects into the adapter owning each project, in input order per adapter.
    pub async fn testing_batch_insert_objects(
        &self,
        cancel: &CancellationToken,
        objects: &[RawObject],
    ) -> MetabaseResult<()> {
        let mut per_adapter: Vec<Vec<RawObject>> = vec![Vec::new(); self.router.adapters().len()];
        for object in objects {
            per_adapter[self.router.index_for(&object.stream.project_id)].push(object.clone());
        }
        for (adapter, batch) in self.router.adapters().iter().zip(per_adapter) {
            if !batch.is_empty() {
                adapter.testing_batch_insert_objects(cancel, &batch).await?;
            }
        }
        Ok(())
    }

    pub async fn testing_batch_insert_segments(
        &self,
        cancel: &CancellationToken,
        segments: &[RawSegment],
    ) -> MetabaseResult<()> {
        self.router
            .default_adapter()
            .testing_batch_insert_segments(cancel, &self.aliases, segments)
            .await
    }

    pub async fn testing_batch_insert_copies(
        &self,
        cancel: &CancellationToken,
        copies: &[RawCopy],
    ) -> MetabaseResult<()> {
        self.router
            .default_adapter()
            .testing_batch_insert_copies(cancel, copies)
            .await
    }
}
