//! Backend adapters.
//!
//! Every physical engine sits behind [`Adapter`], which exposes the same
//! operation set regardless of how the engine stores or aggregates rows:
//!
//! - `RelationalAdapter`: SQL engine reached through `sqlx`
//! - `DistributedAdapter`: globally distributed engine reached through a
//!   [`distributed::DistributedSession`]
//!
//! An adapter owns exactly one connection pool or session and never shares
//! mutable state with other adapters.

pub mod distributed;
pub mod relational;

pub use distributed::DistributedAdapter;
pub use relational::RelationalAdapter;

use crate::errors::{MetabaseError, MetabaseResult};
use crate::models::{
    BucketTally, CollectBucketTallies, Consistency, NodeAliasEntry, NodeId, RawCopy, RawObject,
    RawSegment,
};
use crate::services::NodeAliasCache;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Rows written per physical backend call by the batch inserts.
pub const MAX_ROWS_PER_BATCH: usize = 250_000;

pub(crate) const OBJECT_COLUMNS: &[&str] = &[
    "project_id",
    "bucket_name",
    "object_key",
    "version",
    "stream_id",
    "created_at",
    "expires_at",
    "status",
    "segment_count",
    "encrypted_metadata_nonce",
    "encrypted_metadata",
    "encrypted_metadata_encrypted_key",
    "encrypted_etag",
    "total_plain_size",
    "total_encrypted_size",
    "fixed_segment_size",
    "encryption",
    "zombie_deletion_deadline",
];

pub(crate) const SEGMENT_COLUMNS: &[&str] = &[
    "stream_id",
    "position",
    "created_at",
    "repaired_at",
    "expires_at",
    "root_piece_id",
    "encrypted_key_nonce",
    "encrypted_key",
    "encrypted_etag",
    "encrypted_size",
    "plain_size",
    "plain_offset",
    "redundancy",
    "inline_data",
    "remote_alias_pieces",
    "placement",
];

pub(crate) const COPY_COLUMNS: &[&str] = &["stream_id", "ancestor_stream_id"];

/// Contract shared by every metadata backend.
///
/// Reads take a [`Consistency`] so callers can trade recency for latency.
/// Errors are returned tagged with [`Adapter::name`] and the operation; an
/// adapter never retries.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Adapter identity used in errors and logs.
    fn name(&self) -> &'static str;

    /// Creates the metabase tables if they do not exist.
    async fn migrate(&self, cancel: &CancellationToken) -> MetabaseResult<()>;

    /// Tallies the buckets in `[opts.from, opts.to]` held by this adapter.
    async fn collect_bucket_tallies(
        &self,
        cancel: &CancellationToken,
        opts: &CollectBucketTallies,
    ) -> MetabaseResult<Vec<BucketTally>>;

    async fn testing_get_all_objects(
        &self,
        cancel: &CancellationToken,
        consistency: Consistency,
    ) -> MetabaseResult<Vec<RawObject>>;

    async fn testing_get_all_segments(
        &self,
        cancel: &CancellationToken,
        consistency: Consistency,
        aliases: &NodeAliasCache,
    ) -> MetabaseResult<Vec<RawSegment>>;

    async fn testing_get_all_copies(
        &self,
        cancel: &CancellationToken,
        consistency: Consistency,
    ) -> MetabaseResult<Vec<RawCopy>>;

    /// Removes every object, segment, copy and node alias.
    async fn testing_delete_all(&self, cancel: &CancellationToken) -> MetabaseResult<()>;

    /// Inserts rows as given, without any validation.
    async fn testing_batch_insert_objects(
        &self,
        cancel: &CancellationToken,
        objects: &[RawObject],
    ) -> MetabaseResult<()>;

    async fn testing_batch_insert_segments(
        &self,
        cancel: &CancellationToken,
        aliases: &NodeAliasCache,
        segments: &[RawSegment],
    ) -> MetabaseResult<()>;

    async fn testing_batch_insert_copies(
        &self,
        cancel: &CancellationToken,
        copies: &[RawCopy],
    ) -> MetabaseResult<()>;

    /// Allocates aliases for the nodes that have none. Existing aliases are kept.
    async fn ensure_node_aliases(
        &self,
        cancel: &CancellationToken,
        nodes: &[NodeId],
    ) -> MetabaseResult<()>;

    async fn list_node_aliases(
        &self,
        cancel: &CancellationToken,
    ) -> MetabaseResult<Vec<NodeAliasEntry>>;
}

/// Runs `operation` unless `cancel` fires first. A token that is already
/// cancelled never reaches the backend; an in-flight call is dropped.
pub(crate) async fn cancelable<T>(
    cancel: &CancellationToken,
    adapter: &'static str,
    operation: &'static str,
    work: impl Future<Output = MetabaseResult<T>>,
) -> MetabaseResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MetabaseError::Canceled { adapter, operation }),
        result = work => result,
    }
}

/// Connection settings shared by the adapters built from URLs.
#[derive(Clone, Debug)]
pub struct AdapterOptions {
    pub max_connections: u32,
    pub partition_workers: usize,
    pub batch_size: usize,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            partition_workers: distributed::DEFAULT_PARTITION_WORKERS,
            batch_size: MAX_ROWS_PER_BATCH,
        }
    }
}

/// Creates an adapter for `url`, picking the backend from its scheme.
///
/// `sqlite:` URLs open the relational backend; `emulator://` URLs start an
/// in-process distributed engine with its schema already in place.
pub async fn open_adapter(url: &str, options: &AdapterOptions) -> MetabaseResult<Arc<dyn Adapter>> {
    if url.starts_with("sqlite:") {
        let adapter = RelationalAdapter::connect(url, options.max_connections)
            .await?
            .with_batch_size(options.batch_size);
        Ok(Arc::new(adapter))
    } else if url.starts_with("emulator://") {
        let session = distributed::Emulator::from_url(url)
            .map_err(|e| MetabaseError::Config(e.to_string()))?;
        let adapter = DistributedAdapter::new(Arc::new(session))
            .with_partition_workers(options.partition_workers)
            .with_batch_size(options.batch_size);
        adapter.migrate(&CancellationToken::new()).await?;
        Ok(Arc::new(adapter))
    } else {
        Err(MetabaseError::Config(format!("unsupported database url scheme: {url}")))
    }
}
