//! Distributed backend: the metabase tables in a globally distributed,
//! strongly consistent engine reached through a [`DistributedSession`].
//!
//! Tallies are computed either by one grouped query evaluated by the engine,
//! or by a partitioned row scan reduced on the client. The partitioned scan
//! exists for ranges too large for a single grouped query; both strategies
//! return the same totals when read at the same snapshot.

mod emulator;
mod session;

pub use emulator::{Emulator, EmulatorStats};
pub use session::{
    ColumnSchema, ColumnType, DistributedSession, Expr, KeyRange, Mutation, Partition, Predicate,
    Query, Row, RowStream, SessionError, SessionResult, TableSchema, TimestampBound, Value, Write,
};

use super::{
    Adapter, COPY_COLUMNS, MAX_ROWS_PER_BATCH, OBJECT_COLUMNS, SEGMENT_COLUMNS, cancelable,
};
use crate::errors::{MetabaseError, MetabaseResult};
use crate::models::{
    AliasPieces, BucketLocation, BucketTally, CollectBucketTallies, Consistency,
    EncryptionParameters, NodeAlias, NodeAliasEntry, NodeId, ObjectKey, ObjectStatus,
    ObjectStream, PieceId, RawCopy, RawObject, RawSegment, RedundancyScheme, SegmentPosition,
    stored_timestamp,
};
use crate::services::NodeAliasCache;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

const NAME: &str = "distributed";

/// Partitions scanned concurrently by one partitioned tally.
pub const DEFAULT_PARTITION_WORKERS: usize = 4;

const TALLY_GROUP: &[&str] = &["project_id", "bucket_name"];

/// Schema of the metabase tables in the distributed engine.
pub fn table_schemas() -> Vec<TableSchema> {
    use ColumnSchema as C;
    use ColumnType as T;

    vec![
        TableSchema {
            name: "objects",
            columns: vec![
                C::required("project_id", T::Bytes),
                C::required("bucket_name", T::String),
                C::required("object_key", T::Bytes),
                C::required("version", T::Int64),
                C::required("stream_id", T::Bytes),
                C::required("created_at", T::Timestamp),
                C::nullable("expires_at", T::Timestamp),
                C::required("status", T::Int64),
                C::required("segment_count", T::Int64),
                C::nullable("encrypted_metadata_nonce", T::Bytes),
                C::nullable("encrypted_metadata", T::Bytes),
                C::nullable("encrypted_metadata_encrypted_key", T::Bytes),
                C::nullable("encrypted_etag", T::Bytes),
                C::required("total_plain_size", T::Int64),
                C::required("total_encrypted_size", T::Int64),
                C::required("fixed_segment_size", T::Int64),
                C::required("encryption", T::Int64),
                C::nullable("zombie_deletion_deadline", T::Timestamp),
            ],
            primary_key: vec!["project_id", "bucket_name", "object_key", "version"],
        },
        TableSchema {
            name: "segments",
            columns: vec![
                C::required("stream_id", T::Bytes),
                C::required("position", T::Int64),
                C::required("created_at", T::Timestamp),
                C::nullable("repaired_at", T::Timestamp),
                C::nullable("expires_at", T::Timestamp),
                C::required("root_piece_id", T::Bytes),
                C::required("encrypted_key_nonce", T::Bytes),
                C::required("encrypted_key", T::Bytes),
                C::nullable("encrypted_etag", T::Bytes),
                C::required("encrypted_size", T::Int64),
                C::required("plain_size", T::Int64),
                C::required("plain_offset", T::Int64),
                C::required("redundancy", T::Int64),
                C::nullable("inline_data", T::Bytes),
                C::nullable("remote_alias_pieces", T::Bytes),
                C::required("placement", T::Int64),
            ],
            primary_key: vec!["stream_id", "position"],
        },
        TableSchema {
            name: "segment_copies",
            columns: vec![
                C::required("stream_id", T::Bytes),
                C::required("ancestor_stream_id", T::Bytes),
            ],
            primary_key: vec!["stream_id"],
        },
        TableSchema {
            name: "node_aliases",
            columns: vec![
                C::required("node_id", T::Bytes),
                C::from_sequence("node_alias", "node_alias_seq"),
            ],
            primary_key: vec!["node_id"],
        },
    ]
}

pub struct DistributedAdapter {
    session: Arc<dyn DistributedSession>,
    batch_size: usize,
    partition_workers: usize,
}

impl DistributedAdapter {
    pub fn new(session: Arc<dyn DistributedSession>) -> Self {
        Self {
            session,
            batch_size: MAX_ROWS_PER_BATCH,
            partition_workers: DEFAULT_PARTITION_WORKERS,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_partition_workers(mut self, workers: usize) -> Self {
        self.partition_workers = workers.max(1);
        self
    }

    pub fn session(&self) -> &Arc<dyn DistributedSession> {
        &self.session
    }
}

fn backend(operation: &'static str) -> impl Fn(SessionError) -> MetabaseError {
    move |err| MetabaseError::backend(NAME, operation, err)
}

fn integrity(err: SessionError) -> MetabaseError {
    MetabaseError::data_integrity(format!("{NAME}: {err}"))
}

/// Bound for single-use reads. Bounded staleness lets the engine pick any
/// sufficiently recent timestamp.
fn read_bound(consistency: Consistency) -> TimestampBound {
    match consistency {
        Consistency::Strong => TimestampBound::Strong,
        Consistency::Snapshot(at) => TimestampBound::ReadTimestamp(at),
        Consistency::BoundedStaleness(d) => TimestampBound::MaxStaleness(d),
    }
}

/// Bound for partitioned reads, which must be pinned to one exact timestamp.
fn partition_bound(consistency: Consistency) -> TimestampBound {
    match consistency {
        Consistency::Strong => TimestampBound::Strong,
        Consistency::Snapshot(at) => TimestampBound::ReadTimestamp(at),
        Consistency::BoundedStaleness(d) => TimestampBound::ExactStaleness(d),
    }
}

fn location_range(opts: &CollectBucketTallies) -> KeyRange {
    KeyRange {
        start: vec![
            Value::bytes(opts.from.project_id.as_bytes()),
            Value::String(opts.from.bucket_name.clone()),
        ],
        end: vec![
            Value::bytes(opts.to.project_id.as_bytes()),
            Value::String(opts.to.bucket_name.clone()),
        ],
    }
}

fn uuid(row: &Row, index: usize) -> MetabaseResult<Uuid> {
    let bytes = row.bytes(index).map_err(integrity)?;
    Uuid::from_slice(&bytes)
        .map_err(|e| MetabaseError::data_integrity(format!("{NAME}: column {index}: {e}")))
}

/// Reads an INT64 column into the narrower integer the model uses.
fn narrow<T: TryFrom<i64>>(row: &Row, index: usize) -> MetabaseResult<T> {
    let value = row.int64(index).map_err(integrity)?;
    T::try_from(value).map_err(|_| {
        MetabaseError::data_integrity(format!("{NAME}: column {index}: {value} out of range"))
    })
}

fn location(row: &Row) -> MetabaseResult<BucketLocation> {
    Ok(BucketLocation {
        project_id: uuid(row, 0)?,
        bucket_name: row.string(1).map_err(integrity)?,
    })
}

fn decode_grouped_tally(row: &Row) -> MetabaseResult<BucketTally> {
    let int = |i| row.int64(i).map_err(integrity);
    Ok(BucketTally {
        location: location(row)?,
        total_bytes: int(2)?,
        total_segments: int(3)?,
        metadata_size: int(4)?,
        object_count: int(5)?,
        pending_object_count: int(6)?,
    })
}

/// Folds one scanned object row into the per-bucket accumulator.
fn accumulate(acc: &mut HashMap<BucketLocation, BucketTally>, row: &Row) -> MetabaseResult<()> {
    let int = |i| row.int64(i).map_err(integrity);
    let location = location(row)?;
    let object = BucketTally {
        total_bytes: int(2)?,
        total_segments: int(3)?,
        metadata_size: int(4)?,
        object_count: 1,
        pending_object_count: i64::from(int(5)? == ObjectStatus::PENDING_CODE),
        location: location.clone(),
    };
    acc.entry(location)
        .or_insert_with_key(|location| BucketTally::new(location.clone()))
        .add(&object)
}

fn merge(
    mut total: HashMap<BucketLocation, BucketTally>,
    partial: HashMap<BucketLocation, BucketTally>,
) -> MetabaseResult<HashMap<BucketLocation, BucketTally>> {
    for (location, tally) in partial {
        match total.get_mut(&location) {
            Some(existing) => existing.add(&tally)?,
            None => {
                total.insert(location, tally);
            }
        }
    }
    Ok(total)
}

fn object_values(obj: &RawObject) -> Vec<Value> {
    vec![
        Value::bytes(obj.stream.project_id.as_bytes()),
        // sent as text: BYTES written into the STRING column would be stored base64 encoded
        Value::String(obj.stream.bucket_name.clone()),
        Value::bytes(&obj.stream.object_key),
        Value::Int64(obj.stream.version),
        Value::bytes(obj.stream.stream_id.as_bytes()),
        Value::Timestamp(stored_timestamp(obj.created_at)),
        Value::nullable_timestamp(obj.expires_at.map(stored_timestamp)),
        Value::Int64(obj.status.code()),
        Value::Int64(i64::from(obj.segment_count)),
        Value::nullable_bytes(obj.encrypted_metadata_nonce.as_ref()),
        Value::nullable_bytes(obj.encrypted_metadata.as_ref()),
        Value::nullable_bytes(obj.encrypted_metadata_encrypted_key.as_ref()),
        Value::nullable_bytes(obj.encrypted_etag.as_ref()),
        Value::Int64(obj.total_plain_size),
        Value::Int64(obj.total_encrypted_size),
        Value::Int64(i64::from(obj.fixed_segment_size)),
        Value::Int64(obj.encryption.pack()),
        Value::nullable_timestamp(obj.zombie_deletion_deadline.map(stored_timestamp)),
    ]
}

fn decode_object(row: &Row) -> MetabaseResult<RawObject> {
    let int = |i| row.int64(i).map_err(integrity);
    let blob = |i| row.nullable_bytes(i).map_err(integrity);
    let time = |i| row.nullable_timestamp(i).map_err(integrity);
    Ok(RawObject {
        stream: ObjectStream {
            project_id: uuid(row, 0)?,
            bucket_name: row.string(1).map_err(integrity)?,
            object_key: ObjectKey(row.bytes(2).map_err(integrity)?),
            version: int(3)?,
            stream_id: uuid(row, 4)?,
        },
        created_at: row.timestamp(5).map_err(integrity)?,
        expires_at: time(6)?,
        status: ObjectStatus::from_code(int(7)?)?,
        segment_count: narrow(row, 8)?,
        encrypted_metadata_nonce: blob(9)?,
        encrypted_metadata: blob(10)?,
        encrypted_metadata_encrypted_key: blob(11)?,
        encrypted_etag: blob(12)?,
        total_plain_size: int(13)?,
        total_encrypted_size: int(14)?,
        fixed_segment_size: narrow(row, 15)?,
        encryption: EncryptionParameters::unpack(int(16)?)?,
        zombie_deletion_deadline: time(17)?,
    })
}

fn segment_values(seg: &RawSegment, alias_pieces: &AliasPieces) -> MetabaseResult<Vec<Value>> {
    Ok(vec![
        Value::bytes(seg.stream_id.as_bytes()),
        Value::Int64(seg.position.encode() as i64),
        Value::Timestamp(stored_timestamp(seg.created_at)),
        Value::nullable_timestamp(seg.repaired_at.map(stored_timestamp)),
        Value::nullable_timestamp(seg.expires_at.map(stored_timestamp)),
        Value::bytes(seg.root_piece_id.0),
        Value::bytes(&seg.encrypted_key_nonce),
        Value::bytes(&seg.encrypted_key),
        Value::nullable_bytes(seg.encrypted_etag.as_ref()),
        Value::Int64(i64::from(seg.encrypted_size)),
        Value::Int64(i64::from(seg.plain_size)),
        Value::Int64(seg.plain_offset),
        Value::Int64(seg.redundancy.pack()?),
        Value::nullable_bytes(seg.inline_data.as_ref()),
        if alias_pieces.is_empty() {
            Value::Null
        } else {
            Value::Bytes(alias_pieces.to_bytes())
        },
        Value::Int64(i64::from(seg.placement)),
    ])
}

fn decode_segment(row: &Row) -> MetabaseResult<(RawSegment, AliasPieces)> {
    let int = |i| row.int64(i).map_err(integrity);
    let blob = |i| row.nullable_bytes(i).map_err(integrity);
    let time = |i| row.nullable_timestamp(i).map_err(integrity);
    let alias_pieces = match blob(14)? {
        Some(bytes) => AliasPieces::from_bytes(&bytes)?,
        None => AliasPieces::default(),
    };
    let segment = RawSegment {
        stream_id: uuid(row, 0)?,
        position: SegmentPosition::decode(int(1)? as u64),
        created_at: row.timestamp(2).map_err(integrity)?,
        repaired_at: time(3)?,
        expires_at: time(4)?,
        root_piece_id: PieceId::from_slice(&row.bytes(5).map_err(integrity)?)?,
        encrypted_key_nonce: row.bytes(6).map_err(integrity)?,
        encrypted_key: row.bytes(7).map_err(integrity)?,
        encrypted_etag: blob(8)?,
        encrypted_size: narrow(row, 9)?,
        plain_size: narrow(row, 10)?,
        plain_offset: int(11)?,
        redundancy: RedundancyScheme::unpack(int(12)?),
        inline_data: blob(13)?,
        pieces: Vec::new(),
        placement: narrow(row, 15)?,
    };
    Ok((segment, alias_pieces))
}

impl DistributedAdapter {
    async fn query_all(
        &self,
        operation: &'static str,
        query: Query,
        bound: TimestampBound,
    ) -> MetabaseResult<Vec<Row>> {
        self.session
            .query(query, bound)
            .await
            .map_err(backend(operation))?
            .map_err(backend(operation))
            .try_collect()
            .await
    }

    /// One grouped query; the engine aggregates and orders by location.
    async fn tally_direct(&self, opts: &CollectBucketTallies) -> MetabaseResult<Vec<BucketTally>> {
        let query = Query::table("objects")
            .select(vec![
                Expr::Column("project_id"),
                Expr::Column("bucket_name"),
                Expr::sum(Expr::Column("total_encrypted_size")),
                Expr::sum(Expr::Column("segment_count")),
                Expr::sum(Expr::Add(vec![
                    Expr::Length("encrypted_metadata"),
                    Expr::Length("encrypted_etag"),
                ])),
                Expr::Count,
                Expr::CountIf("status", Value::Int64(ObjectStatus::PENDING_CODE)),
            ])
            .range(location_range(opts))
            .filter(Predicate::NullOrGreater("expires_at", Value::Timestamp(opts.now())))
            .group_by(TALLY_GROUP);

        let rows = self
            .query_all("collect bucket tallies", query, read_bound(opts.consistency))
            .await?;
        rows.iter().map(decode_grouped_tally).collect()
    }

    /// Row scan split into engine partitions, reduced per partition and merged.
    async fn tally_partitioned(
        &self,
        opts: &CollectBucketTallies,
    ) -> MetabaseResult<Vec<BucketTally>> {
        const OP: &str = "collect bucket tallies (partitioned)";
        let query = Query::table("objects")
            .select(vec![
                Expr::Column("project_id"),
                Expr::Column("bucket_name"),
                Expr::Column("total_encrypted_size"),
                Expr::Column("segment_count"),
                Expr::Add(vec![
                    Expr::Length("encrypted_metadata"),
                    Expr::Length("encrypted_etag"),
                ]),
                Expr::Column("status"),
            ])
            .range(location_range(opts))
            .filter(Predicate::NullOrGreater("expires_at", Value::Timestamp(opts.now())));

        let partitions = self
            .session
            .partition_query(query, partition_bound(opts.consistency))
            .await
            .map_err(backend(OP))?;
        debug!(
            adapter = NAME,
            partitions = partitions.len(),
            workers = self.partition_workers,
            "partitioned tally"
        );

        let totals = futures::stream::iter(partitions)
            .map(|partition| async move {
                self.session
                    .execute_partition(partition)
                    .await
                    .map_err(backend(OP))?
                    .map_err(backend(OP))
                    .try_fold(HashMap::new(), |mut acc, row| async move {
                        accumulate(&mut acc, &row)?;
                        Ok::<_, MetabaseError>(acc)
                    })
                    .await
            })
            .buffer_unordered(self.partition_workers)
            .try_fold(HashMap::new(), |total, partial| async move { merge(total, partial) })
            .await?;

        Ok(totals.into_values().collect())
    }
}

#[async_trait]
impl Adapter for DistributedAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn migrate(&self, cancel: &CancellationToken) -> MetabaseResult<()> {
        cancelable(cancel, NAME, "migrate", async {
            self.session
                .update_ddl(table_schemas())
                .await
                .map_err(backend("migrate"))
        })
        .await
    }

    async fn collect_bucket_tallies(
        &self,
        cancel: &CancellationToken,
        opts: &CollectBucketTallies,
    ) -> MetabaseResult<Vec<BucketTally>> {
        const OP: &str = "collect bucket tallies";
        if opts.use_partition_query {
            cancelable(cancel, NAME, OP, self.tally_partitioned(opts)).await
        } else {
            cancelable(cancel, NAME, OP, self.tally_direct(opts)).await
        }
    }

    async fn testing_get_all_objects(
        &self,
        cancel: &CancellationToken,
        consistency: Consistency,
    ) -> MetabaseResult<Vec<RawObject>> {
        const OP: &str = "get all objects";
        cancelable(cancel, NAME, OP, async {
            let query = Query::table("objects").columns(OBJECT_COLUMNS);
            let rows = self.query_all(OP, query, read_bound(consistency)).await?;
            rows.iter().map(decode_object).collect()
        })
        .await
    }

    async fn testing_get_all_segments(
        &self,
        cancel: &CancellationToken,
        consistency: Consistency,
        aliases: &NodeAliasCache,
    ) -> MetabaseResult<Vec<RawSegment>> {
        const OP: &str = "get all segments";
        let rows = cancelable(cancel, NAME, OP, async {
            let query = Query::table("segments").columns(SEGMENT_COLUMNS);
            self.query_all(OP, query, read_bound(consistency)).await
        })
        .await?;

        let mut segments = Vec::with_capacity(rows.len());
        for row in &rows {
            let (mut segment, alias_pieces) = decode_segment(row)?;
            segment.pieces = aliases
                .convert_aliases_to_pieces(cancel, &alias_pieces)
                .await?;
            segments.push(segment);
        }
        Ok(segments)
    }

    async fn testing_get_all_copies(
        &self,
        cancel: &CancellationToken,
        consistency: Consistency,
    ) -> MetabaseResult<Vec<RawCopy>> {
        const OP: &str = "get all copies";
        cancelable(cancel, NAME, OP, async {
            let query = Query::table("segment_copies").columns(COPY_COLUMNS);
            let rows = self.query_all(OP, query, read_bound(consistency)).await?;
            rows.iter()
                .map(|row| {
                    Ok(RawCopy {
                        stream_id: uuid(row, 0)?,
                        ancestor_stream_id: uuid(row, 1)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn testing_delete_all(&self, cancel: &CancellationToken) -> MetabaseResult<()> {
        cancelable(cancel, NAME, "delete all", async {
            self.session
                .apply(
                    ["objects", "segments", "segment_copies", "node_aliases"]
                        .into_iter()
                        .map(|table| Mutation::DeleteAll { table })
                        .collect(),
                )
                .await
                .map(drop)
                .map_err(backend("delete all"))
        })
        .await
    }

    async fn testing_batch_insert_objects(
        &self,
        cancel: &CancellationToken,
        objects: &[RawObject],
    ) -> MetabaseResult<()> {
        const OP: &str = "batch insert objects";
        let total = objects.len();
        let mut progress = 0;
        for batch in objects.chunks(self.batch_size) {
            let mutations = batch
                .iter()
                .map(|obj| Mutation::insert("objects", OBJECT_COLUMNS, object_values(obj)))
                .collect();
            cancelable(cancel, NAME, OP, async {
                self.session.apply(mutations).await.map_err(backend(OP))
            })
            .await?;

            progress += batch.len();
            info!(adapter = NAME, progress, total, "batch insert");
        }
        Ok(())
    }

    async fn testing_batch_insert_segments(
        &self,
        cancel: &CancellationToken,
        aliases: &NodeAliasCache,
        segments: &[RawSegment],
    ) -> MetabaseResult<()> {
        const OP: &str = "batch insert segments";
        let total = segments.len();
        let mut progress = 0;
        for batch in segments.chunks(self.batch_size) {
            let mut mutations = Vec::with_capacity(batch.len());
            for segment in batch {
                let alias_pieces = aliases
                    .ensure_pieces_to_aliases(cancel, &segment.pieces)
                    .await?;
                mutations.push(Mutation::insert_or_update(
                    "segments",
                    SEGMENT_COLUMNS,
                    segment_values(segment, &alias_pieces)?,
                ));
            }
            cancelable(cancel, NAME, OP, async {
                self.session.apply(mutations).await.map_err(backend(OP))
            })
            .await?;

            progress += batch.len();
            info!(adapter = NAME, progress, total, "batch insert");
        }
        Ok(())
    }

    async fn testing_batch_insert_copies(
        &self,
        cancel: &CancellationToken,
        copies: &[RawCopy],
    ) -> MetabaseResult<()> {
        const OP: &str = "batch insert copies";
        let total = copies.len();
        let mut progress = 0;
        for batch in copies.chunks(self.batch_size) {
            let mutations = batch
                .iter()
                .map(|copy| {
                    Mutation::insert(
                        "segment_copies",
                        COPY_COLUMNS,
                        vec![
                            Value::bytes(copy.stream_id.as_bytes()),
                            Value::bytes(copy.ancestor_stream_id.as_bytes()),
                        ],
                    )
                })
                .collect();
            cancelable(cancel, NAME, OP, async {
                self.session.apply(mutations).await.map_err(backend(OP))
            })
            .await?;

            progress += batch.len();
            info!(adapter = NAME, progress, total, "batch insert");
        }
        Ok(())
    }

    async fn ensure_node_aliases(
        &self,
        cancel: &CancellationToken,
        nodes: &[NodeId],
    ) -> MetabaseResult<()> {
        const OP: &str = "ensure node aliases";
        if nodes.is_empty() {
            return Ok(());
        }
        let mutations = nodes
            .iter()
            .map(|node| {
                Mutation::insert_or_ignore(
                    "node_aliases",
                    &["node_id"],
                    vec![Value::bytes(node.as_bytes())],
                )
            })
            .collect();
        cancelable(cancel, NAME, OP, async {
            self.session
                .apply(mutations)
                .await
                .map(drop)
                .map_err(backend(OP))
        })
        .await
    }

    async fn list_node_aliases(
        &self,
        cancel: &CancellationToken,
    ) -> MetabaseResult<Vec<NodeAliasEntry>> {
        const OP: &str = "list node aliases";
        cancelable(cancel, NAME, OP, async {
            let query = Query::table("node_aliases").columns(&["node_id", "node_alias"]);
            let rows = self.query_all(OP, query, TimestampBound::Strong).await?;
            let mut entries = rows
                .iter()
                .map(|row| {
                    Ok(NodeAliasEntry {
                        id: NodeId::from_slice(&row.bytes(0).map_err(integrity)?)?,
                        alias: NodeAlias(narrow(row, 1)?),
                    })
                })
                .collect::<MetabaseResult<Vec<_>>>()?;
            entries.sort_by_key(|e| e.alias);
            Ok(entries)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    async fn adapter(partitions: usize) -> (Arc<Emulator>, DistributedAdapter) {
        let emulator = Arc::new(Emulator::new(partitions));
        let adapter = DistributedAdapter::new(emulator.clone());
        adapter.migrate(&CancellationToken::new()).await.unwrap();
        (emulator, adapter)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn object(project: u128, bucket: &str, key: &str, size: i64) -> RawObject {
        RawObject {
            stream: ObjectStream {
                project_id: Uuid::from_u128(project),
                bucket_name: bucket.into(),
                object_key: key.into(),
                version: 1,
                stream_id: Uuid::new_v4(),
            },
            created_at: at(1_700_000_000),
            expires_at: None,
            status: ObjectStatus::CommittedUnversioned,
            segment_count: 2,
            encrypted_metadata_nonce: None,
            encrypted_metadata: Some(vec![0; 10]),
            encrypted_metadata_encrypted_key: None,
            encrypted_etag: Some(vec![0; 3]),
            total_plain_size: size,
            total_encrypted_size: size,
            fixed_segment_size: 64,
            encryption: EncryptionParameters::default(),
            zombie_deletion_deadline: None,
        }
    }

    #[tokio::test]
    async fn bucket_names_survive_as_text() {
        let (_, adapter) = adapter(2).await;
        let cancel = CancellationToken::new();
        let obj = object(1, "photos", "a", 5);
        adapter
            .testing_batch_insert_objects(&cancel, std::slice::from_ref(&obj))
            .await
            .unwrap();

        let objects = adapter
            .testing_get_all_objects(&cancel, Consistency::Strong)
            .await
            .unwrap();
        assert_eq!(objects, vec![obj]);
    }

    #[tokio::test]
    async fn strategies_agree() {
        let (_, adapter) = adapter(3).await;
        let cancel = CancellationToken::new();
        let objects: Vec<_> = (0..20)
            .map(|i| object(1 + i % 3, ["a", "b"][(i % 2) as usize], &format!("k{i}"), i as i64))
            .collect();
        adapter
            .testing_batch_insert_objects(&cancel, &objects)
            .await
            .unwrap();

        let mut opts = CollectBucketTallies::new(BucketLocation::min(), BucketLocation::max());
        opts.now = Some(at(1_800_000_000));
        let direct = adapter
            .collect_bucket_tallies(&cancel, &opts)
            .await
            .unwrap();

        opts.use_partition_query = true;
        let mut partitioned = adapter
            .collect_bucket_tallies(&cancel, &opts)
            .await
            .unwrap();
        partitioned.sort_by(|a, b| a.location.cmp(&b.location));

        assert_eq!(direct.len(), 6);
        assert_eq!(direct, partitioned);
        assert_eq!(direct[0].metadata_size, 13 * direct[0].object_count);
    }

    #[tokio::test]
    async fn overflowing_sums_are_errors() {
        let (_, adapter) = adapter(1).await;
        let cancel = CancellationToken::new();
        let objects = [object(1, "b", "a", i64::MAX), object(1, "b", "b", 1)];
        adapter
            .testing_batch_insert_objects(&cancel, &objects)
            .await
            .unwrap();

        let mut opts = CollectBucketTallies::new(BucketLocation::min(), BucketLocation::max());
        let err = adapter
            .collect_bucket_tallies(&cancel, &opts)
            .await
            .unwrap_err();
        assert!(
            matches!(err, MetabaseError::Backend { .. }) && err.to_string().contains("overflow"),
            "{err}"
        );

        opts.use_partition_query = true;
        let err = adapter
            .collect_bucket_tallies(&cancel, &opts)
            .await
            .unwrap_err();
        assert!(err.is_data_integrity(), "{err}");
    }

    #[tokio::test]
    async fn aliases_come_from_the_sequence() {
        let (_, adapter) = adapter(1).await;
        let cancel = CancellationToken::new();
        let nodes = [NodeId([3; 32]), NodeId([1; 32])];
        adapter.ensure_node_aliases(&cancel, &nodes).await.unwrap();
        adapter
            .ensure_node_aliases(&cancel, &nodes[..1])
            .await
            .unwrap();

        let entries = adapter.list_node_aliases(&cancel).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, nodes[0]);
        assert_eq!(entries[0].alias, NodeAlias(1));
        assert_eq!(entries[1].alias, NodeAlias(2));
    }

    #[tokio::test]
    async fn batches_are_one_apply_each() {
        let (emulator, adapter) = adapter(1).await;
        let adapter = adapter.with_batch_size(4);
        let objects: Vec<_> = (0..10).map(|i| object(1, "b", &format!("{i}"), 1)).collect();
        adapter
            .testing_batch_insert_objects(&CancellationToken::new(), &objects)
            .await
            .unwrap();
        assert_eq!(emulator.stats().applies, 3);
    }
}
