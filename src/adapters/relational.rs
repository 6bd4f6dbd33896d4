//! Relational backend: the metabase tables in a SQL database reached through `sqlx`.
//!
//! Encoding rules kept inside this module:
//! - UUIDs, node ids and bucket names are stored as BLOBs, so tuple
//!   comparisons order rows exactly like [`BucketLocation`].
//! - Timestamps are INTEGER unix microseconds.
//! - Encryption parameters, redundancy and segment position are packed integers.

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
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

const NAME: &str = "relational";

/// SQLite caps bound parameters per statement, so a batch is written as
/// several multi-row statements inside one transaction.
const ROWS_PER_STATEMENT: usize = 1000;

const MIGRATION: &str = include_str!("../../migrations/0001_init.sql");

pub struct RelationalAdapter {
    pool: SqlitePool,
    batch_size: usize,
}

impl RelationalAdapter {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            batch_size: MAX_ROWS_PER_BATCH,
        }
    }

    /// Opens a pool for `url`, creating the database file and its directory if needed.
    ///
    /// In-memory databases are private to a connection, so they always get a
    /// single-connection pool.
    pub async fn connect(url: &str, max_connections: u32) -> MetabaseResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| MetabaseError::Config(format!("database url `{url}`: {e}")))?
            .create_if_missing(true);

        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        if !in_memory {
            if let Some(parent) = options.get_filename().parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        MetabaseError::Config(format!("creating {}: {e}", parent.display()))
                    })?;
                    info!("Created missing directory {:?}", parent);
                }
            }
        }

        let mut pool_options = SqlitePoolOptions::new().max_connections(max_connections);
        if in_memory {
            // closing the only connection would drop the database
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| MetabaseError::backend(NAME, "connect", e))?;
        Ok(Self::new(pool))
    }

    /// Overrides the number of rows written per transaction by the batch inserts.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn backend(operation: &'static str) -> impl Fn(sqlx::Error) -> MetabaseError {
    move |err| MetabaseError::backend(NAME, operation, err)
}

fn column<'r, T>(row: &'r SqliteRow, index: usize) -> MetabaseResult<T>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(index)
        .map_err(|e| MetabaseError::data_integrity(format!("{NAME}: column {index}: {e}")))
}

fn uuid_column(row: &SqliteRow, index: usize) -> MetabaseResult<Uuid> {
    let bytes: Vec<u8> = column(row, index)?;
    Uuid::from_slice(&bytes)
        .map_err(|e| MetabaseError::data_integrity(format!("{NAME}: column {index}: {e}")))
}

fn text_column(row: &SqliteRow, index: usize) -> MetabaseResult<String> {
    let bytes: Vec<u8> = column(row, index)?;
    String::from_utf8(bytes)
        .map_err(|e| MetabaseError::data_integrity(format!("{NAME}: column {index}: {e}")))
}

fn time_column(row: &SqliteRow, index: usize) -> MetabaseResult<DateTime<Utc>> {
    from_micros(column(row, index)?)
}

fn optional_time_column(row: &SqliteRow, index: usize) -> MetabaseResult<Option<DateTime<Utc>>> {
    column::<Option<i64>>(row, index)?
        .map(from_micros)
        .transpose()
}

fn int32_column(row: &SqliteRow, index: usize) -> MetabaseResult<i32> {
    let value: i64 = column(row, index)?;
    i32::try_from(value).map_err(|_| {
        MetabaseError::data_integrity(format!("{NAME}: column {index}: {value} overflows i32"))
    })
}

fn from_micros(micros: i64) -> MetabaseResult<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| MetabaseError::data_integrity(format!("timestamp {micros} out of range")))
}

fn micros(at: DateTime<Utc>) -> i64 {
    stored_timestamp(at).timestamp_micros()
}

fn note_consistency(operation: &str, consistency: Consistency) {
    if consistency != Consistency::Strong {
        debug!(
            adapter = NAME,
            operation,
            ?consistency,
            "relational reads always observe the latest committed state"
        );
    }
}

fn decode_object(row: &SqliteRow) -> MetabaseResult<RawObject> {
    Ok(RawObject {
        stream: ObjectStream {
            project_id: uuid_column(row, 0)?,
            bucket_name: text_column(row, 1)?,
            object_key: ObjectKey(column(row, 2)?),
            version: column(row, 3)?,
            stream_id: uuid_column(row, 4)?,
        },
        created_at: time_column(row, 5)?,
        expires_at: optional_time_column(row, 6)?,
        status: ObjectStatus::from_code(column(row, 7)?)?,
        segment_count: int32_column(row, 8)?,
        encrypted_metadata_nonce: column(row, 9)?,
        encrypted_metadata: column(row, 10)?,
        encrypted_metadata_encrypted_key: column(row, 11)?,
        encrypted_etag: column(row, 12)?,
        total_plain_size: column(row, 13)?,
        total_encrypted_size: column(row, 14)?,
        fixed_segment_size: int32_column(row, 15)?,
        encryption: EncryptionParameters::unpack(column(row, 16)?)?,
        zombie_deletion_deadline: optional_time_column(row, 17)?,
    })
}

fn decode_segment(row: &SqliteRow) -> MetabaseResult<(RawSegment, AliasPieces)> {
    let alias_pieces = match column::<Option<Vec<u8>>>(row, 14)? {
        Some(bytes) => AliasPieces::from_bytes(&bytes)?,
        None => AliasPieces::default(),
    };
    let placement: i64 = column(row, 15)?;
    let segment = RawSegment {
        stream_id: uuid_column(row, 0)?,
        position: SegmentPosition::decode(column::<i64>(row, 1)? as u64),
        created_at: time_column(row, 2)?,
        repaired_at: optional_time_column(row, 3)?,
        expires_at: optional_time_column(row, 4)?,
        root_piece_id: PieceId::from_slice(&column::<Vec<u8>>(row, 5)?)?,
        encrypted_key_nonce: column(row, 6)?,
        encrypted_key: column(row, 7)?,
        encrypted_etag: column(row, 8)?,
        encrypted_size: int32_column(row, 9)?,
        plain_size: int32_column(row, 10)?,
        plain_offset: column(row, 11)?,
        redundancy: RedundancyScheme::unpack(column(row, 12)?),
        inline_data: column(row, 13)?,
        pieces: Vec::new(),
        placement: u16::try_from(placement).map_err(|_| {
            MetabaseError::data_integrity(format!("{NAME}: placement {placement} out of range"))
        })?,
    };
    Ok((segment, alias_pieces))
}

impl RelationalAdapter {
    async fn insert_segment_batch(
        &self,
        batch: &[RawSegment],
        aliases: &[AliasPieces],
        redundancy: &[i64],
    ) -> MetabaseResult<()> {
        const OP: &str = "batch insert segments";
        let mut tx = self.pool.begin().await.map_err(backend(OP))?;
        let mut offset = 0;
        for rows in batch.chunks(ROWS_PER_STATEMENT) {
            let mut builder = QueryBuilder::<Sqlite>::new(format!(
                "INSERT INTO segments ({}) ",
                SEGMENT_COLUMNS.join(", ")
            ));
            builder.push_values(rows.iter().enumerate(), |mut b, (i, seg)| {
                let alias_pieces = &aliases[offset + i];
                b.push_bind(seg.stream_id.as_bytes().to_vec())
                    .push_bind(seg.position.encode() as i64)
                    .push_bind(micros(seg.created_at))
                    .push_bind(seg.repaired_at.map(micros))
                    .push_bind(seg.expires_at.map(micros))
                    .push_bind(seg.root_piece_id.0.to_vec())
                    .push_bind(seg.encrypted_key_nonce.clone())
                    .push_bind(seg.encrypted_key.clone())
                    .push_bind(seg.encrypted_etag.clone())
                    .push_bind(i64::from(seg.encrypted_size))
                    .push_bind(i64::from(seg.plain_size))
                    .push_bind(seg.plain_offset)
                    .push_bind(redundancy[offset + i])
                    .push_bind(seg.inline_data.clone())
                    .push_bind((!alias_pieces.is_empty()).then(|| alias_pieces.to_bytes()))
                    .push_bind(i64::from(seg.placement));
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(backend(OP))?;
            offset += rows.len();
        }
        tx.commit().await.map_err(backend(OP))
    }
}

#[async_trait]
impl Adapter for RelationalAdapter {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn migrate(&self, cancel: &CancellationToken) -> MetabaseResult<()> {
        cancelable(cancel, NAME, "migrate", async {
            let statements = MIGRATION
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>();

            info!("Running {} migration statements...", statements.len());
            for stmt in statements {
                debug!("Executing migration SQL: {}", stmt);
                sqlx::query(stmt)
                    .execute(&self.pool)
                    .await
                    .map_err(backend("migrate"))?;
            }
            Ok(())
        })
        .await
    }

    async fn collect_bucket_tallies(
        &self,
        cancel: &CancellationToken,
        opts: &CollectBucketTallies,
    ) -> MetabaseResult<Vec<BucketTally>> {
        const OP: &str = "collect bucket tallies";
        note_consistency(OP, opts.consistency);

        let sql = format!(
            "SELECT
                project_id, bucket_name,
                SUM(total_encrypted_size), SUM(segment_count),
                COALESCE(SUM(length(encrypted_metadata)), 0)
                    + COALESCE(SUM(length(encrypted_etag)), 0),
                count(*), count(*) FILTER (WHERE status = {pending})
            FROM objects
            WHERE (project_id, bucket_name) >= (?1, ?2)
                AND (project_id, bucket_name) <= (?3, ?4)
                AND (expires_at IS NULL OR expires_at > ?5)
            GROUP BY project_id, bucket_name
            ORDER BY project_id ASC, bucket_name ASC",
            pending = ObjectStatus::PENDING_CODE,
        );

        cancelable(cancel, NAME, OP, async {
            let rows = sqlx::query(&sql)
                .bind(opts.from.project_id.as_bytes().to_vec())
                .bind(opts.from.bucket_name.as_bytes().to_vec())
                .bind(opts.to.project_id.as_bytes().to_vec())
                .bind(opts.to.bucket_name.as_bytes().to_vec())
                .bind(micros(opts.now()))
                .fetch_all(&self.pool)
                .await
                .map_err(backend(OP))?;

            rows.iter()
                .map(|row| {
                    Ok(BucketTally {
                        location: BucketLocation {
                            project_id: uuid_column(row, 0)?,
                            bucket_name: text_column(row, 1)?,
                        },
                        total_bytes: column(row, 2)?,
                        total_segments: column(row, 3)?,
                        metadata_size: column(row, 4)?,
                        object_count: column(row, 5)?,
                        pending_object_count: column(row, 6)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn testing_get_all_objects(
        &self,
        cancel: &CancellationToken,
        consistency: Consistency,
    ) -> MetabaseResult<Vec<RawObject>> {
        const OP: &str = "get all objects";
        note_consistency(OP, consistency);
        let sql = format!(
            "SELECT {} FROM objects \
             ORDER BY project_id ASC, bucket_name ASC, object_key ASC, version ASC",
            OBJECT_COLUMNS.join(", ")
        );

        cancelable(cancel, NAME, OP, async {
            let rows = sqlx::query(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(backend(OP))?;
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
        note_consistency(OP, consistency);
        let sql = format!(
            "SELECT {} FROM segments ORDER BY stream_id ASC, position ASC",
            SEGMENT_COLUMNS.join(", ")
        );

        // rows are fully fetched before alias resolution, which may need a connection itself
        let rows = cancelable(cancel, NAME, OP, async {
            sqlx::query(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(backend(OP))
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
        note_consistency(OP, consistency);

        cancelable(cancel, NAME, OP, async {
            let rows = sqlx::query(
                "SELECT stream_id, ancestor_stream_id FROM segment_copies ORDER BY stream_id ASC",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(backend(OP))?;
            rows.iter()
                .map(|row| {
                    Ok(RawCopy {
                        stream_id: uuid_column(row, 0)?,
                        ancestor_stream_id: uuid_column(row, 1)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn testing_delete_all(&self, cancel: &CancellationToken) -> MetabaseResult<()> {
        const OP: &str = "delete all";
        cancelable(cancel, NAME, OP, async {
            let mut tx = self.pool.begin().await.map_err(backend(OP))?;
            for stmt in [
                "DELETE FROM objects",
                "DELETE FROM segments",
                "DELETE FROM segment_copies",
                "DELETE FROM node_aliases",
                "DELETE FROM sqlite_sequence WHERE name = 'node_aliases'",
            ] {
                sqlx::query(stmt)
                    .execute(&mut *tx)
                    .await
                    .map_err(backend(OP))?;
            }
            tx.commit().await.map_err(backend(OP))
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
            cancelable(cancel, NAME, OP, async {
                let mut tx = self.pool.begin().await.map_err(backend(OP))?;
                for rows in batch.chunks(ROWS_PER_STATEMENT) {
                    let mut builder = QueryBuilder::<Sqlite>::new(format!(
                        "INSERT INTO objects ({}) ",
                        OBJECT_COLUMNS.join(", ")
                    ));
                    builder.push_values(rows, |mut b, obj| {
                        b.push_bind(obj.stream.project_id.as_bytes().to_vec())
                            .push_bind(obj.stream.bucket_name.as_bytes().to_vec())
                            .push_bind(obj.stream.object_key.0.clone())
                            .push_bind(obj.stream.version)
                            .push_bind(obj.stream.stream_id.as_bytes().to_vec())
                            .push_bind(micros(obj.created_at))
                            .push_bind(obj.expires_at.map(micros))
                            .push_bind(obj.status.code())
                            .push_bind(i64::from(obj.segment_count))
                            .push_bind(obj.encrypted_metadata_nonce.clone())
                            .push_bind(obj.encrypted_metadata.clone())
                            .push_bind(obj.encrypted_metadata_encrypted_key.clone())
                            .push_bind(obj.encrypted_etag.clone())
                            .push_bind(obj.total_plain_size)
                            .push_bind(obj.total_encrypted_size)
                            .push_bind(i64::from(obj.fixed_segment_size))
                            .push_bind(obj.encryption.pack())
                            .push_bind(obj.zombie_deletion_deadline.map(micros));
                    });
                    builder
                        .build()
                        .execute(&mut *tx)
                        .await
                        .map_err(backend(OP))?;
                }
                tx.commit().await.map_err(backend(OP))
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
            // aliases are allocated outside the transaction; the pool may have a single connection
            let mut alias_pieces = Vec::with_capacity(batch.len());
            let mut redundancy = Vec::with_capacity(batch.len());
            for segment in batch {
                alias_pieces.push(
                    aliases
                        .ensure_pieces_to_aliases(cancel, &segment.pieces)
                        .await?,
                );
                redundancy.push(segment.redundancy.pack()?);
            }

            cancelable(
                cancel,
                NAME,
                OP,
                self.insert_segment_batch(batch, &alias_pieces, &redundancy),
            )
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
            cancelable(cancel, NAME, OP, async {
                let mut tx = self.pool.begin().await.map_err(backend(OP))?;
                for rows in batch.chunks(ROWS_PER_STATEMENT) {
                    let mut builder = QueryBuilder::<Sqlite>::new(format!(
                        "INSERT INTO segment_copies ({}) ",
                        COPY_COLUMNS.join(", ")
                    ));
                    builder.push_values(rows, |mut b, copy| {
                        b.push_bind(copy.stream_id.as_bytes().to_vec())
                            .push_bind(copy.ancestor_stream_id.as_bytes().to_vec());
                    });
                    builder
                        .build()
                        .execute(&mut *tx)
                        .await
                        .map_err(backend(OP))?;
                }
                tx.commit().await.map_err(backend(OP))
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
        cancelable(cancel, NAME, OP, async {
            let mut tx = self.pool.begin().await.map_err(backend(OP))?;
            for chunk in nodes.chunks(ROWS_PER_STATEMENT) {
                let mut builder =
                    QueryBuilder::<Sqlite>::new("INSERT INTO node_aliases (node_id) ");
                builder.push_values(chunk, |mut b, node| {
                    b.push_bind(node.as_bytes().to_vec());
                });
                builder.push(" ON CONFLICT (node_id) DO NOTHING");
                builder
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(backend(OP))?;
            }
            tx.commit().await.map_err(backend(OP))
        })
        .await
    }

    async fn list_node_aliases(
        &self,
        cancel: &CancellationToken,
    ) -> MetabaseResult<Vec<NodeAliasEntry>> {
        const OP: &str = "list node aliases";
        cancelable(cancel, NAME, OP, async {
            let sql = "SELECT node_id, node_alias FROM node_aliases ORDER BY node_alias";
            let rows = sqlx::query(sql)
                .fetch_all(&self.pool)
                .await
                .map_err(backend(OP))?;
            rows.iter()
                .map(|row| {
                    Ok(NodeAliasEntry {
                        id: NodeId::from_slice(&column::<Vec<u8>>(row, 0)?)?,
                        alias: NodeAlias(int32_column(row, 1)?),
                    })
                })
                .collect()
        })
        .await
    }
}
