#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use metabase::adapters::distributed::Emulator;
use metabase::adapters::{Adapter, DistributedAdapter, RelationalAdapter};
use metabase::models::{
    EncryptionParameters, NodeId, ObjectStatus, ObjectStream, Piece, PieceId, RawObject,
    RawSegment, RedundancyScheme, SegmentPosition,
};
use metabase::services::{Metabase, PartitionRouter};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub fn project(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

pub async fn relational() -> Arc<dyn Adapter> {
    let adapter = RelationalAdapter::connect("sqlite::memory:", 1)
        .await
        .unwrap();
    adapter.migrate(&CancellationToken::new()).await.unwrap();
    Arc::new(adapter)
}

pub async fn distributed(partitions: usize) -> (Arc<Emulator>, Arc<dyn Adapter>) {
    let emulator = Arc::new(Emulator::new(partitions));
    let adapter = DistributedAdapter::new(emulator.clone());
    adapter.migrate(&CancellationToken::new()).await.unwrap();
    (emulator, Arc::new(adapter))
}

pub async fn relational_metabase() -> Metabase {
    Metabase::new(PartitionRouter::new(relational().await))
}

pub async fn distributed_metabase(partitions: usize) -> (Arc<Emulator>, Metabase) {
    let (emulator, adapter) = distributed(partitions).await;
    (emulator, Metabase::new(PartitionRouter::new(adapter)))
}

pub fn object(project: Uuid, bucket: &str, key: &str) -> RawObject {
    RawObject {
        stream: ObjectStream {
            project_id: project,
            bucket_name: bucket.into(),
            object_key: key.into(),
            version: 1,
            stream_id: Uuid::new_v4(),
        },
        created_at: at(1_700_000_000),
        expires_at: None,
        status: ObjectStatus::CommittedUnversioned,
        segment_count: 1,
        encrypted_metadata_nonce: Some(vec![1; 24]),
        encrypted_metadata: Some(vec![2; 32]),
        encrypted_metadata_encrypted_key: Some(vec![3; 48]),
        encrypted_etag: None,
        total_plain_size: 100,
        total_encrypted_size: 128,
        fixed_segment_size: 256,
        encryption: EncryptionParameters {
            cipher_suite: metabase::models::CipherSuite::AES_GCM,
            block_size: 29 * 256,
        },
        zombie_deletion_deadline: None,
    }
}

pub fn node(n: u8) -> NodeId {
    NodeId([n; 32])
}

pub fn segment(stream_id: Uuid, index: u32, nodes: &[u8]) -> RawSegment {
    RawSegment {
        stream_id,
        position: SegmentPosition { part: 0, index },
        created_at: at(1_700_000_000),
        repaired_at: None,
        expires_at: None,
        root_piece_id: PieceId([9; 32]),
        encrypted_key_nonce: vec![4; 24],
        encrypted_key: vec![5; 32],
        encrypted_size: 1024,
        plain_size: 512,
        plain_offset: i64::from(index) * 512,
        encrypted_etag: Some(vec![6; 8]),
        redundancy: RedundancyScheme {
            algorithm: 1,
            share_size: 256,
            required_shares: 2,
            repair_shares: 3,
            optimal_shares: 4,
            total_shares: 5,
        },
        inline_data: None,
        pieces: nodes
            .iter()
            .enumerate()
            .map(|(i, &n)| Piece {
                number: i as u16,
                storage_node: node(n),
            })
            .collect(),
        placement: 0,
    }
}
