//! Represents a segment of an object and the pieces it was erasure coded into.

use super::node_alias::NodeId;
use crate::errors::{MetabaseError, MetabaseResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Position of a segment inside its object: multipart part number and index within the part.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentPosition {
    pub part: u32,
    pub index: u32,
}

impl SegmentPosition {
    pub fn encode(self) -> u64 {
        (u64::from(self.part) << 32) | u64::from(self.index)
    }

    pub fn decode(encoded: u64) -> Self {
        Self {
            part: (encoded >> 32) as u32,
            index: encoded as u32,
        }
    }
}

/// Erasure coding parameters of a remote segment.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RedundancyScheme {
    pub algorithm: u8,
    pub share_size: u32,
    pub required_shares: u8,
    pub repair_shares: u8,
    pub optimal_shares: u8,
    pub total_shares: u8,
}

impl RedundancyScheme {
    const MAX_SHARE_SIZE: u32 = (1 << 24) - 1;

    /// Packs the scheme into one 64-bit column, low byte first:
    /// algorithm, share size (24 bits), required, repair, optimal, total.
    pub fn pack(&self) -> MetabaseResult<i64> {
        if self.share_size > Self::MAX_SHARE_SIZE {
            return Err(MetabaseError::invalid_request(format!(
                "share size {} does not fit the packed redundancy column",
                self.share_size
            )));
        }
        let packed = u64::from(self.algorithm)
            | (u64::from(self.share_size) << 8)
            | (u64::from(self.required_shares) << 32)
            | (u64::from(self.repair_shares) << 40)
            | (u64::from(self.optimal_shares) << 48)
            | (u64::from(self.total_shares) << 56);
        Ok(packed as i64)
    }

    pub fn unpack(packed: i64) -> Self {
        let packed = packed as u64;
        Self {
            algorithm: packed as u8,
            share_size: ((packed >> 8) & u64::from(Self::MAX_SHARE_SIZE)) as u32,
            required_shares: (packed >> 32) as u8,
            repair_shares: (packed >> 40) as u8,
            optimal_shares: (packed >> 48) as u8,
            total_shares: (packed >> 56) as u8,
        }
    }
}

/// Root piece id from which every per-node piece id is derived.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PieceId(pub [u8; 32]);

impl PieceId {
    pub fn from_slice(bytes: &[u8]) -> MetabaseResult<Self> {
        let id: [u8; 32] = bytes.try_into().map_err(|_| {
            MetabaseError::data_integrity(format!("piece id has {} bytes, want 32", bytes.len()))
        })?;
        Ok(Self(id))
    }
}

impl fmt::Display for PieceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// One erasure share of a segment, held by one storage node.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Piece {
    pub number: u16,
    pub storage_node: NodeId,
}

pub type Pieces = Vec<Piece>;

/// Placement constraint restricting which nodes may hold pieces.
pub type PlacementConstraint = u16;

/// Full segment row. Rarely used directly outside of bulk load and dump.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RawSegment {
    pub stream_id: Uuid,
    pub position: SegmentPosition,

    pub created_at: DateTime<Utc>,
    pub repaired_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,

    pub root_piece_id: PieceId,
    pub encrypted_key_nonce: Vec<u8>,
    pub encrypted_key: Vec<u8>,

    /// Size of the whole segment, not of a piece.
    pub encrypted_size: i32,
    /// Zero for a migrated object.
    pub plain_size: i32,
    /// Zero for a migrated object.
    pub plain_offset: i64,
    pub encrypted_etag: Option<Vec<u8>>,

    pub redundancy: RedundancyScheme,

    pub inline_data: Option<Vec<u8>>,
    pub pieces: Pieces,

    pub placement: PlacementConstraint,
}
