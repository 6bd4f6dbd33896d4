//! Canonical data model of the metabase.
//!
//! These types are backend independent: adapters translate them to and from
//! their own column encodings and never expose those encodings here.

pub mod location;
pub mod node_alias;
pub mod object;
pub mod segment;
pub mod tally;

pub use location::{BucketLocation, ObjectKey, ObjectStream};
pub use node_alias::{AliasPiece, AliasPieces, NodeAlias, NodeAliasEntry, NodeId};
pub use object::{CipherSuite, EncryptionParameters, ObjectStatus, RawCopy, RawObject};
pub use segment::{
    Piece, PieceId, Pieces, PlacementConstraint, RawSegment, RedundancyScheme, SegmentPosition,
};
pub use tally::{BucketTally, CollectBucketTallies, Consistency};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// Fractional digits every backend keeps for a timestamp.
pub const TIMESTAMP_PRECISION: u16 = 6;

/// Truncates `at` to the precision timestamps are stored and compared with.
/// Adapters apply this to every timestamp they write or filter on.
pub fn stored_timestamp(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(TIMESTAMP_PRECISION)
}

/// Complete content of the metabase tables, in canonical order.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct RawState {
    pub objects: Vec<RawObject>,
    pub segments: Vec<RawSegment>,
    pub copies: Vec<RawCopy>,
}

impl RawState {
    /// Sorts objects by stream identity, segments by stream then position, copies by stream.
    pub fn sort(&mut self) {
        self.objects.sort_by(|a, b| a.stream.cmp(&b.stream));
        self.segments
            .sort_by(|a, b| (a.stream_id, a.position).cmp(&(b.stream_id, b.position)));
        self.copies.sort();
    }
}
