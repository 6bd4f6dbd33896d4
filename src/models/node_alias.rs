//! Storage node identities and their compact aliases.

use crate::errors::{MetabaseError, MetabaseResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Full identity of a storage node.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; 32]);

impl NodeId {
    pub fn from_slice(bytes: &[u8]) -> MetabaseResult<Self> {
        let id: [u8; 32] = bytes.try_into().map_err(|_| {
            MetabaseError::data_integrity(format!("node id has {} bytes, want 32", bytes.len()))
        })?;
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Dense integer standing in for a [`NodeId`] inside segment piece lists.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAlias(pub i32);

impl fmt::Display for NodeAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A row of the node alias table.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeAliasEntry {
    pub id: NodeId,
    pub alias: NodeAlias,
}

/// A piece whose node is referenced through its alias.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AliasPiece {
    pub number: u16,
    pub alias: NodeAlias,
}

/// Alias pieces of one segment, as stored in the `remote_alias_pieces` column.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct AliasPieces(pub Vec<AliasPiece>);

impl AliasPieces {
    const ENCODED_PIECE_LEN: usize = 6;

    /// Fixed-width encoding: little endian piece number (2 bytes) followed by
    /// little endian alias (4 bytes) for every piece, in list order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * Self::ENCODED_PIECE_LEN);
        for piece in &self.0 {
            out.extend_from_slice(&piece.number.to_le_bytes());
            out.extend_from_slice(&piece.alias.0.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> MetabaseResult<Self> {
        if data.len() % Self::ENCODED_PIECE_LEN != 0 {
            return Err(MetabaseError::data_integrity(format!(
                "alias pieces of {} bytes are not a multiple of {}",
                data.len(),
                Self::ENCODED_PIECE_LEN
            )));
        }
        let pieces = data
            .chunks_exact(Self::ENCODED_PIECE_LEN)
            .map(|chunk| AliasPiece {
                number: u16::from_le_bytes([chunk[0], chunk[1]]),
                alias: NodeAlias(i32::from_le_bytes([chunk[2], chunk[3], chunk[4], chunk[5]])),
            })
            .collect();
        Ok(Self(pieces))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
