//! Represents an object version as it is stored in the objects table.

use super::location::ObjectStream;
use crate::errors::{MetabaseError, MetabaseResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an object version.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectStatus {
    /// Upload started but not yet committed.
    Pending,
    CommittedUnversioned,
    CommittedVersioned,
    DeleteMarkerVersioned,
    DeleteMarkerUnversioned,
}

impl ObjectStatus {
    /// Stored representation of [`ObjectStatus::Pending`], used by the tally queries.
    pub const PENDING_CODE: i64 = 1;

    pub fn code(self) -> i64 {
        match self {
            Self::Pending => Self::PENDING_CODE,
            Self::CommittedUnversioned => 3,
            Self::CommittedVersioned => 4,
            Self::DeleteMarkerVersioned => 5,
            Self::DeleteMarkerUnversioned => 6,
        }
    }

    pub fn from_code(code: i64) -> MetabaseResult<Self> {
        match code {
            Self::PENDING_CODE => Ok(Self::Pending),
            3 => Ok(Self::CommittedUnversioned),
            4 => Ok(Self::CommittedVersioned),
            5 => Ok(Self::DeleteMarkerVersioned),
            6 => Ok(Self::DeleteMarkerUnversioned),
            other => Err(MetabaseError::data_integrity(format!("unknown object status {other}"))),
        }
    }

    pub fn is_pending(self) -> bool {
        self == Self::Pending
    }
}

/// Cipher used for object content.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CipherSuite(pub u8);

impl CipherSuite {
    pub const UNSPECIFIED: Self = Self(0);
    pub const NULL: Self = Self(1);
    pub const AES_GCM: Self = Self(2);
    pub const SECRET_BOX: Self = Self(3);
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct EncryptionParameters {
    pub cipher_suite: CipherSuite,
    pub block_size: i32,
}

impl EncryptionParameters {
    /// Packs the parameters into one integer column: cipher suite in the low
    /// byte, block size in the following 32 bits. Zero means "not set".
    pub fn pack(&self) -> i64 {
        i64::from(self.cipher_suite.0) | (i64::from(self.block_size as u32) << 8)
    }

    pub fn unpack(packed: i64) -> MetabaseResult<Self> {
        if packed >> 40 != 0 || packed < 0 {
            return Err(MetabaseError::data_integrity(format!(
                "invalid packed encryption parameters {packed:#x}"
            )));
        }
        Ok(Self {
            cipher_suite: CipherSuite((packed & 0xff) as u8),
            block_size: ((packed >> 8) & 0xffff_ffff) as u32 as i32,
        })
    }
}

/// Full object row. Rarely used directly outside of bulk load and dump.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RawObject {
    #[serde(flatten)]
    pub stream: ObjectStream,

    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,

    pub status: ObjectStatus,
    pub segment_count: i32,

    pub encrypted_metadata_nonce: Option<Vec<u8>>,
    pub encrypted_metadata: Option<Vec<u8>>,
    pub encrypted_metadata_encrypted_key: Option<Vec<u8>>,
    pub encrypted_etag: Option<Vec<u8>>,

    /// Zero for a migrated object.
    pub total_plain_size: i64,
    pub total_encrypted_size: i64,
    /// Zero for a migrated object.
    pub fixed_segment_size: i32,

    pub encryption: EncryptionParameters,

    /// When an abandoned pending object becomes eligible for cleanup.
    pub zombie_deletion_deadline: Option<DateTime<Utc>>,
}

impl RawObject {
    /// Combined length of the encrypted metadata and etag, as counted by tallies.
    pub fn metadata_size(&self) -> i64 {
        let len = |v: &Option<Vec<u8>>| v.as_ref().map_or(0, |b| b.len() as i64);
        len(&self.encrypted_metadata) + len(&self.encrypted_etag)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// `stream_id` shares the segments of `ancestor_stream_id` without copying them.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawCopy {
    pub stream_id: Uuid,
    pub ancestor_stream_id: Uuid,
}
