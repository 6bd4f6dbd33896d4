//! Addressing types: where a bucket lives and which object version a stream is.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A bucket within a project.
///
/// Ordered by project id, then by bucket name compared bytewise. Every tally
/// range, partition boundary and dump ordering uses this order.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BucketLocation {
    pub project_id: Uuid,
    pub bucket_name: String,
}

impl BucketLocation {
    pub fn new(project_id: Uuid, bucket_name: impl Into<String>) -> Self {
        Self {
            project_id,
            bucket_name: bucket_name.into(),
        }
    }

    /// Smallest possible location, the natural `from` of a full-range request.
    pub fn min() -> Self {
        Self::default()
    }

    /// A location ordered after every bucket of every project.
    pub fn max() -> Self {
        Self {
            project_id: Uuid::max(),
            bucket_name: "\u{10FFFF}".repeat(64),
        }
    }
}

impl fmt::Display for BucketLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project_id, self.bucket_name)
    }
}

/// Encrypted object key. Not guaranteed to be valid UTF-8.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(pub Vec<u8>);

impl From<&str> for ObjectKey {
    fn from(key: &str) -> Self {
        Self(key.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for ObjectKey {
    fn from(key: Vec<u8>) -> Self {
        Self(key)
    }
}

impl AsRef<[u8]> for ObjectKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Identity of a single object version.
///
/// Field order matters: the derived ordering is project, bucket, key, version.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectStream {
    pub project_id: Uuid,
    pub bucket_name: String,
    pub object_key: ObjectKey,
    pub version: i64,
    pub stream_id: Uuid,
}

impl ObjectStream {
    pub fn location(&self) -> BucketLocation {
        BucketLocation::new(self.project_id, self.bucket_name.clone())
    }
}
