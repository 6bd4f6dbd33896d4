//! Bucket usage aggregates and the request that computes them.

use super::location::BucketLocation;
use crate::errors::{MetabaseError, MetabaseResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Aggregate usage of one bucket as of a snapshot.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct BucketTally {
    #[serde(flatten)]
    pub location: BucketLocation,

    pub object_count: i64,
    pub pending_object_count: i64,

    pub total_segments: i64,
    pub total_bytes: i64,

    pub metadata_size: i64,
}

impl BucketTally {
    pub fn new(location: BucketLocation) -> Self {
        Self {
            location,
            ..Self::default()
        }
    }

    /// Adds the counters of `other` into `self`. Locations are not compared.
    ///
    /// A counter leaving the `i64` range is a data integrity error and leaves
    /// `self` unchanged.
    pub fn add(&mut self, other: &BucketTally) -> MetabaseResult<()> {
        let sum = |a: i64, b: i64, counter: &str| {
            a.checked_add(b).ok_or_else(|| {
                MetabaseError::data_integrity(format!(
                    "{counter} of bucket {} overflows",
                    self.location
                ))
            })
        };
        let object_count = sum(self.object_count, other.object_count, "object count")?;
        let pending_object_count = sum(
            self.pending_object_count,
            other.pending_object_count,
            "pending object count",
        )?;
        let total_segments = sum(self.total_segments, other.total_segments, "total segments")?;
        let total_bytes = sum(self.total_bytes, other.total_bytes, "total bytes")?;
        let metadata_size = sum(self.metadata_size, other.metadata_size, "metadata size")?;

        self.object_count = object_count;
        self.pending_object_count = pending_object_count;
        self.total_segments = total_segments;
        self.total_bytes = total_bytes;
        self.metadata_size = metadata_size;
        Ok(())
    }
}

/// How recent the data read by an operation must be.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Consistency {
    /// Read everything committed before the read started.
    #[default]
    Strong,
    /// Read the data exactly as it was at the given instant.
    Snapshot(DateTime<Utc>),
    /// Accept data up to the given age in exchange for lower latency.
    BoundedStaleness(Duration),
}

/// Arguments of a tally collection over `[from, to]`.
#[derive(Clone, Debug, Default)]
pub struct CollectBucketTallies {
    pub from: BucketLocation,
    pub to: BucketLocation,
    pub consistency: Consistency,
    /// Objects expiring at or before this instant are not counted. Defaults to the current time.
    pub now: Option<DateTime<Utc>>,
    /// Use the partitioned scan on backends that support it.
    pub use_partition_query: bool,
}

impl CollectBucketTallies {
    pub fn new(from: BucketLocation, to: BucketLocation) -> Self {
        Self {
            from,
            to,
            ..Self::default()
        }
    }

    /// Rejects ranges whose end is ordered before their start.
    pub fn verify(&self) -> MetabaseResult<()> {
        if self.to.project_id < self.from.project_id {
            return Err(MetabaseError::invalid_request("project ID To is before project ID From"));
        }
        if self.to.project_id == self.from.project_id && self.to.bucket_name < self.from.bucket_name
        {
            return Err(MetabaseError::invalid_request("bucket name To is before bucket name From"));
        }
        Ok(())
    }

    /// Expiry cutoff at stored timestamp precision.
    pub fn now(&self) -> DateTime<Utc> {
        super::stored_timestamp(self.now.unwrap_or_else(Utc::now))
    }

    pub fn contains(&self, location: &BucketLocation) -> bool {
        &self.from <= location && location <= &self.to
    }
}
