pub mod alias_cache;
pub mod metabase;

pub use alias_cache::{NodeAliasCache, NodeAliasMap, NodeAliasStore};
pub use metabase::{Metabase, PartitionRouter, merge_tallies};
