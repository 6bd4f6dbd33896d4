//! Metadata engine of a distributed object store.
//!
//! Objects, segments and node aliases live behind one or more backend
//! [`adapters`]; the [`services::Metabase`] façade routes each project to its
//! adapter and merges per-adapter bucket tallies into one ordered result.

pub mod adapters;
pub mod config;
pub mod errors;
pub mod models;
pub mod services;

pub use errors::{MetabaseError, MetabaseResult};
pub use services::Metabase;
