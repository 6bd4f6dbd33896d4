//! Cache-aside mapping between storage node identities and their aliases.
//!
//! Reads resolve against an immutable [`NodeAliasMap`] snapshot that is
//! swapped wholesale after every refresh, so a lookup never waits on an
//! allocation. Allocations and refreshes are serialized by one async mutex;
//! the backing store guarantees that a node keeps the first alias it got.

use crate::errors::{MetabaseError, MetabaseResult};
use crate::models::{AliasPiece, AliasPieces, NodeAlias, NodeAliasEntry, NodeId, Piece, Pieces};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Durable home of the alias table.
#[async_trait]
pub trait NodeAliasStore: Send + Sync {
    /// Allocates aliases for nodes that have none; existing aliases are kept.
    async fn ensure_node_aliases(
        &self,
        cancel: &CancellationToken,
        nodes: &[NodeId],
    ) -> MetabaseResult<()>;

    async fn list_node_aliases(
        &self,
        cancel: &CancellationToken,
    ) -> MetabaseResult<Vec<NodeAliasEntry>>;
}

/// Immutable bidirectional view of the alias table.
#[derive(Debug, Default)]
pub struct NodeAliasMap {
    by_id: HashMap<NodeId, NodeAlias>,
    by_alias: HashMap<NodeAlias, NodeId>,
}

impl NodeAliasMap {
    /// Builds the map, rejecting a node with two aliases or an alias shared by two nodes.
    pub fn new(entries: impl IntoIterator<Item = NodeAliasEntry>) -> MetabaseResult<Self> {
        let mut map = Self::default();
        for entry in entries {
            if let Some(existing) = map.by_id.insert(entry.id, entry.alias) {
                return Err(MetabaseError::data_integrity(format!(
                    "node {} has aliases {existing} and {}",
                    entry.id, entry.alias
                )));
            }
            if let Some(existing) = map.by_alias.insert(entry.alias, entry.id) {
                return Err(MetabaseError::data_integrity(format!(
                    "alias {} is used by nodes {existing} and {}",
                    entry.alias, entry.id
                )));
            }
        }
        Ok(map)
    }

    pub fn alias(&self, id: &NodeId) -> Option<NodeAlias> {
        self.by_id.get(id).copied()
    }

    pub fn node(&self, alias: NodeAlias) -> Option<NodeId> {
        self.by_alias.get(&alias).copied()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    fn to_aliases(&self, pieces: &[Piece]) -> Option<AliasPieces> {
        pieces
            .iter()
            .map(|p| {
                self.alias(&p.storage_node).map(|alias| AliasPiece {
                    number: p.number,
                    alias,
                })
            })
            .collect::<Option<Vec<_>>>()
            .map(AliasPieces)
    }

    fn to_pieces(&self, aliases: &AliasPieces) -> Option<Pieces> {
        aliases
            .0
            .iter()
            .map(|p| {
                self.node(p.alias).map(|storage_node| Piece {
                    number: p.number,
                    storage_node,
                })
            })
            .collect()
    }

    fn missing_nodes(&self, pieces: &[Piece]) -> Vec<NodeId> {
        pieces
            .iter()
            .map(|p| p.storage_node)
            .filter(|id| !self.by_id.contains_key(id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

pub struct NodeAliasCache {
    store: Arc<dyn NodeAliasStore>,
    latest: RwLock<Arc<NodeAliasMap>>,
    refreshing: Mutex<()>,
}

impl NodeAliasCache {
    pub fn new(store: Arc<dyn NodeAliasStore>) -> Self {
        Self {
            store,
            latest: RwLock::new(Arc::new(NodeAliasMap::default())),
            refreshing: Mutex::new(()),
        }
    }

    /// The most recently loaded snapshot.
    pub fn latest(&self) -> Arc<NodeAliasMap> {
        self.latest.read().clone()
    }

    /// Forgets every cached alias. Used after the alias table is wiped.
    ///
    /// Waits for an in-flight refresh, which may have listed the table before
    /// the wipe, so that its snapshot cannot be published afterwards.
    pub async fn reset(&self) {
        let _guard = self.refreshing.lock().await;
        *self.latest.write() = Arc::new(NodeAliasMap::default());
    }

    /// Replaces the snapshot with the current store contents. Callers hold `refreshing`.
    async fn refresh(&self, cancel: &CancellationToken) -> MetabaseResult<Arc<NodeAliasMap>> {
        let entries = self.store.list_node_aliases(cancel).await?;
        let map = Arc::new(NodeAliasMap::new(entries)?);
        debug!(entries = map.len(), "node alias cache refreshed");
        *self.latest.write() = map.clone();
        Ok(map)
    }

    /// Converts pieces to alias pieces, allocating aliases for unseen nodes.
    pub async fn ensure_pieces_to_aliases(
        &self,
        cancel: &CancellationToken,
        pieces: &[Piece],
    ) -> MetabaseResult<AliasPieces> {
        if let Some(aliases) = self.latest().to_aliases(pieces) {
            return Ok(aliases);
        }

        let _guard = self.refreshing.lock().await;
        let mut map = self.latest();
        let missing = map.missing_nodes(pieces);
        if !missing.is_empty() {
            debug!(missing = missing.len(), "allocating node aliases");
            self.store.ensure_node_aliases(cancel, &missing).await?;
            map = self.refresh(cancel).await?;
        }

        map.to_aliases(pieces).ok_or_else(|| {
            MetabaseError::data_integrity("node aliases missing after allocation")
        })
    }

    /// Resolves alias pieces back to node identities, refreshing once on a miss.
    pub async fn convert_aliases_to_pieces(
        &self,
        cancel: &CancellationToken,
        aliases: &AliasPieces,
    ) -> MetabaseResult<Pieces> {
        if let Some(pieces) = self.latest().to_pieces(aliases) {
            return Ok(pieces);
        }

        let _guard = self.refreshing.lock().await;
        if let Some(pieces) = self.latest().to_pieces(aliases) {
            return Ok(pieces);
        }
        let map = self.refresh(cancel).await?;
        map.to_pieces(aliases).ok_or_else(|| {
            let unknown = aliases
                .0
                .iter()
                .find(|p| map.node(p.alias).is_none())
                .map_or(NodeAlias::default(), |p| p.alias);
            MetabaseError::data_integrity(format!("unknown node alias {unknown}"))
        })
    }
}
