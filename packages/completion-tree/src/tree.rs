//! Node factory and the shared node table.
//!
//! The table is the only owner of live nodes. Nodes point back at it through
//! a `Weak`, and at their parent through a `NodeId`, so abandoning a subtree
//! never keeps another node alive. A node leaves the table the moment it
//! terminates; after that only caller-held [`NodeHandle`]s keep it around.
//!
//! # Example
//!
//! ```ignore
//! use completion_tree::{CompletionTree, ExternalGate, NodeFailure};
//!
//! let tree: CompletionTree<String, NodeFailure> = CompletionTree::new();
//! let (trigger, gate) = ExternalGate::pair();
//!
//! let root = tree.create_root(tree.metadata(), Some(gate));
//! let child = root.create_child(None)?;
//!
//! root.on_complete(|outcome| tracing::info!(?outcome, "all nested work done"));
//! root.resolve_success(Some("reply".into()))?;
//! child.resolve_success(None)?;   // root completes here
//! trigger.complete();             // root terminates here
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::config::TreeConfig;
use crate::core::{NodeId, Payload};
use crate::error::TreeError;
use crate::gate::ExternalGate;
use crate::handle::NodeHandle;
use crate::metadata::RootMetadata;
use crate::node::{CompletionNode, NodeInit};

// =============================================================================
// Node Table
// =============================================================================

/// Live (not yet terminated) nodes keyed by id.
pub(crate) struct NodeTable<V, E> {
    nodes: DashMap<NodeId, Arc<CompletionNode<V, E>>>,
}

impl<V, E> NodeTable<V, E> {
    fn new() -> Self {
        Self {
            nodes: DashMap::new(),
        }
    }

    fn insert(&self, id: NodeId, node: Arc<CompletionNode<V, E>>) {
        self.nodes.insert(id, node);
    }

    /// Clone the node out so no shard lock is held while the caller uses it.
    pub(crate) fn get(&self, id: &NodeId) -> Option<Arc<CompletionNode<V, E>>> {
        self.nodes.get(id).map(|entry| entry.value().clone())
    }

    pub(crate) fn remove(&self, id: &NodeId) {
        self.nodes.remove(id);
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }
}

// =============================================================================
// Completion Tree
// =============================================================================

/// Creates root and child nodes and owns the table they live in.
///
/// Cloning is cheap; clones share the same table.
pub struct CompletionTree<V, E> {
    table: Arc<NodeTable<V, E>>,
    config: Arc<TreeConfig>,
}

impl<V, E> Clone for CompletionTree<V, E> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            config: self.config.clone(),
        }
    }
}

impl<V: Payload, E: Payload> CompletionTree<V, E> {
    /// Create a tree with default configuration.
    pub fn new() -> Self {
        Self::with_config(TreeConfig::default())
    }

    pub fn with_config(config: TreeConfig) -> Self {
        Self {
            table: Arc::new(NodeTable::new()),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// Root metadata pre-filled with the configured owner and server id.
    pub fn metadata(&self) -> RootMetadata {
        RootMetadata::new(self.config.owner.clone()).with_server_id(self.config.server_id.clone())
    }

    /// Create a root node. With a gate, termination also waits for the gate.
    pub fn create_root(
        &self,
        metadata: RootMetadata,
        gate: Option<ExternalGate>,
    ) -> NodeHandle<V, E> {
        self.create_root_with_id(NodeId::new(), metadata, gate)
    }

    pub(crate) fn create_root_with_id(
        &self,
        id: NodeId,
        metadata: RootMetadata,
        gate: Option<ExternalGate>,
    ) -> NodeHandle<V, E> {
        debug!(
            node = %id,
            owner = %metadata.owner,
            server_id = %metadata.server_id,
            gated = gate.is_some(),
            "root created"
        );
        let init = NodeInit {
            id,
            parent: None,
            root_id: id,
            depth: 0,
            metadata: Arc::new(metadata),
            gated: gate.is_some(),
        };
        self.register(init, gate)
    }

    /// Create a root that force-fails after the configured `root_timeout`.
    ///
    /// Without a configured timeout this is [`create_root`](Self::create_root).
    /// The deadline is only armed when called within a Tokio runtime.
    pub fn create_expiring_root(
        &self,
        metadata: RootMetadata,
        gate: Option<ExternalGate>,
    ) -> NodeHandle<V, E>
    where
        E: From<TreeError>,
    {
        let root = self.create_root(metadata, gate);
        if let Some(timeout) = self.config.root_timeout {
            root.expire_after(timeout);
        }
        root
    }

    /// Create a child under `parent`.
    ///
    /// The parent's child count is bumped before the child exists, so the
    /// parent can never miss it.
    pub(crate) fn create_child(
        &self,
        parent: &CompletionNode<V, E>,
        gate: Option<ExternalGate>,
    ) -> Result<NodeHandle<V, E>, TreeError> {
        parent.register_child()?;

        let id = NodeId::new();
        trace!(node = %id, parent = %parent.id(), depth = parent.depth() + 1, "child created");
        let init = NodeInit {
            id,
            parent: Some(parent.id()),
            root_id: parent.root_id(),
            depth: parent.depth() + 1,
            metadata: parent.metadata().clone(),
            gated: gate.is_some(),
        };
        Ok(self.register(init, gate))
    }

    fn register(&self, init: NodeInit, gate: Option<ExternalGate>) -> NodeHandle<V, E> {
        let id = init.id;
        let node = Arc::new(CompletionNode::new(init, Arc::downgrade(&self.table)));
        self.table.insert(id, node.clone());

        if let Some(gate) = gate {
            let weak = Arc::downgrade(&node);
            gate.subscribe(move || {
                if let Some(node) = weak.upgrade() {
                    node.release_gate();
                }
            });
        }

        NodeHandle::new(node, self.clone())
    }

    /// Look up a live node. Terminated nodes are no longer in the table.
    pub fn get(&self, id: NodeId) -> Option<NodeHandle<V, E>> {
        self.table
            .get(&id)
            .map(|node| NodeHandle::new(node, self.clone()))
    }

    /// Number of nodes that have not terminated yet.
    pub fn live_count(&self) -> usize {
        self.table.len()
    }
}

impl<V: Payload, E: Payload> Default for CompletionTree<V, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, E> std::fmt::Debug for CompletionTree<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionTree")
            .field("live_nodes", &self.table.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeFailure;
    use crate::metadata::ComponentLocation;

    type Tree = CompletionTree<String, NodeFailure>;

    #[test]
    fn test_root_is_in_table_until_terminated() {
        let tree = Tree::new();
        let root = tree.create_root(tree.metadata(), None);
        assert_eq!(tree.live_count(), 1);
        assert!(tree.get(root.id()).is_some());

        root.resolve_success(None).unwrap();
        assert_eq!(tree.live_count(), 0);
        assert!(tree.get(root.id()).is_none());
        // The handle still works after the table let go
        assert!(root.is_terminated());
    }

    #[test]
    fn test_child_inherits_root_identity() {
        let tree = Tree::new();
        let metadata = tree
            .metadata()
            .with_correlation_id("req-1")
            .with_location(ComponentLocation::parse("http:listener", "flow/source"));
        let root = tree.create_root(metadata, None);
        let child = root.create_child(None).unwrap();
        let grandchild = child.create_child(None).unwrap();

        assert_eq!(child.parent_id(), Some(root.id()));
        assert_eq!(grandchild.parent_id(), Some(child.id()));
        assert_eq!(grandchild.root_id(), root.id());
        assert_eq!(grandchild.depth(), 2);
        assert_eq!(grandchild.correlation_id(), "req-1");
        assert_eq!(
            grandchild.metadata().location.as_ref().map(|l| l.identifier.name.as_str()),
            Some("listener")
        );
        assert_eq!(tree.live_count(), 3);
    }

    #[test]
    fn test_metadata_uses_config() {
        let tree = Tree::with_config(TreeConfig {
            server_id: "node-9".into(),
            owner: "billing".into(),
            root_timeout: None,
        });
        let metadata = tree.metadata();
        assert_eq!(metadata.server_id, "node-9");
        assert_eq!(metadata.owner, "billing");
    }

    #[test]
    fn test_subtree_drains_table() {
        let tree = Tree::new();
        let root = tree.create_root(tree.metadata(), None);
        let children: Vec<_> = (0..4).map(|_| root.create_child(None).unwrap()).collect();
        assert_eq!(root.status().active_children, 4);

        root.resolve_success(None).unwrap();
        for child in &children {
            child.resolve_success(None).unwrap();
        }

        assert!(root.is_terminated());
        assert_eq!(tree.live_count(), 0);
    }

    #[test]
    fn test_gate_already_released_at_creation() {
        let tree = Tree::new();
        let (trigger, gate) = ExternalGate::pair();
        trigger.complete();

        let root = tree.create_root(tree.metadata(), Some(gate));
        root.resolve_success(None).unwrap();
        assert!(root.is_terminated());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiring_root_fails_after_timeout() {
        let tree = Tree::with_config(
            TreeConfig::default().with_root_timeout(std::time::Duration::from_millis(100)),
        );
        let root = tree.create_expiring_root(tree.metadata(), None);

        let outcome = root.termination().await;
        assert_eq!(outcome.error().map(|e| e.kind.as_str()), Some("timeout"));
        assert_eq!(tree.live_count(), 0);
    }

    #[test]
    fn test_expiring_root_outside_runtime_does_not_panic() {
        let tree = Tree::with_config(
            TreeConfig::default().with_root_timeout(std::time::Duration::from_millis(100)),
        );
        let root = tree.create_expiring_root(tree.metadata(), None);
        assert!(root.response_state().is_pending());

        root.resolve_success(None).unwrap();
        assert_eq!(tree.live_count(), 0);
    }

    #[test]
    fn test_gated_child_holds_parent_completion() {
        let tree = Tree::new();
        let root = tree.create_root(tree.metadata(), None);
        let (trigger, gate) = ExternalGate::pair();
        let child = root.create_child(Some(gate)).unwrap();

        child.resolve_success(None).unwrap();
        root.resolve_success(None).unwrap();

        assert!(child.is_complete());
        assert!(!child.is_terminated());
        assert!(root.is_response_done());
        assert!(!root.is_complete());
        assert_eq!(root.status().active_children, 1);
        assert_eq!(tree.live_count(), 2);

        trigger.complete();
        assert!(child.is_terminated());
        assert!(root.is_terminated());
        assert_eq!(tree.live_count(), 0);
    }
}
