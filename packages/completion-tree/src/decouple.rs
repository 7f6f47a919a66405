//! Serialization seam that cuts a node loose from its tree.
//!
//! A snapshot keeps only what is immutable about a node: its id, the root
//! metadata, and the outcome if it was already resolved. Parent link, child
//! count, external gate and listeners stay behind.
//!
//! Restoring a snapshot yields a free-standing root in a fresh tree. It never
//! waits for the original's children: resolving it completes and terminates
//! it on the spot, whatever the live original subtree is still doing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::{NodeId, Outcome, Payload, ResponseState};
use crate::error::TreeError;
use crate::handle::NodeHandle;
use crate::metadata::RootMetadata;
use crate::tree::CompletionTree;

/// Transportable part of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot<V, E> {
    pub id: NodeId,
    pub metadata: RootMetadata,
    pub outcome: Option<Outcome<V, E>>,
}

pub fn snapshot<V: Payload, E: Payload>(handle: &NodeHandle<V, E>) -> NodeSnapshot<V, E> {
    NodeSnapshot {
        id: handle.id(),
        metadata: handle.metadata().clone(),
        outcome: outcome_of(handle),
    }
}

fn outcome_of<V: Payload, E: Payload>(handle: &NodeHandle<V, E>) -> Option<Outcome<V, E>> {
    match handle.response_state() {
        ResponseState::Pending => None,
        ResponseState::Resolved(value) => Some(Outcome::Success(value)),
        ResponseState::Failed(err) => Some(Outcome::Error(err)),
    }
}

pub fn serialize<V, E>(handle: &NodeHandle<V, E>) -> Result<Vec<u8>, TreeError>
where
    V: Payload + Serialize,
    E: Payload + Serialize,
{
    let bytes = serde_json::to_vec(&snapshot(handle))?;
    Ok(bytes)
}

pub fn deserialize<V, E>(bytes: &[u8]) -> Result<NodeHandle<V, E>, TreeError>
where
    V: Payload + DeserializeOwned,
    E: Payload + DeserializeOwned,
{
    let snapshot: NodeSnapshot<V, E> = serde_json::from_slice(bytes)?;
    Ok(restore(snapshot))
}

/// Rebuild a free-standing root from a snapshot.
///
/// A snapshot taken after resolution comes back already terminated.
pub fn restore<V: Payload, E: Payload>(snapshot: NodeSnapshot<V, E>) -> NodeHandle<V, E> {
    let NodeSnapshot {
        id,
        metadata,
        outcome,
    } = snapshot;
    let tree = CompletionTree::new();
    let handle = tree.create_root_with_id(id, metadata, None);
    debug!(node = %id, resolved = outcome.is_some(), "node restored from snapshot");

    if let Some(outcome) = outcome {
        // Fresh node, cannot already be resolved
        let _ = handle.resolve(outcome);
    }
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeFailure;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    type Tree = CompletionTree<String, NodeFailure>;
    type Handle = NodeHandle<String, NodeFailure>;

    #[test]
    fn test_restored_node_is_free_standing() {
        let tree = Tree::new();
        let root = tree.create_root(tree.metadata().with_correlation_id("req-7"), None);
        let child = root.create_child(None).unwrap();
        let _grandchild = child.create_child(None).unwrap();

        let bytes = child.serialize().unwrap();
        let restored: Handle = deserialize(&bytes).unwrap();

        assert_eq!(restored.id(), child.id());
        assert_eq!(restored.parent_id(), None);
        assert_eq!(restored.depth(), 0);
        assert_eq!(restored.correlation_id(), "req-7");
        assert_eq!(restored.status().active_children, 0);

        restored.resolve_success(None).unwrap();
        assert!(restored.is_terminated());
        // The original subtree is untouched
        assert!(!child.is_response_done());
        assert_eq!(tree.live_count(), 3);
    }

    #[test]
    fn test_resolved_snapshot_restores_terminated() {
        let tree = Tree::new();
        let root = tree.create_root(tree.metadata(), None);
        root.resolve_error(NodeFailure::new("routing", "no route")).unwrap();

        let restored: Handle = deserialize(&root.serialize().unwrap()).unwrap();
        assert!(restored.is_terminated());

        let seen = Arc::new(AtomicBool::new(false));
        let s = seen.clone();
        restored.on_response(move |outcome| {
            assert_eq!(outcome.error().map(|e| e.kind.as_str()), Some("routing"));
            s.store(true, Ordering::SeqCst);
        });
        assert!(seen.load(Ordering::SeqCst));

        let err = restored.resolve_success(None).unwrap_err();
        assert!(matches!(err, TreeError::AlreadyResolved { .. }));
    }

    #[test]
    fn test_snapshot_skips_live_linkage() {
        let tree = Tree::new();
        let root = tree.create_root(tree.metadata(), None);
        let child = root.create_child(None).unwrap();

        let json: serde_json::Value = serde_json::from_slice(&child.serialize().unwrap()).unwrap();
        let object = json.as_object().unwrap();
        assert!(object.contains_key("id"));
        assert!(object.contains_key("metadata"));
        assert!(object["outcome"].is_null());
        assert!(!object.contains_key("parent"));
        assert!(!object.contains_key("active_children"));
    }

    #[test]
    fn test_garbage_is_a_snapshot_error() {
        let err = deserialize::<String, NodeFailure>(b"not json").unwrap_err();
        assert!(matches!(err, TreeError::Snapshot(_)));
    }
}
