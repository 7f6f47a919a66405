//! Caller-facing handle to a node.
//!
//! Pipeline code resolves nodes and spawns children through handles;
//! observers subscribe to stages through them. Handles are cheap to clone
//! and keep the node (not its parent or children) alive.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::warn;

use crate::core::{NodeId, NodeStatus, Outcome, Payload, ResponseState, Stage};
use crate::error::TreeError;
use crate::gate::ExternalGate;
use crate::metadata::RootMetadata;
use crate::node::CompletionNode;
use crate::tree::CompletionTree;

pub struct NodeHandle<V, E> {
    node: Arc<CompletionNode<V, E>>,
    tree: CompletionTree<V, E>,
}

impl<V, E> Clone for NodeHandle<V, E> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            tree: self.tree.clone(),
        }
    }
}

impl<V: Payload, E: Payload> NodeHandle<V, E> {
    pub(crate) fn new(node: Arc<CompletionNode<V, E>>, tree: CompletionTree<V, E>) -> Self {
        Self { node, tree }
    }

    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    pub fn parent_id(&self) -> Option<NodeId> {
        self.node.parent()
    }

    pub fn root_id(&self) -> NodeId {
        self.node.root_id()
    }

    /// Distance from the root (roots are at depth 0).
    pub fn depth(&self) -> usize {
        self.node.depth()
    }

    /// Metadata of the root this node belongs to.
    pub fn metadata(&self) -> &RootMetadata {
        self.node.metadata()
    }

    /// The root's correlation id, or the root id when none was given.
    pub fn correlation_id(&self) -> String {
        self.metadata()
            .correlation_id
            .clone()
            .unwrap_or_else(|| self.root_id().to_string())
    }

    /// The tree this node lives in.
    pub fn tree(&self) -> &CompletionTree<V, E> {
        &self.tree
    }

    /// Spawn a child whose termination this node's completion waits for.
    ///
    /// Fails with [`TreeError::ParentCompleted`] once this node has completed.
    pub fn create_child(&self, gate: Option<ExternalGate>) -> Result<NodeHandle<V, E>, TreeError> {
        self.tree.create_child(&self.node, gate)
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Set the response. Fails with [`TreeError::AlreadyResolved`] on a second call.
    pub fn resolve(&self, outcome: Outcome<V, E>) -> Result<(), TreeError> {
        self.node.resolve(outcome)
    }

    pub fn resolve_success(&self, value: Option<V>) -> Result<(), TreeError> {
        self.resolve(Outcome::Success(value))
    }

    pub fn resolve_error(&self, error: E) -> Result<(), TreeError> {
        self.resolve(Outcome::Error(error))
    }

    /// Force-fail the node with [`TreeError::Timeout`] if it is still
    /// unresolved after `after`.
    ///
    /// The timer runs on the current Tokio runtime. Outside a runtime no
    /// deadline is armed and a warning is logged.
    pub fn expire_after(&self, after: Duration)
    where
        E: From<TreeError>,
    {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(
                    node = %self.id(),
                    timeout = ?after,
                    error = %e,
                    "no tokio runtime, deadline not armed"
                );
                return;
            }
        };
        let node = Arc::downgrade(&self.node);
        runtime.spawn(async move {
            tokio::time::sleep(after).await;
            let Some(node) = node.upgrade() else {
                return;
            };
            if node.outcome().is_some() {
                return;
            }
            let id = node.id();
            warn!(node = %id, timeout = ?after, "deadline passed, failing node");
            let err = TreeError::Timeout {
                node: id,
                duration: after,
            };
            // Losing a race against a real resolve is fine
            let _ = node.resolve(Outcome::Error(err.into()));
        });
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Runs before any response listener, on the resolving thread.
    pub fn on_before_response(&self, f: impl FnOnce(&Outcome<V, E>) + Send + 'static) {
        self.node.listen(Stage::BeforeResponse, Box::new(f));
    }

    pub fn on_response(&self, f: impl FnOnce(&Outcome<V, E>) + Send + 'static) {
        self.node.listen(Stage::Response, Box::new(f));
    }

    /// Runs once the response is set and every child has terminated.
    pub fn on_complete(&self, f: impl FnOnce(&Outcome<V, E>) + Send + 'static) {
        self.node.listen(Stage::Completion, Box::new(f));
    }

    /// Runs once completed and the external gate (if any) is released.
    pub fn on_terminated(&self, f: impl FnOnce(&Outcome<V, E>) + Send + 'static) {
        self.node.listen(Stage::Termination, Box::new(f));
    }

    /// Wait for the response.
    ///
    /// Stays pending for as long as the node is unresolved; wrap it in
    /// `tokio::time::timeout` or use [`expire_after`](Self::expire_after)
    /// to bound the wait.
    pub async fn response(&self) -> Outcome<V, E> {
        self.await_stage(Stage::Response).await
    }

    /// Wait for completion. Pending until the response and every child are in.
    pub async fn completion(&self) -> Outcome<V, E> {
        self.await_stage(Stage::Completion).await
    }

    /// Wait for termination. Pending until completed and the gate is released.
    pub async fn termination(&self) -> Outcome<V, E> {
        self.await_stage(Stage::Termination).await
    }

    async fn await_stage(&self, stage: Stage) -> Outcome<V, E> {
        let (tx, rx) = oneshot::channel();
        self.node.listen(
            stage,
            Box::new(move |outcome: &Outcome<V, E>| {
                let _ = tx.send(outcome.clone());
            }),
        );
        match rx.await {
            Ok(outcome) => outcome,
            // The sender sits in this node's registry and `self` keeps the
            // node alive, so it is only dropped after sending.
            Err(_) => std::future::pending().await,
        }
    }

    // =========================================================================
    // State
    // =========================================================================

    pub fn status(&self) -> NodeStatus {
        self.node.status()
    }

    pub fn response_state(&self) -> ResponseState<V, E> {
        ResponseState::from(self.node.outcome().as_deref())
    }

    pub fn is_response_done(&self) -> bool {
        self.status().response
    }

    pub fn is_complete(&self) -> bool {
        self.status().complete
    }

    pub fn is_terminated(&self) -> bool {
        self.status().terminated
    }

    /// Encode this node for the decouple boundary.
    ///
    /// See [`crate::decouple`] for what survives.
    pub fn serialize(&self) -> Result<Vec<u8>, TreeError>
    where
        V: Serialize,
        E: Serialize,
    {
        crate::decouple::serialize(self)
    }
}

impl<V, E> std::fmt::Debug for NodeHandle<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("node", &self.node)
            .finish()
    }
}
