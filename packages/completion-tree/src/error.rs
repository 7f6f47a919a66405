//! Structured error types for completion tracking.
//!
//! `TreeError` covers misuse of the primitive (resolving twice, attaching a
//! child too late) and lifecycle failures (timeouts, snapshot encoding,
//! configuration). Application errors are NOT `TreeError`s: they are the
//! `E` in `Outcome<V, E>` and flow through the tree like any value.
//!
//! `NodeFailure` is a ready-made, serde-able error payload for callers that
//! don't bring their own.
//!
//! # Example
//!
//! ```ignore
//! use completion_tree::TreeError;
//!
//! match node.resolve_success(Some(value)) {
//!     Ok(()) => {}
//!     Err(TreeError::AlreadyResolved { node }) => {
//!         tracing::debug!(%node, "lost the race to resolve");
//!     }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::NodeId;

// =============================================================================
// Tree Error
// =============================================================================

/// Structured error type for completion tree operations.
#[derive(Debug, Error)]
pub enum TreeError {
    /// The node's response was already set; the second resolve changed nothing.
    #[error("node {node} already resolved")]
    AlreadyResolved {
        /// The node that was resolved twice.
        node: NodeId,
    },

    /// A child was attached to a node whose completion already fired.
    #[error("cannot attach child: node {parent} already completed")]
    ParentCompleted {
        /// The node that refused the child.
        parent: NodeId,
    },

    /// The node was force-resolved after its deadline passed.
    #[error("node {node} timed out after {duration:?}")]
    Timeout {
        /// The node that expired.
        node: NodeId,
        /// How long it was given.
        duration: Duration,
    },

    /// A snapshot could not be encoded or decoded.
    #[error("snapshot encoding failed: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// A configuration value was present but unusable.
    #[error("invalid configuration for {key}: {message}")]
    InvalidConfig {
        /// Environment key that failed.
        key: &'static str,
        /// What was wrong with it.
        message: String,
    },
}

impl TreeError {
    /// Returns true for errors caused by calling the primitive out of order.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            TreeError::AlreadyResolved { .. } | TreeError::ParentCompleted { .. }
        )
    }
}

// =============================================================================
// Node Failure
// =============================================================================

/// A generic error payload for nodes.
///
/// Implements `From<TreeError>` so it can be used with
/// [`NodeHandle::expire_after`](crate::NodeHandle::expire_after).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct NodeFailure {
    /// Short machine-readable category (e.g. `"timeout"`, `"routing"`).
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}

impl NodeFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<TreeError> for NodeFailure {
    fn from(err: TreeError) -> Self {
        let kind = match &err {
            TreeError::AlreadyResolved { .. } | TreeError::ParentCompleted { .. } => "misuse",
            TreeError::Timeout { .. } => "timeout",
            TreeError::Snapshot(_) => "snapshot",
            TreeError::InvalidConfig { .. } => "config",
        };
        NodeFailure::new(kind, err.to_string())
    }
}
