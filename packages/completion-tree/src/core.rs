//! Core types for completion tracking.
//!
//! # Overview
//!
//! A unit of work is tracked by a node that moves through three gates:
//! - **Response**: the node's own outcome (value or error) is known
//! - **Completion**: response known AND every child node has terminated
//! - **Termination**: completion reached AND any external gate released
//!
//! Each gate opens at most once and never closes again.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Marker trait for values and errors carried by nodes.
///
/// Automatically implemented for any `Clone + Send + Sync + 'static` type.
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Payload for T {}

/// Unique identifier of a node.
///
/// Assigned at creation, never changes, and survives the decouple boundary.
///
/// # Example
///
/// ```ignore
/// use completion_tree::NodeId;
///
/// let id = NodeId::new();
/// let same = NodeId::from(*id.as_uuid());
/// assert_eq!(id, same);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Create a new random node ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for NodeId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<NodeId> for Uuid {
    fn from(id: NodeId) -> Uuid {
        id.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The resolved outcome of a node.
///
/// Success may carry no value. Errors are data: they travel through the
/// same completion and termination gates as values do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum Outcome<V, E> {
    Success(Option<V>),
    Error(E),
}

impl<V, E> Outcome<V, E> {
    /// The success value, if any. Always `None` for errors.
    pub fn value(&self) -> Option<&V> {
        match self {
            Outcome::Success(value) => value.as_ref(),
            Outcome::Error(_) => None,
        }
    }

    /// The error, if this outcome failed.
    pub fn error(&self) -> Option<&E> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Error(err) => Some(err),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error(_))
    }
}

/// Response slot of a node as observed from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseState<V, E> {
    Pending,
    Resolved(Option<V>),
    Failed(E),
}

impl<V: Clone, E: Clone> From<Option<&Outcome<V, E>>> for ResponseState<V, E> {
    fn from(outcome: Option<&Outcome<V, E>>) -> Self {
        match outcome {
            None => ResponseState::Pending,
            Some(Outcome::Success(value)) => ResponseState::Resolved(value.clone()),
            Some(Outcome::Error(err)) => ResponseState::Failed(err.clone()),
        }
    }
}

impl<V, E> ResponseState<V, E> {
    pub fn is_pending(&self) -> bool {
        matches!(self, ResponseState::Pending)
    }
}

/// A point in a node's lifecycle that listeners can subscribe to.
///
/// Stages fire in declaration order for any single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Fired right before response listeners, same thread, same outcome.
    BeforeResponse,
    Response,
    Completion,
    Termination,
}

impl Stage {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Stage::BeforeResponse => "before_response",
            Stage::Response => "response",
            Stage::Completion => "completion",
            Stage::Termination => "termination",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a node's gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    pub response: bool,
    pub complete: bool,
    pub terminated: bool,
    pub active_children: usize,
}
