//! # Completion Tree
//!
//! Hierarchical completion tracking: know when a unit of work, and all the
//! nested work it spawned, has finished.
//!
//! ## Core Concepts
//!
//! Every unit of work gets a node. A node moves through three gates, each
//! of which opens exactly once:
//! - **Response**: the node's own outcome is known ([`Outcome::Success`] or [`Outcome::Error`])
//! - **Completion**: response known and every child has terminated
//! - **Termination**: completion reached and the [`ExternalGate`], if any, released
//!
//! ## Architecture
//!
//! ```text
//! CompletionTree ── create_root / create_child ──► NodeHandle
//!     │                                               │
//!     │ node table (DashMap<NodeId, node>)            ├─► resolve()
//!     │                                               ├─► on_response / on_complete / on_terminated
//!     ▼                                               └─► serialize() ──► decouple::deserialize()
//! CompletionNode (Mutex<state>)                                              │
//!     │                                                                      ▼
//!     ├─► ListenerRegistry per stage                              free-standing root
//!     │
//!     └─► on termination: leave table, notify parent by id
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Gates are monotonic** - Once open, never closed again
//! 2. **Stages fire in order** - Response, then completion, then termination, per node
//! 3. **Listeners run once** - Late listeners run immediately with the stored outcome
//! 4. **No lock around user code** - Listeners always run with the node unlocked
//! 5. **Parents by id** - A child never keeps its parent alive
//!
//! ## Misuse
//!
//! Resolving twice fails with [`TreeError::AlreadyResolved`]; creating a child
//! under a completed parent fails with [`TreeError::ParentCompleted`]. Both
//! leave the tree untouched.
//!
//! ## Example
//!
//! ```ignore
//! use completion_tree::{CompletionTree, ExternalGate, NodeFailure};
//!
//! let tree: CompletionTree<String, NodeFailure> = CompletionTree::new();
//! let (trigger, gate) = ExternalGate::pair();
//!
//! let root = tree.create_root(tree.metadata().with_correlation_id("req-1"), Some(gate));
//! root.on_terminated(|outcome| tracing::info!(?outcome, "request fully released"));
//!
//! let lookup = root.create_child(None)?;
//! root.resolve_success(Some("reply".into()))?;
//! lookup.resolve_success(None)?;  // root completes
//! trigger.complete();             // root terminates
//! ```

// Core modules
mod config;
mod core;
mod error;
mod gate;
mod handle;
mod listener;
mod metadata;
mod node;
mod tree;

// Serialization seam
pub mod decouple;


// Re-export core types
pub use crate::core::{NodeId, NodeStatus, Outcome, Payload, ResponseState, Stage};

// Re-export error types
pub use crate::error::{NodeFailure, TreeError};

// Re-export configuration
pub use crate::config::{TreeConfig, DEFAULT_OWNER, DEFAULT_SERVER_ID};

// Re-export metadata types
pub use crate::metadata::{ComponentIdentifier, ComponentLocation, RootMetadata, DEFAULT_NAMESPACE};

// Re-export gate types
pub use gate::{ExternalGate, GateTrigger};

// Re-export tree types (primary entry point)
pub use handle::NodeHandle;
pub use tree::CompletionTree;

// Re-export decouple types
pub use decouple::NodeSnapshot;
