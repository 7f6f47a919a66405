//! The completion node state machine.
//!
//! ```text
//! resolve() ──► BeforeResponse ──► Response ─┐
//!                                            ├─► Completion ─┐
//! last child terminated ─────────────────────┘               ├─► Termination ──► parent.on_child_terminated()
//! external gate released ────────────────────────────────────┘
//! ```
//!
//! Every mutable field sits behind one mutex per node. Transitions are
//! decided under that lock; listeners always run with it released. A stage
//! only opens once the previous stage has drained its listeners, and
//! whichever thread makes the final change (resolve, last child, gate) is
//! the one that carries the node forward. A terminating node hands its
//! parent back to the caller, which keeps walking up in a loop.
//!
//! A node never holds a strong reference to another node. The parent link
//! is a `NodeId` resolved through the shared node table at notification
//! time.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, error, trace, warn};

use crate::core::{NodeId, NodeStatus, Outcome, Payload, Stage};
use crate::error::TreeError;
use crate::listener::{ListenerRegistry, Registration};
use crate::metadata::RootMetadata;
use crate::tree::NodeTable;

/// Callback run when a stage fires.
pub(crate) type Listener<V, E> = Box<dyn FnOnce(&Outcome<V, E>) + Send + 'static>;

/// A parent still to be told that one of its children terminated.
type ParentNotice<V, E> = Option<(Arc<CompletionNode<V, E>>, NodeId)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateStatus {
    Absent,
    Waiting,
    Released,
}

struct NodeState<V, E> {
    response: Option<Arc<Outcome<V, E>>>,
    active_children: usize,
    gate: GateStatus,
    before_response: ListenerRegistry<Listener<V, E>>,
    response_listeners: ListenerRegistry<Listener<V, E>>,
    completion: ListenerRegistry<Listener<V, E>>,
    termination: ListenerRegistry<Listener<V, E>>,
}

impl<V, E> NodeState<V, E> {
    fn registry(&mut self, stage: Stage) -> &mut ListenerRegistry<Listener<V, E>> {
        match stage {
            Stage::BeforeResponse => &mut self.before_response,
            Stage::Response => &mut self.response_listeners,
            Stage::Completion => &mut self.completion,
            Stage::Termination => &mut self.termination,
        }
    }
}

/// Immutable identity of a node, fixed at creation.
pub(crate) struct NodeInit {
    pub(crate) id: NodeId,
    pub(crate) parent: Option<NodeId>,
    pub(crate) root_id: NodeId,
    pub(crate) depth: usize,
    pub(crate) metadata: Arc<RootMetadata>,
    pub(crate) gated: bool,
}

pub(crate) struct CompletionNode<V, E> {
    id: NodeId,
    parent: Option<NodeId>,
    root_id: NodeId,
    depth: usize,
    metadata: Arc<RootMetadata>,
    table: Weak<NodeTable<V, E>>,
    state: Mutex<NodeState<V, E>>,
}

impl<V: Payload, E: Payload> CompletionNode<V, E> {
    pub(crate) fn new(init: NodeInit, table: Weak<NodeTable<V, E>>) -> Self {
        let gate = if init.gated {
            GateStatus::Waiting
        } else {
            GateStatus::Absent
        };
        Self {
            id: init.id,
            parent: init.parent,
            root_id: init.root_id,
            depth: init.depth,
            metadata: init.metadata,
            table,
            state: Mutex::new(NodeState {
                response: None,
                active_children: 0,
                gate,
                before_response: ListenerRegistry::new(),
                response_listeners: ListenerRegistry::new(),
                completion: ListenerRegistry::new(),
                termination: ListenerRegistry::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NodeState<V, E>> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!(node = %self.id, "node mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub(crate) fn root_id(&self) -> NodeId {
        self.root_id
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn metadata(&self) -> &Arc<RootMetadata> {
        &self.metadata
    }

    pub(crate) fn outcome(&self) -> Option<Arc<Outcome<V, E>>> {
        self.lock().response.clone()
    }

    pub(crate) fn status(&self) -> NodeStatus {
        let state = self.lock();
        NodeStatus {
            response: state.response.is_some(),
            complete: state.completion.has_fired(),
            terminated: state.termination.has_fired(),
            active_children: state.active_children,
        }
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Count a new child. Must happen before the child exists.
    pub(crate) fn register_child(&self) -> Result<(), TreeError> {
        let mut state = self.lock();
        if !state.completion.is_pending() {
            warn!(parent = %self.id, "child requested after completion");
            return Err(TreeError::ParentCompleted { parent: self.id });
        }
        state.active_children += 1;
        trace!(node = %self.id, active_children = state.active_children, "child registered");
        Ok(())
    }

    /// Set the response exactly once and drive the node forward.
    pub(crate) fn resolve(&self, outcome: Outcome<V, E>) -> Result<(), TreeError> {
        let outcome = {
            let mut state = self.lock();
            if state.response.is_some() {
                warn!(node = %self.id, "resolve called on an already resolved node");
                return Err(TreeError::AlreadyResolved { node: self.id });
            }
            let outcome = Arc::new(outcome);
            state.response = Some(outcome.clone());
            state.before_response.open();
            outcome
        };
        debug!(node = %self.id, error = outcome.is_error(), "response resolved");

        self.dispatch(Stage::BeforeResponse, &outcome);
        let opened = self.lock().response_listeners.open();
        if opened {
            self.dispatch(Stage::Response, &outcome);
        }
        Self::propagate(self.check_completion());
        Ok(())
    }

    pub(crate) fn release_gate(&self) {
        {
            let mut state = self.lock();
            if state.gate != GateStatus::Waiting {
                return;
            }
            state.gate = GateStatus::Released;
        }
        debug!(node = %self.id, "external gate released");
        Self::propagate(self.check_termination());
    }

    /// Walk up the ancestors that terminate in turn.
    ///
    /// Each level hands back the next parent instead of calling into it, so
    /// the depth of the tree never grows the stack.
    fn propagate(mut notice: ParentNotice<V, E>) {
        while let Some((parent, child)) = notice {
            notice = parent.on_child_terminated(child);
        }
    }

    fn on_child_terminated(&self, child: NodeId) -> ParentNotice<V, E> {
        {
            let mut state = self.lock();
            match state.active_children.checked_sub(1) {
                Some(remaining) => state.active_children = remaining,
                None => {
                    error!(
                        node = %self.id,
                        %child,
                        "child terminated but no children were counted"
                    );
                    return None;
                }
            }
            trace!(node = %self.id, %child, remaining = state.active_children, "child terminated");
        }
        self.check_completion()
    }

    fn check_completion(&self) -> ParentNotice<V, E> {
        let outcome = {
            let mut state = self.lock();
            if !state.response_listeners.is_done() || state.active_children > 0 {
                return None;
            }
            let outcome = state.response.clone()?;
            if !state.completion.open() {
                return None;
            }
            outcome
        };
        self.dispatch(Stage::Completion, &outcome);
        self.check_termination()
    }

    fn check_termination(&self) -> ParentNotice<V, E> {
        let outcome = {
            let mut state = self.lock();
            if !state.completion.is_done() || state.gate == GateStatus::Waiting {
                return None;
            }
            let outcome = state.response.clone()?;
            if !state.termination.open() {
                return None;
            }
            outcome
        };
        self.dispatch(Stage::Termination, &outcome);
        self.detach()
    }

    /// Leave the node table and return the parent to notify, if any.
    fn detach(&self) -> ParentNotice<V, E> {
        let table = self.table.upgrade()?;
        table.remove(&self.id);

        let parent_id = self.parent?;
        match table.get(&parent_id) {
            Some(parent) => Some((parent, self.id)),
            None => {
                warn!(node = %self.id, parent = %parent_id, "parent missing from node table");
                None
            }
        }
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    pub(crate) fn listen(&self, stage: Stage, listener: Listener<V, E>) {
        let ready = {
            let mut state = self.lock();
            let outcome = state.response.clone();
            match state.registry(stage).register(listener) {
                Registration::Queued => return,
                Registration::Ready(listener) => (listener, outcome),
            }
        };
        // A finished stage always has a response
        if let (listener, Some(outcome)) = ready {
            self.invoke(stage, listener, &outcome);
        }
    }

    fn dispatch(&self, stage: Stage, outcome: &Outcome<V, E>) {
        let mut fired = 0usize;
        loop {
            let next = self.lock().registry(stage).next();
            let Some(listener) = next else {
                break;
            };
            self.invoke(stage, listener, outcome);
            fired += 1;
        }
        debug!(node = %self.id, %stage, listeners = fired, "stage fired");
    }

    fn invoke(&self, stage: Stage, listener: Listener<V, E>, outcome: &Outcome<V, E>) {
        if let Err(panic_info) = catch_unwind(AssertUnwindSafe(|| listener(outcome))) {
            let panic_msg = extract_panic_message(&*panic_info);
            error!(node = %self.id, %stage, panic = %panic_msg, "listener panicked");
        }
    }
}

fn extract_panic_message(panic_info: &(dyn Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<V, E> std::fmt::Debug for CompletionNode<V, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionNode")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}
