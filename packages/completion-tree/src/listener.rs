//! Per-stage listener registry.
//!
//! A registry lives inside a node's locked state and never runs callbacks
//! itself; it only decides *who* runs them and *when*:
//!
//! ```text
//! Pending ──open()──► Dispatching ──next() == None──► Done
//!   │                     │                            │
//!   register: queued      register: queued behind      register: caller
//!                         the running dispatch         runs it right away
//! ```
//!
//! The dispatching thread pops one listener at a time under the node lock
//! and runs it with the lock released. Anything registered meanwhile is
//! appended to the same queue, so registration order is dispatch order and
//! every listener is handed out exactly once.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Dispatching,
    Done,
}

/// Result of registering a listener.
pub(crate) enum Registration<L> {
    /// Queued; some dispatching thread will run it.
    Queued,
    /// The stage already finished; the registering caller must run it now.
    Ready(L),
}

pub(crate) struct ListenerRegistry<L> {
    phase: Phase,
    queue: VecDeque<L>,
}

impl<L> ListenerRegistry<L> {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::Pending,
            queue: VecDeque::new(),
        }
    }

    pub(crate) fn register(&mut self, listener: L) -> Registration<L> {
        match self.phase {
            Phase::Pending | Phase::Dispatching => {
                self.queue.push_back(listener);
                Registration::Queued
            }
            Phase::Done => Registration::Ready(listener),
        }
    }

    /// Claim the dispatch. Returns false if the stage was already claimed.
    pub(crate) fn open(&mut self) -> bool {
        if self.phase != Phase::Pending {
            return false;
        }
        self.phase = Phase::Dispatching;
        true
    }

    /// Next listener to run, or `None` once drained (which marks the stage done).
    pub(crate) fn next(&mut self) -> Option<L> {
        debug_assert_eq!(self.phase, Phase::Dispatching, "next() outside dispatch");
        let next = self.queue.pop_front();
        if next.is_none() {
            self.phase = Phase::Done;
        }
        next
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.phase == Phase::Pending
    }

    /// True once the stage fired and every queued listener was handed out.
    pub(crate) fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    /// True once the stage fired, even if listeners are still running.
    pub(crate) fn has_fired(&self) -> bool {
        self.phase != Phase::Pending
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(registry: &mut ListenerRegistry<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        while let Some(l) = registry.next() {
            out.push(l);
        }
        out
    }

    #[test]
    fn test_dispatch_preserves_registration_order() {
        let mut registry = ListenerRegistry::new();
        for i in 0..5 {
            assert!(matches!(registry.register(i), Registration::Queued));
        }
        assert_eq!(registry.len(), 5);

        assert!(registry.open());
        assert_eq!(drain(&mut registry), vec![0, 1, 2, 3, 4]);
        assert!(registry.is_done());
    }

    #[test]
    fn test_open_is_claimed_once() {
        let mut registry: ListenerRegistry<u32> = ListenerRegistry::new();
        assert!(registry.is_pending());
        assert!(registry.open());
        assert!(!registry.open());
        assert!(registry.has_fired());
        assert!(!registry.is_done());
    }

    #[test]
    fn test_registration_during_dispatch_is_queued_behind() {
        let mut registry = ListenerRegistry::new();
        registry.register(1);
        registry.open();

        assert_eq!(registry.next(), Some(1));
        // Registered while listener 1 runs
        assert!(matches!(registry.register(2), Registration::Queued));
        assert_eq!(registry.next(), Some(2));
        assert_eq!(registry.next(), None);
        assert!(registry.is_done());
    }

    #[test]
    fn test_late_registration_is_handed_back() {
        let mut registry = ListenerRegistry::new();
        registry.open();
        assert_eq!(registry.next(), None);

        match registry.register(9) {
            Registration::Ready(l) => assert_eq!(l, 9),
            Registration::Queued => panic!("Expected Ready after stage finished"),
        }
        assert_eq!(registry.len(), 0);
    }
}
