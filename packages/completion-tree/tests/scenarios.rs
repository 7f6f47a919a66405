//! End-to-end lifecycle scenarios against the public API.

use std::sync::{Arc, Mutex};

use completion_tree::{decouple, CompletionTree, ExternalGate, NodeFailure, NodeHandle};

type Tree = CompletionTree<String, NodeFailure>;
type Handle = NodeHandle<String, NodeFailure>;

/// Records which stages fired, and whether the node agreed at that moment.
#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn attach(&self, label: &'static str, node: &Handle) {
        let events = self.events.clone();
        node.on_response(move |outcome| {
            let value = outcome.value().cloned().unwrap_or_default();
            let has_error = outcome.error().is_some();
            events
                .lock()
                .unwrap()
                .push(format!("{label}:response({value},{has_error})"));
        });

        let events = self.events.clone();
        let watched = node.clone();
        node.on_complete(move |_| {
            let complete = watched.is_complete();
            events
                .lock()
                .unwrap()
                .push(format!("{label}:complete({complete})"));
        });

        let events = self.events.clone();
        let watched = node.clone();
        node.on_terminated(move |_| {
            let terminated = watched.is_terminated();
            events
                .lock()
                .unwrap()
                .push(format!("{label}:terminated({terminated})"));
        });
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

#[test]
fn test_childless_root_finishes_in_resolve_call() {
    let tree = Tree::new();
    let root = tree.create_root(tree.metadata(), None);
    let recorder = Recorder::default();
    recorder.attach("R", &root);

    root.resolve_success(Some("X".into())).unwrap();

    assert_eq!(
        recorder.take(),
        vec!["R:response(X,false)", "R:complete(true)", "R:terminated(true)"]
    );
    assert!(root.is_terminated());
}

#[test]
fn test_root_waits_for_its_child() {
    let tree = Tree::new();
    let root = tree.create_root(tree.metadata(), None);
    let child = root.create_child(None).unwrap();
    let recorder = Recorder::default();
    recorder.attach("R", &root);

    root.resolve_success(Some("event".into())).unwrap();
    assert_eq!(recorder.take(), vec!["R:response(event,false)"]);
    assert!(!root.is_complete());
    assert!(!root.is_terminated());

    child.resolve_success(Some("event".into())).unwrap();
    assert!(child.is_terminated());
    assert_eq!(recorder.take(), vec!["R:complete(true)", "R:terminated(true)"]);
}

#[test]
fn test_resolution_order_does_not_change_final_state() {
    fn build(tree: &Tree) -> (Handle, Handle, Handle) {
        let root = tree.create_root(tree.metadata(), None);
        let child = root.create_child(None).unwrap();
        let grandchild = child.create_child(None).unwrap();
        (root, child, grandchild)
    }

    // Leaves first
    let tree = Tree::new();
    let (root, child, grandchild) = build(&tree);
    grandchild.resolve_success(None).unwrap();
    assert!(!root.is_terminated());
    child.resolve_success(None).unwrap();
    assert!(!root.is_terminated());
    root.resolve_success(None).unwrap();
    let leaves_first = (root.status(), child.status(), grandchild.status());
    assert!(root.is_terminated());
    assert_eq!(tree.live_count(), 0);

    // Root first
    let tree = Tree::new();
    let (root, child, grandchild) = build(&tree);
    root.resolve_success(None).unwrap();
    assert!(!root.is_terminated());
    child.resolve_success(None).unwrap();
    assert!(!root.is_terminated());
    grandchild.resolve_success(None).unwrap();
    let root_first = (root.status(), child.status(), grandchild.status());
    assert!(root.is_terminated());
    assert_eq!(tree.live_count(), 0);

    assert_eq!(leaves_first, root_first);
}

#[test]
fn test_external_gate_holds_back_termination() {
    let tree = Tree::new();
    let (trigger, gate) = ExternalGate::pair();
    let root = tree.create_root(tree.metadata(), Some(gate));
    let recorder = Recorder::default();
    recorder.attach("R", &root);

    root.resolve_success(Some("event".into())).unwrap();
    assert_eq!(recorder.take(), vec!["R:response(event,false)", "R:complete(true)"]);
    assert!(!root.is_terminated());

    trigger.complete();
    assert_eq!(recorder.take(), vec!["R:terminated(true)"]);
}

#[test]
fn test_child_gate_holds_back_parent_completion() {
    let tree = Tree::new();
    let root = tree.create_root(tree.metadata(), None);
    let (trigger, gate) = ExternalGate::pair();
    let child = root.create_child(Some(gate)).unwrap();
    let recorder = Recorder::default();
    recorder.attach("R", &root);
    recorder.attach("C", &child);

    root.resolve_success(Some("event".into())).unwrap();
    child.resolve_success(Some("event".into())).unwrap();
    assert_eq!(
        recorder.take(),
        vec!["R:response(event,false)", "C:response(event,false)", "C:complete(true)"]
    );
    assert!(!child.is_terminated());
    assert!(!root.is_complete());

    trigger.complete();
    assert_eq!(
        recorder.take(),
        vec!["C:terminated(true)", "R:complete(true)", "R:terminated(true)"]
    );
    assert_eq!(tree.live_count(), 0);
}

#[test]
fn test_deserialized_root_ignores_original_children() {
    let tree = Tree::new();
    let root = tree.create_root(tree.metadata(), None);
    let child = root.create_child(None).unwrap();

    let bytes = root.serialize().unwrap();
    let restored: Handle = decouple::deserialize(&bytes).unwrap();
    let recorder = Recorder::default();
    recorder.attach("R'", &restored);

    restored.resolve_success(Some("event".into())).unwrap();
    assert_eq!(
        recorder.take(),
        vec![
            "R':response(event,false)",
            "R':complete(true)",
            "R':terminated(true)"
        ]
    );

    // The original child was never touched
    assert!(!child.is_response_done());
    assert!(!root.is_response_done());
    assert_eq!(tree.live_count(), 2);
}

#[tokio::test]
async fn test_future_gate_releases_after_flush() {
    let tree = Tree::new();
    let (flushed_tx, flushed_rx) = tokio::sync::oneshot::channel::<()>();
    let gate = ExternalGate::from_future(async move {
        let _ = flushed_rx.await;
    });
    let root = tree.create_root(tree.metadata(), Some(gate));

    root.resolve_error(NodeFailure::new("transport", "peer reset")).unwrap();
    let completed = root.completion().await;
    assert!(completed.is_error());
    assert!(!root.is_terminated());

    flushed_tx.send(()).unwrap();
    let terminated = root.termination().await;
    assert_eq!(terminated.error().map(|e| e.message.as_str()), Some("peer reset"));
}
