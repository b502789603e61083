use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

use weft_core::types::NodeId;

/// Cancellation handles for one run.
///
/// Each node gets a child token of the run token, so cancelling the run
/// cancels every node while a single node can be cancelled on its own.
#[derive(Debug, Default)]
pub struct RunControl {
    cancel: CancellationToken,
    nodes: Mutex<HashMap<NodeId, CancellationToken>>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// A control that is also cancelled when `parent` is.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Cancel the whole run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel one node. Returns whether the node belongs to this run.
    ///
    /// A node cancelled before its task starts is still cancelled when it does.
    pub fn cancel_node(&self, id: &NodeId) -> bool {
        let Ok(mut nodes) = self.nodes.lock() else {
            return false;
        };
        let known = nodes.contains_key(id);
        nodes
            .entry(id.clone())
            .or_insert_with(|| self.cancel.child_token())
            .cancel();
        known
    }

    /// Whether `id` was registered with this run.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.lock().map(|n| n.contains_key(id)).unwrap_or(false)
    }

    /// The token a node's task watches.
    pub(crate) fn node_token(&self, id: &NodeId) -> CancellationToken {
        match self.nodes.lock() {
            Ok(mut nodes) => nodes
                .entry(id.clone())
                .or_insert_with(|| self.cancel.child_token())
                .clone(),
            Err(_) => self.cancel.child_token(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_cancel_reaches_every_node() {
        let control = RunControl::new();
        let a = control.node_token(&NodeId::from("a"));
        let b = control.node_token(&NodeId::from("b"));

        control.cancel();
        assert!(control.is_cancelled());
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[test]
    fn test_node_cancel_is_isolated() {
        let control = RunControl::new();
        let a = control.node_token(&NodeId::from("a"));
        let b = control.node_token(&NodeId::from("b"));

        assert!(control.cancel_node(&NodeId::from("a")));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!control.is_cancelled());
    }

    #[test]
    fn test_early_node_cancel_sticks() {
        let control = RunControl::new();
        assert!(!control.cancel_node(&NodeId::from("a")));
        assert!(control.node_token(&NodeId::from("a")).is_cancelled());
    }

    #[test]
    fn test_child_of_follows_parent() {
        let parent = CancellationToken::new();
        let control = RunControl::child_of(&parent);
        parent.cancel();
        assert!(control.is_cancelled());
    }
}
