use serde::{Deserialize, Serialize};

use weft_core::traits::NodeSpec;
use weft_core::types::{NodeId, NodeRecord, NodeStatus};

pub const DEFAULT_X: f64 = 100.0;
pub const DEFAULT_Y: f64 = 100.0;
pub const DEFAULT_WIDTH: f64 = 200.0;
pub const DEFAULT_HEIGHT: f64 = 230.0;

/// A prompt node in the flow graph.
///
/// A node with no dependencies sends its own `input` to the generation
/// service; any other node sends the concatenated outputs of the nodes it
/// depends on, in `depends_on` order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique identifier for this node.
    pub id: NodeId,
    #[serde(default = "default_x")]
    pub x: f64,
    #[serde(default = "default_y")]
    pub y: f64,
    #[serde(default = "default_width")]
    pub w: f64,
    #[serde(default = "default_height")]
    pub h: f64,
    /// System instruction for this node's generation call.
    #[serde(default)]
    pub system_prompt: String,
    /// Input text, used only when the node has no dependencies.
    #[serde(default)]
    pub input: String,
    /// Nodes whose outputs feed this one, in concatenation order.
    #[serde(default)]
    pub depends_on: Vec<NodeId>,
    /// Last successful output.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(skip)]
    pub status: NodeStatus,
    #[serde(skip)]
    pub error_message: Option<String>,
}

fn default_x() -> f64 { DEFAULT_X }
fn default_y() -> f64 { DEFAULT_Y }
fn default_width() -> f64 { DEFAULT_WIDTH }
fn default_height() -> f64 { DEFAULT_HEIGHT }

impl Node {
    /// Create a node with default size, empty prompts, and no dependencies.
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            x: DEFAULT_X,
            y: DEFAULT_Y,
            w: DEFAULT_WIDTH,
            h: DEFAULT_HEIGHT,
            system_prompt: String::new(),
            input: String::new(),
            depends_on: vec![],
            output: String::new(),
            status: NodeStatus::Idle,
            error_message: None,
        }
    }

    /// Set the position.
    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.x = x;
        self.y = y;
        self
    }

    /// Set the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Set the input text.
    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = input.into();
        self
    }

    /// Set the dependencies. They are checked when the node is inserted.
    pub fn depending_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<NodeId>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_root(&self) -> bool {
        self.depends_on.is_empty()
    }

    /// The engine-facing projection of this node.
    pub fn spec(&self) -> NodeSpec {
        NodeSpec {
            id: self.id.clone(),
            system_prompt: self.system_prompt.clone(),
            input: self.input.clone(),
            depends_on: self.depends_on.clone(),
        }
    }

    /// Clear status, output, and error.
    pub fn reset_execution_state(&mut self) {
        self.status = NodeStatus::Idle;
        self.output.clear();
        self.error_message = None;
    }

    /// Copy a run's terminal record onto this node.
    pub fn apply_record(&mut self, record: &NodeRecord) {
        self.status = record.status;
        self.output = record.output.clone();
        self.error_message = record.error_message.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_builder() {
        let node = Node::new("n1")
            .at(10.0, 20.0)
            .with_system_prompt("You are a summarizer.")
            .with_input("Some text")
            .depending_on(["a", "b"]);

        assert_eq!(node.id, NodeId::from("n1"));
        assert_eq!((node.x, node.y), (10.0, 20.0));
        assert_eq!((node.w, node.h), (DEFAULT_WIDTH, DEFAULT_HEIGHT));
        assert_eq!(node.system_prompt, "You are a summarizer.");
        assert_eq!(node.depends_on, vec![NodeId::from("a"), NodeId::from("b")]);
        assert!(!node.is_root());
        assert_eq!(node.status, NodeStatus::Idle);
    }

    #[test]
    fn test_serialized_field_names() {
        let node = Node::new("n1")
            .with_system_prompt("sys")
            .depending_on(["a"]);
        let json = serde_json::to_value(&node).unwrap();

        assert_eq!(json["systemPrompt"], "sys");
        assert_eq!(json["dependsOn"][0], "a");
        assert_eq!(json["w"], 200.0);
        assert!(json.get("output").is_none());
        assert!(json.get("status").is_none());
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let node: Node = serde_json::from_str(r#"{"id":"n1"}"#).unwrap();
        assert_eq!(node.h, DEFAULT_HEIGHT);
        assert!(node.depends_on.is_empty());
        assert!(node.system_prompt.is_empty());
    }

    #[test]
    fn test_apply_and_reset_record() {
        let mut node = Node::new("n1");
        node.apply_record(&NodeRecord::failed("quota exceeded"));
        assert_eq!(node.status, NodeStatus::Error);
        assert_eq!(node.error_message.as_deref(), Some("quota exceeded"));

        node.apply_record(&NodeRecord::complete("done"));
        assert_eq!(node.output, "done");
        node.reset_execution_state();
        assert_eq!(node.status, NodeStatus::Idle);
        assert!(node.output.is_empty());
        assert!(node.error_message.is_none());
    }
}
