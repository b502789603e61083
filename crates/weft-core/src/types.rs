use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique node identifier, stable for the node's lifetime.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Unique identifier for a single execution of a flow.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution status of a node within a run.
///
/// `Complete` and `Error` are terminal: no further transition happens for
/// that node until the next run resets it.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Idle,
    Waiting,
    Running,
    Complete,
    Error,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-node execution state for one run.
///
/// During a run the record is written only by the node's own task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub status: NodeStatus,
    pub output: String,
    pub error_message: Option<String>,
    /// Set when the node ended because its run (or the node itself) was cancelled.
    #[serde(default)]
    pub cancelled: bool,
}

impl NodeRecord {
    pub fn with_status(status: NodeStatus) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    pub fn complete(output: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Complete,
            output: output.into(),
            error_message: None,
            cancelled: false,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Error,
            output: String::new(),
            error_message: Some(message.into()),
            cancelled: false,
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            cancelled: true,
            ..Self::failed(message)
        }
    }

    /// The text this node contributes to a dependent's input.
    /// Errored nodes contribute an empty string.
    pub fn contribution(&self) -> &str {
        match self.status {
            NodeStatus::Complete => &self.output,
            _ => "",
        }
    }
}

/// Event broadcast to all subscribers while a flow runs.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// A run started over `node_count` nodes.
    RunStarted { run_id: RunId, node_count: usize },
    /// A node changed status.
    NodeStatusChanged {
        run_id: RunId,
        node_id: NodeId,
        status: NodeStatus,
        error: Option<String>,
    },
    /// Incremental text from a streaming generation call.
    NodeChunk {
        run_id: RunId,
        node_id: NodeId,
        text: String,
    },
    /// Every node reached a terminal status.
    RunFinished {
        run_id: RunId,
        completed: usize,
        failed: usize,
        elapsed_ms: u64,
    },
}
