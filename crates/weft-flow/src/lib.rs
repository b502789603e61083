//! Prompt-flow core: the node graph, connection validation, and the
//! concurrent executor that runs every node once its dependencies settle.

pub mod controller;
pub mod engine;
pub mod graph;

pub use controller::FlowController;
pub use engine::{FlowExecutor, NodeResult, RunControl, RunReport};
pub use graph::{FlowGraph, Node, Validation};
