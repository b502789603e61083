//! The flow graph: prompt nodes, their dependency edges, and the checks that
//! keep the graph acyclic.

pub mod model;
pub mod node;
pub mod validator;

pub use model::FlowGraph;
pub use node::Node;
pub use validator::{validate, Validation};
