//! Flow execution: one task per node, coordinated by `watch` channels.
//!
//! A node starts generating once every node it depends on has reached a
//! terminal status. Root nodes start immediately and disconnected parts of
//! the graph run in parallel.

pub mod control;
pub mod executor;

pub use control::RunControl;
pub use executor::{compose_input, FlowExecutor, NodeResult, RunReport, INPUT_SEPARATOR};
