use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::NodeId;

/// Text generation — the downstream service that produces each node's output.
pub trait GenerationService: Send + Sync + 'static {
    /// Generate a completion for `input` under `system_prompt`.
    fn generate(&self, system_prompt: &str, input: &str) -> BoxFuture<'_, Result<String>>;

    /// Generate while sending incremental chunks to `chunks`.
    ///
    /// Resolves to the full text. The default implementation calls
    /// [`generate`](Self::generate) and emits the whole result as one chunk.
    fn generate_streaming(
        &self,
        system_prompt: &str,
        input: &str,
        chunks: mpsc::UnboundedSender<String>,
    ) -> BoxFuture<'_, Result<String>> {
        let fut = self.generate(system_prompt, input);
        Box::pin(async move {
            let text = fut.await?;
            let _ = chunks.send(text.clone());
            Ok(text)
        })
    }
}

/// Persistence backend for the serialized flow document.
pub trait PersistencePort: Send + Sync + 'static {
    /// Load the last saved document, if any.
    fn load(&self) -> BoxFuture<'_, Result<Option<String>>>;

    /// Replace the saved document.
    fn save(&self, document: &str) -> BoxFuture<'_, Result<()>>;
}

/// The parts of a node the execution engine is allowed to see.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub id: NodeId,
    pub system_prompt: String,
    pub input: String,
    pub depends_on: Vec<NodeId>,
}

/// Read-only view of a flow graph.
///
/// The engine reads nodes through this and never sees layout fields or the
/// owning controller.
pub trait GraphView: Send + Sync {
    /// All node ids, in insertion order.
    fn node_ids(&self) -> Vec<NodeId>;

    /// Look up a node by id.
    fn node_spec(&self, id: &NodeId) -> Option<NodeSpec>;
}
