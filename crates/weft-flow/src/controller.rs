use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weft_core::config::EngineConfig;
use weft_core::error::{Result, WeftError};
use weft_core::event::EventBus;
use weft_core::traits::{GenerationService, PersistencePort};
use weft_core::types::{FlowEvent, NodeId};

use crate::engine::{FlowExecutor, RunControl, RunReport};
use crate::graph::{validator, FlowGraph, Validation};

/// Owns the flow graph and mediates every edit and run.
///
/// Edits are persisted through the [`PersistencePort`] as they happen. A run
/// works on a snapshot of the graph and its results are written back once it
/// settles.
pub struct FlowController {
    graph: RwLock<FlowGraph>,
    port: Arc<dyn PersistencePort>,
    executor: FlowExecutor,
    shutdown: CancellationToken,
    active: Mutex<Option<Arc<RunControl>>>,
}

impl FlowController {
    pub fn new(
        port: Arc<dyn PersistencePort>,
        service: Arc<dyn GenerationService>,
        event_bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            graph: RwLock::new(FlowGraph::new()),
            port,
            executor: FlowExecutor::new(service, event_bus, config),
            shutdown: CancellationToken::new(),
            active: Mutex::new(None),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, FlowGraph> {
        self.graph.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, FlowGraph> {
        self.graph.write().unwrap_or_else(|e| e.into_inner())
    }

    /// A copy of the current graph.
    pub fn graph(&self) -> FlowGraph {
        self.read().clone()
    }

    /// Inspect the graph without copying it.
    pub fn with_graph<R>(&self, f: impl FnOnce(&FlowGraph) -> R) -> R {
        f(&self.read())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.executor.event_bus().subscribe()
    }

    /// Replace the graph with the persisted one.
    ///
    /// A missing or unreadable document yields an empty graph.
    pub async fn load(&self) -> Result<()> {
        let graph = match self.port.load().await? {
            Some(text) => FlowGraph::deserialize(&text),
            None => {
                info!("No saved flow, starting empty");
                FlowGraph::new()
            }
        };
        info!(nodes = graph.len(), "Flow loaded");
        *self.write() = graph;
        Ok(())
    }

    pub async fn save(&self) -> Result<()> {
        let document = self.read().serialize();
        self.port.save(&document).await
    }

    /// Replace the graph wholesale, e.g. from an imported document.
    pub async fn replace_graph(&self, graph: FlowGraph) -> Result<()> {
        self.cancel_run();
        *self.write() = graph;
        self.save().await
    }

    pub async fn add_node(&self, x: f64, y: f64) -> Result<NodeId> {
        let id = self.write().add_node(x, y);
        self.save().await?;
        Ok(id)
    }

    /// Remove a node, cancelling it first if a run is executing it.
    pub async fn remove_node(&self, id: &NodeId) -> Result<()> {
        if let Some(control) = self.active_run() {
            if control.cancel_node(id) {
                info!(node_id = %id, "Cancelled removed node in active run");
            }
        }
        self.write()
            .remove_node(id)
            .ok_or_else(|| WeftError::NodeNotFound(id.to_string()))?;
        self.save().await
    }

    /// Check a proposed connection without applying it.
    pub fn validate(&self, source: &NodeId, target: &NodeId) -> Validation {
        validator::validate(&*self.read(), source, target)
    }

    /// Make `target` depend on `source`. On rejection the error's message
    /// is the reason and the graph is unchanged.
    pub async fn connect(&self, target: &NodeId, source: &NodeId) -> Result<()> {
        self.write().add_dependency(target, source)?;
        self.save().await
    }

    /// Remove `source -> target`. Returns whether the edge existed.
    pub async fn disconnect(&self, target: &NodeId, source: &NodeId) -> Result<bool> {
        let removed = self.write().remove_dependency(target, source);
        if removed {
            self.save().await?;
        }
        Ok(removed)
    }

    pub async fn set_system_prompt(&self, id: &NodeId, text: &str) -> Result<()> {
        self.write().set_system_prompt(id, text)?;
        self.save().await
    }

    pub async fn set_input(&self, id: &NodeId, text: &str) -> Result<()> {
        self.write().set_input(id, text)?;
        self.save().await
    }

    pub async fn set_position(&self, id: &NodeId, x: f64, y: f64) -> Result<()> {
        self.write().set_position(id, x, y)?;
        self.save().await
    }

    pub async fn set_size(&self, id: &NodeId, w: f64, h: f64) -> Result<()> {
        self.write().set_size(id, w, h)?;
        self.save().await
    }

    fn active_run(&self) -> Option<Arc<RunControl>> {
        self.active.lock().ok().and_then(|a| a.clone())
    }

    /// Cancel the run in progress, if any. The run still settles and its
    /// cancelled nodes are written back.
    pub fn cancel_run(&self) -> bool {
        match self.active_run() {
            Some(control) if !control.is_cancelled() => {
                control.cancel();
                info!("Flow run cancelled");
                true
            }
            _ => false,
        }
    }

    /// Run the whole flow, replacing any run already in progress.
    pub async fn run(&self) -> Result<RunReport> {
        let control = Arc::new(RunControl::child_of(&self.shutdown));
        let previous = self
            .active
            .lock()
            .ok()
            .and_then(|mut a| a.replace(control.clone()));
        if let Some(previous) = previous {
            previous.cancel();
            info!("Cancelled previous run");
        }

        let snapshot = {
            let mut graph = self.write();
            graph.reset_execution_state();
            graph.clone()
        };

        let outcome = self.executor.run_with_control(&snapshot, control.clone()).await;

        // A newer run owns the graph's execution state now.
        let still_active = match self.active.lock() {
            Ok(mut active) => {
                let current = active.as_ref().is_some_and(|c| Arc::ptr_eq(c, &control));
                if current {
                    *active = None;
                }
                current
            }
            Err(_) => false,
        };

        let report = outcome?;
        if !still_active {
            warn!(run_id = %report.run_id, "Run superseded, discarding its results");
            return Ok(report);
        }

        {
            let mut graph = self.write();
            for result in &report.results {
                graph.apply_record(&result.node_id, &result.record);
            }
        }
        self.save().await?;
        Ok(report)
    }

    /// Cancel the active run. Runs started afterwards are cancelled at once.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use weft_core::types::NodeStatus;
    use weft_store::MemoryStore;
    use weft_test_utils::MockGenerator;

    fn controller(mock: Arc<MockGenerator>, store: Arc<MemoryStore>) -> Arc<FlowController> {
        Arc::new(FlowController::new(
            store,
            mock,
            Arc::new(EventBus::default()),
            EngineConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_edits_are_persisted() {
        let store = Arc::new(MemoryStore::new());
        let ctl = controller(Arc::new(MockGenerator::echo()), store.clone());

        let a = ctl.add_node(0.0, 0.0).await.unwrap();
        let b = ctl.add_node(250.0, 0.0).await.unwrap();
        ctl.connect(&b, &a).await.unwrap();
        ctl.set_system_prompt(&a, "Write a haiku").await.unwrap();

        let saved = FlowGraph::deserialize(&store.contents().unwrap());
        assert_eq!(saved.len(), 2);
        assert_eq!(saved.get(&b).unwrap().depends_on, vec![a.clone()]);
        assert_eq!(saved.get(&a).unwrap().system_prompt, "Write a haiku");
    }

    #[tokio::test]
    async fn test_rejected_connect_reports_reason() {
        let store = Arc::new(MemoryStore::new());
        let ctl = controller(Arc::new(MockGenerator::echo()), store);

        let a = ctl.add_node(0.0, 0.0).await.unwrap();
        let b = ctl.add_node(0.0, 0.0).await.unwrap();
        ctl.connect(&b, &a).await.unwrap();

        let err = ctl.connect(&a, &b).await.unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("cycle"));
        assert!(!ctl.validate(&b, &a).is_valid);
        assert!(ctl.graph().get(&a).unwrap().depends_on.is_empty());
    }

    #[tokio::test]
    async fn test_load_missing_or_corrupt_is_empty() {
        let store = Arc::new(MemoryStore::with_contents("{not json"));
        let ctl = controller(Arc::new(MockGenerator::echo()), store);
        ctl.load().await.unwrap();
        assert!(ctl.graph().is_empty());

        let ctl = controller(Arc::new(MockGenerator::echo()), Arc::new(MemoryStore::new()));
        ctl.load().await.unwrap();
        assert!(ctl.graph().is_empty());
    }

    #[tokio::test]
    async fn test_run_writes_results_back_and_persists() {
        let store = Arc::new(MemoryStore::new());
        let ctl = controller(Arc::new(MockGenerator::tagged()), store.clone());

        let a = ctl.add_node(0.0, 0.0).await.unwrap();
        let b = ctl.add_node(0.0, 0.0).await.unwrap();
        ctl.set_system_prompt(&a, "up").await.unwrap();
        ctl.set_input(&a, "hi").await.unwrap();
        ctl.set_system_prompt(&b, "down").await.unwrap();
        ctl.connect(&b, &a).await.unwrap();

        let report = ctl.run().await.unwrap();
        assert!(report.succeeded());

        let graph = ctl.graph();
        assert_eq!(graph.get(&b).unwrap().output, "down(up(hi))");
        assert_eq!(graph.get(&b).unwrap().status, NodeStatus::Complete);

        let saved = FlowGraph::deserialize(&store.contents().unwrap());
        assert_eq!(saved.get(&b).unwrap().output, "down(up(hi))");
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_run_cancels_previous() {
        let mock = Arc::new(MockGenerator::tagged().delay_on("slow", Duration::from_secs(30)));
        let ctl = controller(mock.clone(), Arc::new(MemoryStore::new()));
        let a = ctl.add_node(0.0, 0.0).await.unwrap();
        ctl.set_system_prompt(&a, "slow").await.unwrap();

        let first = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.run().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = ctl.run().await.unwrap();

        let first = first.await.unwrap().unwrap();
        assert!(first.get(&a).unwrap().cancelled);
        assert_eq!(second.get(&a).unwrap().status, NodeStatus::Complete);
        assert_eq!(ctl.graph().get(&a).unwrap().status, NodeStatus::Complete);
        assert_eq!(mock.calls_for("slow"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removing_node_cancels_it_in_active_run() {
        let mock = Arc::new(MockGenerator::tagged().hang_on("stuck"));
        let ctl = controller(mock, Arc::new(MemoryStore::new()));
        let a = ctl.add_node(0.0, 0.0).await.unwrap();
        let b = ctl.add_node(0.0, 0.0).await.unwrap();
        ctl.set_system_prompt(&a, "stuck").await.unwrap();

        let run = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.run().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        ctl.remove_node(&a).await.unwrap();

        let report = run.await.unwrap().unwrap();
        assert!(report.get(&a).unwrap().cancelled);
        assert_eq!(report.get(&b).unwrap().status, NodeStatus::Complete);
        assert!(ctl.graph().get(&a).is_none());
        assert_eq!(ctl.graph().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_run() {
        let mock = Arc::new(MockGenerator::tagged().hang_on("stuck"));
        let ctl = controller(mock, Arc::new(MemoryStore::new()));
        let a = ctl.add_node(0.0, 0.0).await.unwrap();
        ctl.set_system_prompt(&a, "stuck").await.unwrap();

        assert!(!ctl.cancel_run());
        let run = tokio::spawn({
            let ctl = ctl.clone();
            async move { ctl.run().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(ctl.cancel_run());

        assert!(!ctl.cancel_run());

        let report = run.await.unwrap().unwrap();
        assert!(report.get(&a).unwrap().cancelled);
        let node = ctl.graph().get(&a).cloned().unwrap();
        assert_eq!(node.status, NodeStatus::Error);
        assert_eq!(node.error_message.as_deref(), Some("Run cancelled"));
    }
}
