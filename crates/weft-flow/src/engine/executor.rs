use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::config::{EngineConfig, FailurePolicy};
use weft_core::error::{Result, WeftError};
use weft_core::event::EventBus;
use weft_core::traits::{GenerationService, GraphView, NodeSpec};
use weft_core::types::{FlowEvent, NodeId, NodeRecord, NodeStatus, RunId};

use super::control::RunControl;
use crate::graph::validator::{self, DependencyGraph};

/// Separator placed between dependency outputs in a node's input.
pub const INPUT_SEPARATOR: &str = "\n\n";

/// Result of executing a single node.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub node_id: NodeId,
    /// Terminal record: status, output, error.
    pub record: NodeRecord,
    /// Time from task start to terminal status, in milliseconds.
    pub elapsed_ms: u64,
}

/// Result of executing an entire flow.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    /// Per-node results in graph order.
    pub results: Vec<NodeResult>,
    pub total_elapsed_ms: u64,
}

impl RunReport {
    pub fn get(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.results
            .iter()
            .find(|r| r.node_id == *id)
            .map(|r| &r.record)
    }

    pub fn completed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.record.status == NodeStatus::Complete)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.completed()
    }

    /// Whether every node completed.
    pub fn succeeded(&self) -> bool {
        self.failed() == 0
    }
}

/// Owned copy of the graph a run works on.
struct Snapshot {
    order: Vec<NodeId>,
    specs: HashMap<NodeId, NodeSpec>,
}

impl Snapshot {
    fn capture(view: &dyn GraphView) -> Self {
        let mut order = Vec::new();
        let mut specs = HashMap::new();
        for id in view.node_ids() {
            if let Some(spec) = view.node_spec(&id) {
                order.push(id.clone());
                specs.insert(id, spec);
            }
        }
        Self { order, specs }
    }
}

impl DependencyGraph for Snapshot {
    fn has_node(&self, id: &NodeId) -> bool {
        self.specs.contains_key(id)
    }

    fn dependencies_of(&self, id: &NodeId) -> Option<&[NodeId]> {
        self.specs.get(id).map(|s| s.depends_on.as_slice())
    }

    fn all_ids(&self) -> Vec<&NodeId> {
        self.order.iter().collect()
    }
}

/// Runs every node of a flow concurrently, each as soon as its
/// dependencies reach a terminal status.
///
/// Each node owns the sending half of a `watch` channel carrying its
/// [`NodeRecord`]; dependents hold receivers and wake when it settles.
pub struct FlowExecutor {
    service: Arc<dyn GenerationService>,
    event_bus: Arc<EventBus>,
    config: EngineConfig,
}

impl FlowExecutor {
    pub fn new(
        service: Arc<dyn GenerationService>,
        event_bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            service,
            event_bus,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Execute the flow once with a fresh cancellation scope.
    pub async fn run(&self, view: &dyn GraphView) -> Result<RunReport> {
        self.run_with_control(view, Arc::new(RunControl::new())).await
    }

    /// Execute the flow once under `control`.
    ///
    /// Fails only if the graph itself is invalid; generation failures are
    /// recorded on the nodes and never abort the run.
    pub async fn run_with_control(
        &self,
        view: &dyn GraphView,
        control: Arc<RunControl>,
    ) -> Result<RunReport> {
        let start = Instant::now();
        let run_id = RunId::new();
        let mut snapshot = Snapshot::capture(view);
        validator::check_integrity(&snapshot)?;

        let order = std::mem::take(&mut snapshot.order);
        info!(run_id = %run_id, nodes = order.len(), "Flow run started");
        self.event_bus.publish(FlowEvent::RunStarted {
            run_id: run_id.clone(),
            node_count: order.len(),
        });

        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for id in &order {
            let (tx, rx) = watch::channel(NodeRecord::default());
            senders.insert(id.clone(), tx);
            receivers.insert(id.clone(), rx);
            self.event_bus.publish(FlowEvent::NodeStatusChanged {
                run_id: run_id.clone(),
                node_id: id.clone(),
                status: NodeStatus::Idle,
                error: None,
            });
        }

        let permits = (self.config.max_concurrency > 0)
            .then(|| Arc::new(Semaphore::new(self.config.max_concurrency)));
        let timeout = (self.config.generation_timeout_secs > 0)
            .then(|| Duration::from_secs(self.config.generation_timeout_secs));

        let mut tasks = JoinSet::new();
        for id in &order {
            // Each sender is taken exactly once, so no node can start twice.
            let (Some(record), Some(spec)) = (senders.remove(id), snapshot.specs.remove(id)) else {
                continue;
            };
            let deps = spec
                .depends_on
                .iter()
                .filter_map(|d| receivers.get(d).map(|rx| (d.clone(), rx.clone())))
                .collect();

            let task = NodeTask {
                run_id: run_id.clone(),
                cancel: control.node_token(id),
                spec,
                deps,
                record,
                service: self.service.clone(),
                event_bus: self.event_bus.clone(),
                permits: permits.clone(),
                timeout,
                policy: self.config.failure_policy,
                streaming: self.config.streaming,
            };
            tasks.spawn(task.run());
        }

        let mut elapsed = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, ms)) => {
                    elapsed.insert(id, ms);
                }
                Err(e) => error!(run_id = %run_id, error = %e, "Node task aborted"),
            }
        }

        let results: Vec<NodeResult> = order
            .iter()
            .map(|id| {
                let mut record = receivers
                    .get(id)
                    .map(|rx| rx.borrow().clone())
                    .unwrap_or_default();
                if !record.status.is_terminal() {
                    record = NodeRecord::failed("node task ended unexpectedly");
                }
                NodeResult {
                    node_id: id.clone(),
                    record,
                    elapsed_ms: elapsed.get(id).copied().unwrap_or(0),
                }
            })
            .collect();

        let report = RunReport {
            run_id: run_id.clone(),
            results,
            total_elapsed_ms: start.elapsed().as_millis() as u64,
        };

        info!(
            run_id = %run_id,
            completed = report.completed(),
            failed = report.failed(),
            elapsed_ms = report.total_elapsed_ms,
            "Flow run finished"
        );
        self.event_bus.publish(FlowEvent::RunFinished {
            run_id,
            completed: report.completed(),
            failed: report.failed(),
            elapsed_ms: report.total_elapsed_ms,
        });

        Ok(report)
    }
}

/// Join dependency outputs in `depends_on` order. Errored dependencies
/// contribute an empty string.
pub fn compose_input(settled: &[NodeRecord]) -> String {
    settled
        .iter()
        .map(NodeRecord::contribution)
        .collect::<Vec<_>>()
        .join(INPUT_SEPARATOR)
}

/// Everything one node's task needs. Moved into the task on spawn.
struct NodeTask {
    run_id: RunId,
    spec: NodeSpec,
    deps: Vec<(NodeId, watch::Receiver<NodeRecord>)>,
    record: watch::Sender<NodeRecord>,
    service: Arc<dyn GenerationService>,
    event_bus: Arc<EventBus>,
    cancel: CancellationToken,
    permits: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
    policy: FailurePolicy,
    streaming: bool,
}

impl NodeTask {
    async fn run(self) -> (NodeId, u64) {
        let start = Instant::now();
        let record = self.settle().await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match record.status {
            NodeStatus::Complete => {
                debug!(node_id = %self.spec.id, elapsed_ms, "Node complete")
            }
            _ => warn!(
                node_id = %self.spec.id,
                elapsed_ms,
                error = record.error_message.as_deref().unwrap_or(""),
                "Node failed"
            ),
        }

        // Publish before waking dependents so events stay causally ordered.
        self.publish(record.status, record.error_message.clone());
        self.record.send_replace(record);
        (self.spec.id.clone(), elapsed_ms)
    }

    async fn settle(&self) -> NodeRecord {
        let input = if self.deps.is_empty() {
            self.spec.input.clone()
        } else {
            self.transition(NodeStatus::Waiting);
            let settled = tokio::select! {
                _ = self.cancel.cancelled() => return cancelled(),
                settled = self.wait_for_dependencies() => settled,
            };

            if settled.iter().all(|r| r.cancelled) {
                return cancelled();
            }
            if self.policy == FailurePolicy::Propagate {
                let failed = self
                    .deps
                    .iter()
                    .zip(&settled)
                    .find(|(_, r)| r.status == NodeStatus::Error);
                if let Some(((dep, _), _)) = failed {
                    let error = WeftError::DependencyFailed(dep.to_string());
                    return NodeRecord::failed(error.to_string());
                }
            }
            compose_input(&settled)
        };

        let _permit = match &self.permits {
            Some(permits) => tokio::select! {
                _ = self.cancel.cancelled() => return cancelled(),
                permit = permits.clone().acquire_owned() => permit.ok(),
            },
            None => None,
        };

        self.transition(NodeStatus::Running);
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(WeftError::Cancelled),
            result = with_timeout(self.timeout, self.generate(&input)) => result,
        };

        match outcome {
            Ok(text) => NodeRecord::complete(text),
            Err(WeftError::Cancelled) => cancelled(),
            Err(e) => NodeRecord::failed(e.to_string()),
        }
    }

    /// Resolve once every dependency is terminal, returning their records
    /// in `depends_on` order.
    async fn wait_for_dependencies(&self) -> Vec<NodeRecord> {
        join_all(self.deps.iter().map(|(_, rx)| {
            let mut rx = rx.clone();
            async move {
                let record = match rx.wait_for(|r| r.status.is_terminal()).await {
                    Ok(record) => record.clone(),
                    Err(_) => NodeRecord::failed("dependency task ended unexpectedly"),
                };
                record
            }
        }))
        .await
    }

    async fn generate(&self, input: &str) -> Result<String> {
        if !self.streaming {
            return self.service.generate(&self.spec.system_prompt, input).await;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let forward = async {
            while let Some(text) = rx.recv().await {
                self.event_bus.publish(FlowEvent::NodeChunk {
                    run_id: self.run_id.clone(),
                    node_id: self.spec.id.clone(),
                    text,
                });
            }
        };
        let (result, ()) = tokio::join!(
            self.service
                .generate_streaming(&self.spec.system_prompt, input, tx),
            forward
        );
        result
    }

    fn transition(&self, status: NodeStatus) {
        debug!(node_id = %self.spec.id, status = %status, "Node transition");
        self.record.send_replace(NodeRecord::with_status(status));
        self.publish(status, None);
    }

    fn publish(&self, status: NodeStatus, error: Option<String>) {
        self.event_bus.publish(FlowEvent::NodeStatusChanged {
            run_id: self.run_id.clone(),
            node_id: self.spec.id.clone(),
            status,
            error,
        });
    }
}

fn cancelled() -> NodeRecord {
    NodeRecord::cancelled(WeftError::Cancelled.to_string())
}

async fn with_timeout<F>(limit: Option<Duration>, call: F) -> Result<String>
where
    F: Future<Output = Result<String>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(WeftError::GenerationTimeout {
                secs: limit.as_secs(),
            })),
        None => call.await,
    }
}
