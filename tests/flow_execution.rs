use std::sync::Arc;
use std::time::Duration;

use weft_core::config::{EngineConfig, FailurePolicy};
use weft_core::event::EventBus;
use weft_core::traits::PersistencePort;
use weft_core::types::{FlowEvent, NodeId, NodeStatus};
use weft_flow::{FlowController, FlowGraph};
use weft_store::SqliteStore;
use weft_test_utils::{drain_events, MockGenerator};

fn controller(
    store: Arc<SqliteStore>,
    mock: Arc<MockGenerator>,
    config: EngineConfig,
) -> Arc<FlowController> {
    Arc::new(FlowController::new(
        store,
        mock,
        Arc::new(EventBus::default()),
        config,
    ))
}

/// Builds research -> (summary, critique) -> report. System prompts double as names.
async fn build_diamond(ctl: &FlowController) -> [NodeId; 4] {
    let research = ctl.add_node(0.0, 0.0).await.unwrap();
    let summary = ctl.add_node(250.0, 0.0).await.unwrap();
    let critique = ctl.add_node(250.0, 300.0).await.unwrap();
    let report = ctl.add_node(500.0, 150.0).await.unwrap();

    for (id, name) in [
        (&research, "research"),
        (&summary, "summary"),
        (&critique, "critique"),
        (&report, "report"),
    ] {
        ctl.set_system_prompt(id, name).await.unwrap();
    }
    ctl.set_input(&research, "tides").await.unwrap();

    ctl.connect(&summary, &research).await.unwrap();
    ctl.connect(&critique, &research).await.unwrap();
    ctl.connect(&report, &summary).await.unwrap();
    ctl.connect(&report, &critique).await.unwrap();

    [research, summary, critique, report]
}

#[tokio::test]
async fn test_flow_persists_and_reloads_from_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("flows.db");

    let ids = {
        let store = Arc::new(SqliteStore::open(&db, "flow-data").unwrap());
        let ctl = controller(store, Arc::new(MockGenerator::tagged()), EngineConfig::default());
        let ids = build_diamond(&ctl).await;
        ctl.run().await.unwrap();
        ids
    };

    let store = Arc::new(SqliteStore::open(&db, "flow-data").unwrap());
    let ctl = controller(store, Arc::new(MockGenerator::tagged()), EngineConfig::default());
    ctl.load().await.unwrap();

    let graph = ctl.graph();
    let order: Vec<NodeId> = graph.nodes().map(|n| n.id.clone()).collect();
    assert_eq!(order, ids.to_vec());
    let report = graph.get(&ids[3]).unwrap();
    assert_eq!(report.depends_on, vec![ids[1].clone(), ids[2].clone()]);
    assert_eq!(report.system_prompt, "report");
    assert_eq!(
        report.output,
        "report(summary(research(tides))\n\ncritique(research(tides)))"
    );
    // Status is not persisted
    assert_eq!(report.status, NodeStatus::Idle);
}

#[tokio::test]
async fn test_each_node_generates_once_in_dependency_order() {
    let store = Arc::new(SqliteStore::in_memory("flow-data").unwrap());
    let mock = Arc::new(MockGenerator::tagged().with_delay(Duration::from_millis(5)));
    let ctl = controller(store, mock.clone(), EngineConfig::default());
    let [research, summary, critique, report] = build_diamond(&ctl).await;

    let mut rx = ctl.subscribe();
    let result = ctl.run().await.unwrap();
    assert!(result.succeeded());
    assert_eq!(mock.total_calls(), 4);

    let events = drain_events(&mut rx);
    let completed: Vec<NodeId> = events
        .iter()
        .filter_map(|e| match e {
            FlowEvent::NodeStatusChanged {
                node_id,
                status: NodeStatus::Complete,
                ..
            } => Some(node_id.clone()),
            _ => None,
        })
        .collect();
    let pos = |id: &NodeId| completed.iter().position(|c| c == id).unwrap();

    assert_eq!(completed.len(), 4);
    assert!(pos(&research) < pos(&summary));
    assert!(pos(&research) < pos(&critique));
    assert!(pos(&summary) < pos(&report));
    assert!(pos(&critique) < pos(&report));
}

#[tokio::test]
async fn test_partial_failure_is_tolerated_and_saved() {
    let store = Arc::new(SqliteStore::in_memory("flow-data").unwrap());
    let mock = Arc::new(MockGenerator::tagged().fail_on("summary", "HTTP 429: rate limited"));
    let ctl = controller(store.clone(), mock.clone(), EngineConfig::default());
    let [_, summary, _, report] = build_diamond(&ctl).await;

    let result = ctl.run().await.unwrap();
    assert_eq!(result.failed(), 1);

    assert_eq!(
        mock.input_for("report").as_deref(),
        Some("\n\ncritique(research(tides))")
    );

    let graph = ctl.graph();
    let failed = graph.get(&summary).unwrap();
    assert_eq!(failed.status, NodeStatus::Error);
    assert!(failed.error_message.as_deref().unwrap().contains("429"));
    assert_eq!(graph.get(&report).unwrap().status, NodeStatus::Complete);

    let saved = FlowGraph::deserialize(&store.load().await.unwrap().unwrap());
    assert!(saved.get(&summary).unwrap().output.is_empty());
    assert!(!saved.get(&report).unwrap().output.is_empty());
}

#[tokio::test]
async fn test_propagate_policy_end_to_end() {
    let store = Arc::new(SqliteStore::in_memory("flow-data").unwrap());
    let mock = Arc::new(MockGenerator::tagged().fail_on("research", "boom"));
    let config = EngineConfig {
        failure_policy: FailurePolicy::Propagate,
        ..EngineConfig::default()
    };
    let ctl = controller(store, mock.clone(), config);
    build_diamond(&ctl).await;

    let result = ctl.run().await.unwrap();
    assert_eq!(result.completed(), 0);
    assert_eq!(mock.total_calls(), 1);
}

#[tokio::test]
async fn test_rerun_resets_previous_results() {
    let store = Arc::new(SqliteStore::in_memory("flow-data").unwrap());
    let ctl = controller(store, Arc::new(MockGenerator::tagged()), EngineConfig::default());
    let [research, summary, ..] = build_diamond(&ctl).await;

    ctl.run().await.unwrap();
    ctl.set_input(&research, "moons").await.unwrap();
    ctl.run().await.unwrap();

    assert_eq!(
        ctl.graph().get(&summary).unwrap().output,
        "summary(research(moons))"
    );
}

#[tokio::test]
async fn test_removing_node_strips_edges_before_next_run() {
    let store = Arc::new(SqliteStore::in_memory("flow-data").unwrap());
    let mock = Arc::new(MockGenerator::tagged());
    let ctl = controller(store, mock.clone(), EngineConfig::default());
    let [_, summary, _, report] = build_diamond(&ctl).await;

    ctl.remove_node(&summary).await.unwrap();
    ctl.run().await.unwrap();

    assert_eq!(ctl.graph().len(), 3);
    assert_eq!(
        mock.input_for("report").as_deref(),
        Some("critique(research(tides))")
    );
    assert_eq!(ctl.graph().get(&report).unwrap().depends_on.len(), 1);
}
