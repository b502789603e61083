use weft_core::config::AppConfig;
use weft_core::traits::PersistencePort;
use weft_flow::FlowGraph;
use weft_llm::providers::catalog;
use weft_store::SqliteStore;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

impl CheckResult {
    fn ok(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: false,
            detail: detail.into(),
        }
    }
}

/// Print health checks for the configuration and the stored flow.
/// Returns the number of failed checks.
pub async fn run_doctor(config: &AppConfig, flow_key: &str) -> usize {
    let checks = vec![
        check_api_key(config),
        check_workspace(config),
        check_engine(config),
        check_flow(config, flow_key).await,
    ];

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
    fail_count
}

fn check_api_key(config: &AppConfig) -> CheckResult {
    let provider = &config.model.provider;
    let configured = config
        .model
        .api_key
        .as_deref()
        .filter(|k| !k.starts_with("${"));

    let ok = match catalog::lookup(provider) {
        Some(known) => !known.needs_api_key() || known.resolve_api_key(configured).is_some(),
        None => configured.is_some_and(|k| !k.is_empty()),
    };

    if ok {
        CheckResult::ok(
            "API Key",
            format!("Configured for {} ({})", config.model.model_id, provider),
        )
    } else {
        CheckResult::fail("API Key", format!("No API key set for provider '{}'", provider))
    }
}

fn check_workspace(config: &AppConfig) -> CheckResult {
    let ws = config.workspace_dir();
    if !ws.is_dir() {
        return CheckResult::fail("Workspace", format!("{} (does not exist)", ws.display()));
    }

    let test_file = ws.join(".doctor_test");
    match std::fs::write(&test_file, "test") {
        Ok(_) => {
            std::fs::remove_file(&test_file).ok();
            CheckResult::ok("Workspace", ws.display().to_string())
        }
        Err(e) => CheckResult::fail(
            "Workspace",
            format!("{} (not writable: {})", ws.display(), e),
        ),
    }
}

fn check_engine(config: &AppConfig) -> CheckResult {
    let engine = &config.engine;
    let timeout = match engine.generation_timeout_secs {
        0 => "no timeout".to_string(),
        secs => format!("{}s timeout", secs),
    };
    let concurrency = match engine.max_concurrency {
        0 => "unbounded".to_string(),
        n => format!("at most {} calls", n),
    };
    CheckResult::ok(
        "Engine",
        format!("{}, {}, {:?} on failure", timeout, concurrency, engine.failure_policy),
    )
}

async fn check_flow(config: &AppConfig, flow_key: &str) -> CheckResult {
    let db_path = config.db_path();
    let store = match SqliteStore::open(&db_path, flow_key) {
        Ok(store) => store,
        Err(e) => return CheckResult::fail("Flow", format!("{}: {}", db_path.display(), e)),
    };

    match store.load().await {
        Ok(None) => CheckResult::ok("Flow", format!("'{}' not saved yet", flow_key)),
        Ok(Some(text)) => match FlowGraph::try_deserialize(&text) {
            Ok(graph) => CheckResult::ok(
                "Flow",
                format!(
                    "'{}': {} nodes, {} edges",
                    flow_key,
                    graph.len(),
                    graph.edges().len()
                ),
            ),
            Err(e) => CheckResult::fail("Flow", format!("'{}' is unreadable: {}", flow_key, e)),
        },
        Err(e) => CheckResult::fail("Flow", e.to_string()),
    }
}
