//! End-to-end coverage of Builder -> Engine -> Reaper against a fake
//! runtime adapter, since no real Docker daemon is assumed available here.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tee_core::builder::{EnvironmentBuilder, SetupRequest};
use tee_core::engine::{ExecuteRequest, ExecutionEngine};
use tee_core::governor::Governor;
use tee_core::reaper::Reaper;
use tee_core::runtime::{volume_name, ContainerRuntime, Isolation, LineSink, RuntimeResult, WorkerOutcome, WorkerSpec};
use tee_core::store::{Store, StoreResult};

/// One observed `run_worker` invocation, recorded for assertions that no
/// untrusted content ever reaches a process argument.
struct RecordedCall {
    entrypoint_override: Option<Vec<String>>,
    args: Vec<String>,
    stdin: Vec<u8>,
}

/// Scriptable [`ContainerRuntime`] double: volumes live in a `HashSet`,
/// `run_worker` outcomes are consumed off a FIFO queue, defaulting to a
/// trivial success once the queue runs dry (covers the Builder's helper
/// containers, which tests don't usually bother scripting).
struct FakeRuntime {
    volumes: Mutex<HashSet<String>>,
    responses: Mutex<VecDeque<RuntimeResult<WorkerOutcome>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeRuntime {
    fn new() -> Self {
        Self {
            volumes: Mutex::new(HashSet::new()),
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn push_response(&self, outcome: RuntimeResult<WorkerOutcome>) {
        self.responses.lock().unwrap().push_back(outcome);
    }

    fn seed_volume(&self, name: &str) {
        self.volumes.lock().unwrap().insert(name.to_string());
    }

    fn has_volume(&self, name: &str) -> bool {
        self.volumes.lock().unwrap().contains(name)
    }
}

fn ok_outcome() -> WorkerOutcome {
    WorkerOutcome {
        exit_code: 0,
        timed_out: false,
        stdout: Vec::new(),
        stderr: Vec::new(),
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_volume(&self, name: &str) -> RuntimeResult<()> {
        self.volumes.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> RuntimeResult<()> {
        self.volumes.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list_volumes(&self) -> RuntimeResult<Vec<String>> {
        Ok(self.volumes.lock().unwrap().iter().cloned().collect())
    }

    async fn run_worker(
        &self,
        spec: WorkerSpec,
        _sink: Option<LineSink>,
        _ctx: CancellationToken,
    ) -> RuntimeResult<WorkerOutcome> {
        self.calls.lock().unwrap().push(RecordedCall {
            entrypoint_override: spec.entrypoint_override.clone(),
            args: spec.args.clone(),
            stdin: spec.stdin.clone(),
        });

        match self.responses.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(ok_outcome()),
        }
    }
}

fn single_module_request(main_module: &str, content: &str) -> SetupRequest {
    let mut modules = HashMap::new();
    modules.insert(main_module.to_string(), content.to_string());
    SetupRequest {
        main_module: main_module.to_string(),
        modules,
        dependencies: None,
        permissions: None,
        ttl_seconds: None,
        runtime: None,
    }
}

struct Harness {
    runtime: Arc<FakeRuntime>,
    store: Arc<Store>,
    builder: EnvironmentBuilder,
    engine: ExecutionEngine,
}

fn harness() -> StoreResult<Harness> {
    let runtime = Arc::new(FakeRuntime::new());
    let store = Arc::new(Store::open_in_memory()?);
    let governor = Arc::new(Governor::new(4, 4));
    let runtime_dyn: Arc<dyn ContainerRuntime> = runtime.clone();

    let builder = EnvironmentBuilder::new(
        runtime_dyn.clone(),
        store.clone(),
        governor.clone(),
        "deno:distroless".to_string(),
        "node:slim".to_string(),
        Isolation::Hard,
    );

    let engine = ExecutionEngine::new(
        runtime_dyn,
        store.clone(),
        governor,
        5_000,
        128,
        30_000,
        512,
        "deno:distroless".to_string(),
        "node:slim".to_string(),
        Isolation::Hard,
    );

    Ok(Harness {
        runtime,
        store,
        builder,
        engine,
    })
}

#[tokio::test]
async fn happy_path_parses_result_and_preserves_exit_code() {
    let h = harness().unwrap();

    let env = h
        .builder
        .setup(
            single_module_request("main.ts", "export function handler() {}"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    h.runtime.push_response(Ok(WorkerOutcome {
        exit_code: 0,
        timed_out: false,
        stdout: br#"{"success":true,"result":{"sum":8}}"#.to_vec(),
        stderr: Vec::new(),
    }));

    let req = ExecuteRequest {
        data: serde_json::json!({"a": 5, "b": 3}),
        env: HashMap::new(),
        timeout_ms: None,
        memory_mb: None,
    };
    let outcome = h.engine.execute(env.id, req, CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.stdout.as_deref(), Some("{\"sum\":8}"));
}

#[tokio::test]
async fn reusing_an_environment_bumps_its_execution_count() {
    let h = harness().unwrap();

    let env = h
        .builder
        .setup(
            single_module_request("main.ts", "export function handler() {}"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    for _ in 0..2 {
        h.runtime.push_response(Ok(WorkerOutcome {
            exit_code: 0,
            timed_out: false,
            stdout: br#"{"success":true,"result":null}"#.to_vec(),
            stderr: Vec::new(),
        }));
        let req = ExecuteRequest {
            data: serde_json::Value::Null,
            env: HashMap::new(),
            timeout_ms: None,
            memory_mb: None,
        };
        h.engine.execute(env.id, req, CancellationToken::new()).await.unwrap();
    }

    // persist_execution bumps the counter on a spawned task; give it a tick.
    tokio::task::yield_now().await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let envs = h.store.environments().await;
    let reloaded = envs.get(&env.id).unwrap().unwrap();
    assert_eq!(reloaded.execution_count, 2);
}

#[tokio::test]
async fn timeout_reports_exit_code_124_with_no_stdout() {
    let h = harness().unwrap();

    let env = h
        .builder
        .setup(
            single_module_request("main.ts", "export function handler() {}"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    h.runtime.push_response(Ok(WorkerOutcome {
        exit_code: -1,
        timed_out: true,
        stdout: Vec::new(),
        stderr: Vec::new(),
    }));

    let req = ExecuteRequest {
        data: serde_json::Value::Null,
        env: HashMap::new(),
        timeout_ms: Some(10),
        memory_mb: None,
    };
    let outcome = h.engine.execute(env.id, req, CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.exit_code, 124);
    assert_eq!(outcome.stdout, None);
    assert_eq!(outcome.stderr.as_deref(), Some("Execution timeout exceeded"));
}

#[tokio::test]
async fn handler_throw_with_exit_zero_is_promoted_to_exit_one() {
    let h = harness().unwrap();

    let env = h
        .builder
        .setup(
            single_module_request("main.ts", "export function handler() {}"),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    h.runtime.push_response(Ok(WorkerOutcome {
        exit_code: 0,
        timed_out: false,
        stdout: br#"{"success":false,"error":"nope"}"#.to_vec(),
        stderr: Vec::new(),
    }));

    let req = ExecuteRequest {
        data: serde_json::Value::Null,
        env: HashMap::new(),
        timeout_ms: None,
        memory_mb: None,
    };
    let outcome = h.engine.execute(env.id, req, CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.exit_code, 1);
    assert!(outcome.stderr.unwrap().contains("nope"));
}

#[tokio::test]
async fn module_content_with_shell_metacharacters_never_reaches_an_argument() {
    let h = harness().unwrap();
    let payload = "\"; rm -rf /; echo \"pwned";

    let env = h
        .builder
        .setup(single_module_request("main.ts", payload), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(env.main_module, "main.ts");

    let calls = h.runtime.calls.lock().unwrap();
    for call in calls.iter() {
        assert!(
            call.entrypoint_override
                .as_ref()
                .map(|e| !e.iter().any(|a| a.contains("rm -rf")))
                .unwrap_or(true)
        );
        assert!(!call.args.iter().any(|a| a.contains("rm -rf")));
    }
    // The payload is only ever carried as stdin bytes to the writer helper.
    assert!(calls.iter().any(|c| c.stdin.windows(payload.len()).any(|w| w == payload.as_bytes())));
}

#[tokio::test]
async fn reconcile_removes_orphan_volumes_and_orphan_records() {
    let h = harness().unwrap();

    // Orphan volume: present on the backend, no store row.
    let orphan_volume = volume_name(&Uuid::new_v4());
    h.runtime.seed_volume(&orphan_volume);

    // Orphan record: present in the store, no backing volume.
    let orphan_env_id = Uuid::new_v4();
    let orphan_volume_name = volume_name(&orphan_env_id);
    {
        let envs = h.store.environments().await;
        envs.insert(&tee_core::store::Environment {
            id: orphan_env_id,
            volume_name: orphan_volume_name,
            main_module: "main.ts".to_string(),
            runtime: tee_core::store::RuntimeKind::Deno,
            created_at: 0,
            last_executed_at: None,
            execution_count: 0,
            status: tee_core::store::EnvironmentStatus::Ready,
            metadata: "{}".to_string(),
            ttl_seconds: 3600,
        })
        .unwrap();
    }

    let runtime_dyn: Arc<dyn ContainerRuntime> = h.runtime.clone();
    let reaper = Reaper::new(runtime_dyn, h.store.clone(), Arc::new(Governor::new(4, 4)));
    reaper.reconcile().await;

    assert!(!h.runtime.has_volume(&orphan_volume));

    let envs = h.store.environments().await;
    assert!(envs.get(&orphan_env_id).unwrap().is_none());
}
