//! Execution Engine — the execute pipeline.
//!
//! Spawns one ephemeral worker per invocation against an already-built
//! environment's volume, marshals the JSON frame over stdio, and enforces
//! the effective timeout and resource caps.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant as StdInstant};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::builder::now_unix;
use crate::error::{CoreError, Result};
use crate::governor::Governor;
use crate::policy::{EnvDecision, Permissions};
use crate::runtime::{
    self, ContainerRuntime, Isolation, LineSink, MountMode, MountSpec, NetworkPolicy, OutputStream,
    WorkerSpec,
};
use crate::store::{Environment, EnvironmentStatus, Execution, RuntimeKind, Store};
use crate::worker::{ContextPayload, EventPayload, InputFrame, OutputFrame};

/// The exit code a worker's container is assigned when it is killed for
/// exceeding its deadline. Never produced by a cooperating worker.
pub const TIMEOUT_EXIT_CODE: i64 = 124;

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub execution_id: Uuid,
    /// 0 on a cooperating, successful handler; promoted to 1 if the handler
    /// threw but the worker nonetheless exited 0; 124 on timeout.
    pub exit_code: i64,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub duration_ms: i64,
}

pub struct ExecutionEngine {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<Store>,
    governor: Arc<Governor>,
    default_timeout_ms: u64,
    default_memory_mb: u64,
    max_timeout_ms: u64,
    max_memory_mb: u64,
    image_deno: String,
    image_node: String,
    isolation: Isolation,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<Store>,
        governor: Arc<Governor>,
        default_timeout_ms: u64,
        default_memory_mb: u64,
        max_timeout_ms: u64,
        max_memory_mb: u64,
        image_deno: String,
        image_node: String,
        isolation: Isolation,
    ) -> Self {
        Self {
            runtime,
            store,
            governor,
            default_timeout_ms,
            default_memory_mb,
            max_timeout_ms,
            max_memory_mb,
            image_deno,
            image_node,
            isolation,
        }
    }

    pub async fn execute(
        &self,
        environment_id: Uuid,
        req: ExecuteRequest,
        ctx: CancellationToken,
    ) -> Result<ExecuteOutcome> {
        let _permit = self
            .governor
            .admit_execution(&ctx)
            .await
            .map_err(|_| CoreError::Cancelled)?;
        let _in_flight = self.governor.enter_execution(environment_id);

        let env = {
            let envs = self.store.environments().await;
            envs.get(&environment_id)?
                .ok_or_else(|| CoreError::NotFound(format!("environment {environment_id} not found")))?
        };

        if env.status != EnvironmentStatus::Ready {
            return Err(CoreError::Validation(format!(
                "environment {environment_id} is not ready"
            )));
        }

        let permissions = parse_permissions(&env)?;
        let timeout_ms = req.timeout_ms.unwrap_or(self.default_timeout_ms).min(self.max_timeout_ms);
        let memory_mb = req.memory_mb.unwrap_or(self.default_memory_mb).min(self.max_memory_mb);

        let execution_id = Uuid::new_v4();
        let started_at = now_unix();
        let started_instant = StdInstant::now();

        let worker_env = match permissions.env_decision(&req.env) {
            EnvDecision::None => HashMap::new(),
            EnvDecision::Keys(keys) => keys
                .into_iter()
                .filter_map(|k| req.env.get(&k).cloned().map(|v| (k, v)))
                .collect(),
        };

        let input = InputFrame {
            event: EventPayload {
                data: req.data,
                env: worker_env.clone(),
            },
            context: ContextPayload {
                execution_id: execution_id.to_string(),
                environment_id: environment_id.to_string(),
                request_id: execution_id.to_string(),
            },
            main_module: env.main_module.clone(),
        };
        let stdin = serde_json::to_vec(&input).map_err(|e| CoreError::Internal(e.to_string()))?;

        let network = match permissions.network_allowance() {
            Some(_) => NetworkPolicy::Bridge,
            None => NetworkPolicy::None,
        };

        let image = match env.runtime {
            RuntimeKind::Deno => self.image_deno.clone(),
            RuntimeKind::Node => self.image_node.clone(),
        };

        let spec = WorkerSpec {
            image,
            mounts: vec![MountSpec {
                volume_name: env.volume_name.clone(),
                mount_path: "/workspace".to_string(),
                mode: MountMode::ReadOnly,
            }],
            network,
            memory_bytes: (memory_mb * 1024 * 1024) as i64,
            cpu_quota: 100_000,
            cpu_period: 100_000,
            pids_limit: 64,
            read_only_root: true,
            user: "1000:1000".to_string(),
            env: worker_env,
            isolation: self.isolation,
            entrypoint_override: None,
            args: Vec::new(),
            stdin,
            deadline: runtime::deadline_from_now(Duration::from_millis(timeout_ms)),
            working_dir: "/workspace".to_string(),
        };

        info!(%execution_id, %environment_id, timeout_ms, memory_mb, "starting execution");

        let sink = build_line_sink(environment_id, execution_id);
        let outcome = self.runtime.run_worker(spec, Some(sink), ctx).await;

        let duration_ms = started_instant.elapsed().as_millis() as i64;

        let worker_outcome = match outcome {
            Ok(worker_outcome) => worker_outcome,
            Err(e) => {
                warn!(%execution_id, error = %e, "worker run failed");
                return Err(CoreError::from(e));
            }
        };

        let (exit_code, stdout, stderr) = if worker_outcome.timed_out {
            (
                TIMEOUT_EXIT_CODE,
                None,
                Some("Execution timeout exceeded".to_string()),
            )
        } else {
            let raw_exit_code = worker_outcome.exit_code;
            match parse_output_frame(&worker_outcome.stdout) {
                Some(frame) if frame.success => {
                    let stdout = serde_json::to_string(&frame.result.unwrap_or(serde_json::Value::Null))
                        .map_err(|e| CoreError::Internal(e.to_string()))?;
                    (raw_exit_code, Some(stdout), Some(String::from_utf8_lossy(&worker_outcome.stderr).to_string()))
                }
                Some(frame) => {
                    // Exit code 0 ⇔ success:true — a handler that throws but
                    // exits 0 anyway is promoted to a failing exit code.
                    let exit_code = if raw_exit_code == 0 { 1 } else { raw_exit_code };
                    (exit_code, None, frame.error)
                }
                None => (
                    raw_exit_code,
                    Some(String::from_utf8_lossy(&worker_outcome.stdout).to_string()),
                    Some(String::from_utf8_lossy(&worker_outcome.stderr).to_string()),
                ),
            }
        };

        self.persist_execution(
            execution_id,
            environment_id,
            started_at,
            exit_code,
            stdout.clone(),
            stderr.clone(),
            duration_ms,
        );

        Ok(ExecuteOutcome {
            execution_id,
            exit_code,
            stdout,
            stderr,
            duration_ms,
        })
    }

    /// Best-effort bookkeeping: a failure here must never fail the caller's
    /// execution, which has already completed by the time this runs.
    fn persist_execution(
        &self,
        execution_id: Uuid,
        environment_id: Uuid,
        started_at: i64,
        exit_code: i64,
        stdout: Option<String>,
        stderr: Option<String>,
        duration_ms: i64,
    ) {
        let store = self.store.clone();
        let record = Execution {
            id: execution_id,
            environment_id,
            started_at,
            completed_at: Some(now_unix()),
            exit_code,
            stdout: stdout.unwrap_or_default(),
            stderr: stderr.unwrap_or_default(),
            duration_ms,
        };

        tokio::spawn(async move {
            let executions = store.executions().await;
            if let Err(e) = executions.insert(&record) {
                warn!(%execution_id, error = %e, "failed to persist execution record");
            }
            drop(executions);

            let envs = store.environments().await;
            if let Err(e) = envs.record_execution(&environment_id, now_unix()) {
                warn!(%environment_id, error = %e, "failed to bump environment execution counters");
            }
        });
    }
}

fn parse_permissions(env: &Environment) -> Result<Permissions> {
    let metadata: serde_json::Value =
        serde_json::from_str(&env.metadata).map_err(|e| CoreError::Internal(e.to_string()))?;
    let permissions = metadata
        .get("permissions")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| CoreError::Internal(e.to_string()))?
        .unwrap_or_else(default_permissions);
    Ok(permissions)
}

fn default_permissions() -> Permissions {
    crate::policy::PermissionsRequest::default().into()
}

/// The worker's stdout must be exactly one JSON object matching the output
/// contract. Anything else fails open rather than panicking the Engine.
fn parse_output_frame(stdout: &[u8]) -> Option<OutputFrame> {
    serde_json::from_slice(stdout).ok()
}

/// Partial chunks accumulated per stream until a newline completes a line.
struct LineBuffers {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

/// Builds a sink that logs every complete line a worker writes to stdout or
/// stderr as it arrives, rather than only after the worker has exited.
fn build_line_sink(environment_id: Uuid, execution_id: Uuid) -> LineSink {
    let buffers = Mutex::new(LineBuffers {
        stdout: Vec::new(),
        stderr: Vec::new(),
    });
    Box::new(move |stream: OutputStream, chunk: &[u8]| {
        let mut buffers = buffers.lock().unwrap();
        let buf = match stream {
            OutputStream::Stdout => &mut buffers.stdout,
            OutputStream::Stderr => &mut buffers.stderr,
        };
        buf.extend_from_slice(chunk);
        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.is_empty() {
                info!(
                    environment_id = %environment_id,
                    execution_id = %execution_id,
                    stream = ?stream,
                    output = %line,
                    "worker output"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_output_frame_accepts_success_shape() {
        let raw = br#"{"success":true,"result":{"ok":1}}"#;
        let frame = parse_output_frame(raw).unwrap();
        assert!(frame.success);
    }

    #[test]
    fn test_parse_output_frame_fails_open_on_garbage() {
        let raw = b"not json at all";
        assert!(parse_output_frame(raw).is_none());
    }

    #[test]
    fn test_default_permissions_deny_everything() {
        let perms = default_permissions();
        assert!(perms.network_allowance().is_none());
    }
}
