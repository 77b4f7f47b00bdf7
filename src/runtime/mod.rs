//! Container Runtime Adapter
//!
//! Abstract interface over an external isolation backend. The rest of the
//! core (Builder, Engine, Reaper) depends only on [`ContainerRuntime`]; the
//! `docker` submodule is the one concrete adapter shipped here.

mod docker;

pub use docker::DockerRuntime;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Errors produced by a [`ContainerRuntime`] implementation.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("volume not found: {0}")]
    VolumeNotFound(String),

    #[error("image pull failed: {0}")]
    ImagePull(String),

    #[error("attach failed: {0}")]
    AttachFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Reserved prefix for volumes owned by this service. Anything on the
/// backend carrying this prefix with no matching Store row is an orphan.
pub const VOLUME_PREFIX: &str = "tee-env-";

pub fn volume_name(environment_id: &uuid::Uuid) -> String {
    format!("{VOLUME_PREFIX}{environment_id}")
}

/// Mount access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

/// A single volume mount for a worker.
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub volume_name: String,
    pub mount_path: String,
    pub mode: MountMode,
}

/// Network posture for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkPolicy {
    None,
    Bridge,
}

/// Kernel isolation posture. `Relaxed` is for local development only; the
/// adapter must warn whenever it is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    Hard,
    Relaxed,
}

/// A single line of output observed from a worker, tagged by stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Sink for streamed worker output. Invoked once per observed line.
pub type LineSink = Box<dyn Fn(OutputStream, &[u8]) + Send + Sync>;

/// Full specification of a disposable worker process.
pub struct WorkerSpec {
    pub image: String,
    pub mounts: Vec<MountSpec>,
    pub network: NetworkPolicy,
    pub memory_bytes: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub pids_limit: i64,
    pub read_only_root: bool,
    pub user: String,
    pub env: HashMap<String, String>,
    pub isolation: Isolation,
    pub entrypoint_override: Option<Vec<String>>,
    pub args: Vec<String>,
    pub stdin: Vec<u8>,
    pub deadline: Instant,
    pub working_dir: String,
}

/// Outcome of a completed (or killed) worker run.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub exit_code: i64,
    pub timed_out: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// The only primitives the rest of the core may assume about the isolation
/// backend.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create_volume(&self, name: &str) -> RuntimeResult<()>;

    async fn remove_volume(&self, name: &str) -> RuntimeResult<()>;

    async fn list_volumes(&self) -> RuntimeResult<Vec<String>>;

    /// Spawn a disposable worker, stream its stdout/stderr through `sink`
    /// (if provided), and return its outcome. The adapter must remove the
    /// ephemeral container on every exit path, including cancellation.
    async fn run_worker(
        &self,
        spec: WorkerSpec,
        sink: Option<LineSink>,
        ctx: CancellationToken,
    ) -> RuntimeResult<WorkerOutcome>;
}

pub fn deadline_from_now(timeout: Duration) -> Instant {
    Instant::now() + timeout
}
