//! Environment Builder — the setup pipeline.
//!
//! Materializes a code+dependency image onto a fresh volume using a
//! sequence of disposable helper workers, the way this project's ancestor
//! daemon runs its one-shot installer container: create, attach, stream,
//! wait for exit, always clean up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::governor::Governor;
use crate::policy::{validate_dependency_spec, validate_module_name, Permissions, PermissionsRequest};
use crate::runtime::{
    self, ContainerRuntime, Isolation, MountMode, MountSpec, NetworkPolicy, WorkerSpec,
};
use crate::store::{Environment, EnvironmentStatus, RuntimeKind, Store};

/// Helper image used for writing modules and fixing ownership. Unlike the
/// runtime images, this never executes untrusted code — it only moves
/// bytes the caller already validated onto the volume.
const HELPER_IMAGE: &str = "busybox:latest";

const HELPER_TIMEOUT: Duration = Duration::from_secs(30);
const DEPENDENCY_INSTALL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Deserialize)]
pub struct DependenciesRequest {
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetupRequest {
    pub main_module: String,
    pub modules: HashMap<String, String>,
    #[serde(default)]
    pub dependencies: Option<DependenciesRequest>,
    #[serde(default)]
    pub permissions: Option<PermissionsRequest>,
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
    #[serde(default)]
    pub runtime: Option<String>,
}

pub struct EnvironmentBuilder {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<Store>,
    governor: Arc<Governor>,
    image_deno: String,
    image_node: String,
    isolation: Isolation,
}

impl EnvironmentBuilder {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<Store>,
        governor: Arc<Governor>,
        image_deno: String,
        image_node: String,
        isolation: Isolation,
    ) -> Self {
        Self {
            runtime,
            store,
            governor,
            image_deno,
            image_node,
            isolation,
        }
    }

    pub async fn setup(&self, req: SetupRequest, ctx: CancellationToken) -> Result<Environment> {
        validate_setup_request(&req)?;

        let id = Uuid::new_v4();
        let volume_name = runtime::volume_name(&id);
        let runtime_kind = match req.runtime.as_deref() {
            Some("node") => RuntimeKind::Node,
            _ => RuntimeKind::Deno,
        };

        let _permit = self
            .governor
            .admit_setup(&ctx)
            .await
            .map_err(|_| CoreError::Cancelled)?;

        info!(%id, "starting environment setup");

        if let Err(e) = self.run_setup_pipeline(&volume_name, &req, runtime_kind, &ctx).await {
            warn!(%id, error = %e, "setup failed, rolling back volume");
            if let Err(cleanup_err) = self.runtime.remove_volume(&volume_name).await {
                warn!(%id, error = %cleanup_err, "failed to roll back volume after setup failure");
            }
            return Err(CoreError::SetupFailed(e.to_string()));
        }

        let permissions: Permissions = req.permissions.clone().unwrap_or_default().into();
        let metadata = serde_json::json!({
            "permissions": permissions,
            "module_count": req.modules.len(),
            "dependency_count": req
                .dependencies
                .as_ref()
                .map(|d| d.packages.len() + d.urls.len())
                .unwrap_or(0),
            "runtime": runtime_kind.as_str(),
        })
        .to_string();

        let now = now_unix();
        let env = Environment {
            id,
            volume_name,
            main_module: req.main_module,
            runtime: runtime_kind,
            created_at: now,
            last_executed_at: None,
            execution_count: 0,
            status: EnvironmentStatus::Ready,
            metadata,
            ttl_seconds: req.ttl_seconds.unwrap_or(3600),
        };

        let envs = self.store.environments().await;
        if let Err(e) = envs.insert(&env) {
            drop(envs);
            warn!(%id, error = %e, "failed to persist environment, rolling back volume");
            let _ = self.runtime.remove_volume(&env.volume_name).await;
            return Err(CoreError::SetupFailed(e.to_string()));
        }

        info!(%id, "environment ready");
        Ok(env)
    }

    async fn run_setup_pipeline(
        &self,
        volume_name: &str,
        req: &SetupRequest,
        runtime_kind: RuntimeKind,
        ctx: &CancellationToken,
    ) -> Result<()> {
        self.runtime.create_volume(volume_name).await?;

        for (filename, content) in &req.modules {
            self.write_module(volume_name, filename, content, ctx).await?;
        }

        self.chown_workspace(volume_name, ctx).await?;

        if let Some(deps) = &req.dependencies {
            self.install_dependencies(volume_name, runtime_kind, deps, ctx).await?;
        }

        Ok(())
    }

    async fn write_module(
        &self,
        volume_name: &str,
        filename: &str,
        content: &str,
        ctx: &CancellationToken,
    ) -> Result<()> {
        let spec = WorkerSpec {
            image: HELPER_IMAGE.to_string(),
            mounts: vec![MountSpec {
                volume_name: volume_name.to_string(),
                mount_path: "/workspace".to_string(),
                mode: MountMode::ReadWrite,
            }],
            network: NetworkPolicy::None,
            memory_bytes: 64 * 1024 * 1024,
            cpu_quota: 50_000,
            cpu_period: 100_000,
            pids_limit: 32,
            read_only_root: true,
            user: "0:0".to_string(),
            env: HashMap::new(),
            isolation: self.isolation,
            entrypoint_override: Some(vec!["sh".to_string()]),
            // filename reaches the shell only as a positional parameter
            // ($1), never interpolated into the script text itself.
            args: vec![
                "-c".to_string(),
                r#"mkdir -p "$(dirname "$1")" && cat > "$1""#.to_string(),
                "_".to_string(),
                format!("/workspace/{filename}"),
            ],
            stdin: content.as_bytes().to_vec(),
            deadline: runtime::deadline_from_now(HELPER_TIMEOUT),
            working_dir: "/".to_string(),
        };

        let outcome = self.runtime.run_worker(spec, None, ctx.clone()).await?;

        if outcome.exit_code != 0 {
            return Err(CoreError::SetupFailed(format!(
                "writing module {filename} failed with exit code {}",
                outcome.exit_code
            )));
        }
        Ok(())
    }

    async fn chown_workspace(&self, volume_name: &str, ctx: &CancellationToken) -> Result<()> {
        let spec = WorkerSpec {
            image: HELPER_IMAGE.to_string(),
            mounts: vec![MountSpec {
                volume_name: volume_name.to_string(),
                mount_path: "/workspace".to_string(),
                mode: MountMode::ReadWrite,
            }],
            network: NetworkPolicy::None,
            memory_bytes: 64 * 1024 * 1024,
            cpu_quota: 50_000,
            cpu_period: 100_000,
            pids_limit: 32,
            read_only_root: true,
            user: "0:0".to_string(),
            env: HashMap::new(),
            isolation: self.isolation,
            entrypoint_override: Some(vec!["chown".to_string()]),
            args: vec!["-R".to_string(), "1000:1000".to_string(), "/workspace".to_string()],
            stdin: Vec::new(),
            deadline: runtime::deadline_from_now(HELPER_TIMEOUT),
            working_dir: "/".to_string(),
        };

        let outcome = self.runtime.run_worker(spec, None, ctx.clone()).await?;

        if outcome.exit_code != 0 {
            return Err(CoreError::SetupFailed(format!(
                "chown of workspace failed with exit code {}",
                outcome.exit_code
            )));
        }
        Ok(())
    }

    async fn install_dependencies(
        &self,
        volume_name: &str,
        runtime_kind: RuntimeKind,
        deps: &DependenciesRequest,
        ctx: &CancellationToken,
    ) -> Result<()> {
        let image = match runtime_kind {
            RuntimeKind::Deno => self.image_deno.as_str(),
            RuntimeKind::Node => self.image_node.as_str(),
        };

        let specifiers: Vec<&str> = deps
            .packages
            .iter()
            .chain(deps.urls.iter())
            .map(|s| s.as_str())
            .collect();

        for spec_str in specifiers {
            let args = match runtime_kind {
                RuntimeKind::Deno => vec!["deno".to_string(), "cache".to_string(), spec_str.to_string()],
                RuntimeKind::Node => vec![
                    "npm".to_string(),
                    "install".to_string(),
                    "--no-save".to_string(),
                    "--prefix".to_string(),
                    "/workspace".to_string(),
                    spec_str.to_string(),
                ],
            };

            let spec = WorkerSpec {
                image: image.to_string(),
                mounts: vec![
                    MountSpec {
                        volume_name: volume_name.to_string(),
                        mount_path: "/workspace".to_string(),
                        mode: MountMode::ReadWrite,
                    },
                    cache_mount(volume_name, runtime_kind),
                ],
                network: NetworkPolicy::Bridge,
                memory_bytes: 512 * 1024 * 1024,
                cpu_quota: 100_000,
                cpu_period: 100_000,
                pids_limit: 128,
                read_only_root: false,
                user: "1000:1000".to_string(),
                env: HashMap::new(),
                isolation: self.isolation,
                entrypoint_override: None,
                args,
                stdin: Vec::new(),
                deadline: runtime::deadline_from_now(DEPENDENCY_INSTALL_TIMEOUT),
                working_dir: "/workspace".to_string(),
            };

            let outcome = self.runtime.run_worker(spec, None, ctx.clone()).await?;

            if outcome.exit_code != 0 {
                return Err(CoreError::SetupFailed(format!(
                    "dependency install for {spec_str} failed with exit code {}: {}",
                    outcome.exit_code,
                    String::from_utf8_lossy(&outcome.stderr)
                )));
            }
        }

        Ok(())
    }
}

fn cache_mount(volume_name: &str, runtime_kind: RuntimeKind) -> MountSpec {
    let mount_path = match runtime_kind {
        RuntimeKind::Deno => "/deno-dir",
        RuntimeKind::Node => "/usr/local/share/.cache/node",
    };
    MountSpec {
        volume_name: volume_name.to_string(),
        mount_path: mount_path.to_string(),
        mode: MountMode::ReadWrite,
    }
}

fn validate_setup_request(req: &SetupRequest) -> Result<()> {
    if req.main_module.is_empty() {
        return Err(CoreError::Validation("main_module must not be empty".to_string()));
    }
    if req.modules.is_empty() {
        return Err(CoreError::Validation("at least one module is required".to_string()));
    }
    if !req.modules.contains_key(&req.main_module) {
        return Err(CoreError::Validation(format!(
            "main_module '{}' is not present in modules",
            req.main_module
        )));
    }
    for filename in req.modules.keys() {
        validate_module_name(filename)?;
    }
    if let Some(deps) = &req.dependencies {
        for spec in deps.packages.iter().chain(deps.urls.iter()) {
            validate_dependency_spec(spec)?;
        }
    }
    Ok(())
}

pub(crate) fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_setup_request_requires_main_module_in_modules() {
        let mut modules = HashMap::new();
        modules.insert("other.ts".to_string(), "export function handler() {}".to_string());
        let req = SetupRequest {
            main_module: "main.ts".to_string(),
            modules,
            dependencies: None,
            permissions: None,
            ttl_seconds: None,
            runtime: None,
        };
        assert!(validate_setup_request(&req).is_err());
    }

    #[test]
    fn test_validate_setup_request_rejects_bad_module_names() {
        let mut modules = HashMap::new();
        modules.insert("../escape.ts".to_string(), "x".to_string());
        let req = SetupRequest {
            main_module: "../escape.ts".to_string(),
            modules,
            dependencies: None,
            permissions: None,
            ttl_seconds: None,
            runtime: None,
        };
        assert!(validate_setup_request(&req).is_err());
    }

    #[test]
    fn test_validate_setup_request_accepts_well_formed_request() {
        let mut modules = HashMap::new();
        modules.insert("main.ts".to_string(), "export function handler() {}".to_string());
        let req = SetupRequest {
            main_module: "main.ts".to_string(),
            modules,
            dependencies: None,
            permissions: None,
            ttl_seconds: None,
            runtime: None,
        };
        assert!(validate_setup_request(&req).is_ok());
    }
}
