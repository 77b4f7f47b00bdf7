//! Docker-backed `ContainerRuntime` adapter, built on `bollard`.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum, RestartPolicy, RestartPolicyNameEnum};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ContainerRuntime, Isolation, LineSink, MountMode, NetworkPolicy, OutputStream, RuntimeError,
    RuntimeResult, WorkerOutcome, WorkerSpec,
};

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect(socket: Option<&str>) -> RuntimeResult<Self> {
        let docker = match socket {
            Some(sock) => Docker::connect_with_socket(sock, 120, bollard::API_DEFAULT_VERSION)?,
            None => Docker::connect_with_local_defaults()?,
        };
        Ok(Self { docker })
    }

    fn dropped_capabilities() -> Vec<String> {
        [
            "setpcap",
            "mknod",
            "audit_write",
            "net_raw",
            "dac_override",
            "fowner",
            "fsetid",
            "net_bind_service",
            "sys_chroot",
            "setfcap",
            "audit_control",
            "audit_read",
            "block_suspend",
            "dac_read_search",
            "ipc_lock",
            "ipc_owner",
            "lease",
            "linux_immutable",
            "mac_admin",
            "mac_override",
            "net_admin",
            "net_broadcast",
            "syslog",
            "sys_admin",
            "sys_boot",
            "sys_module",
            "sys_nice",
            "sys_pacct",
            "sys_ptrace",
            "sys_rawio",
            "sys_resource",
            "sys_time",
            "sys_tty_config",
            "wake_alarm",
        ]
        .into_iter()
        .map(|s| s.to_uppercase())
        .collect()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_volume(&self, name: &str) -> RuntimeResult<()> {
        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                ..Default::default()
            })
            .await?;
        debug!("created volume {}", name);
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> RuntimeResult<()> {
        match self
            .docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(_) => {
                debug!("removed volume {}", name);
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(RuntimeError::Docker(e)),
        }
    }

    async fn list_volumes(&self) -> RuntimeResult<Vec<String>> {
        let response = self.docker.list_volumes::<String>(None).await?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| v.name)
            .collect())
    }

    async fn run_worker(
        &self,
        spec: WorkerSpec,
        sink: Option<LineSink>,
        ctx: CancellationToken,
    ) -> RuntimeResult<WorkerOutcome> {
        let container_name = format!("tee-worker-{}", uuid::Uuid::new_v4());

        ensure_image_exists(&self.docker, &spec.image).await?;

        let outcome = run_container(&self.docker, &container_name, &spec, sink, ctx).await;

        // Always remove the ephemeral container, regardless of how the run
        // above completed.
        let _ = self
            .docker
            .remove_container(
                &container_name,
                Some(RemoveContainerOptions {
                    force: true,
                    v: false,
                    ..Default::default()
                }),
            )
            .await;

        outcome
    }
}

async fn ensure_image_exists(docker: &Docker, image: &str) -> RuntimeResult<()> {
    if docker.inspect_image(image).await.is_ok() {
        return Ok(());
    }

    info!("image {} not found locally, pulling", image);
    let options = CreateImageOptions {
        from_image: image,
        ..Default::default()
    };

    let mut stream = docker.create_image(Some(options), None, None);
    while let Some(result) = stream.next().await {
        match result {
            Ok(info) => {
                if let Some(status) = info.status {
                    debug!("pull {}: {}", image, status);
                }
            }
            Err(e) => return Err(RuntimeError::ImagePull(e.to_string())),
        }
    }

    Ok(())
}

async fn run_container(
    docker: &Docker,
    container_name: &str,
    spec: &WorkerSpec,
    sink: Option<LineSink>,
    ctx: CancellationToken,
) -> RuntimeResult<WorkerOutcome> {
    let mounts: Vec<Mount> = spec
        .mounts
        .iter()
        .map(|m| Mount {
            target: Some(m.mount_path.clone()),
            source: Some(m.volume_name.clone()),
            typ: Some(MountTypeEnum::VOLUME),
            read_only: Some(m.mode == MountMode::ReadOnly),
            ..Default::default()
        })
        .collect();

    let env_vars: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

    let network_mode = match spec.network {
        NetworkPolicy::None => "none".to_string(),
        NetworkPolicy::Bridge => "bridge".to_string(),
    };

    let mut security_opt = Vec::new();
    if spec.isolation == Isolation::Relaxed {
        warn!(
            "worker {} running with relaxed isolation (capability drop disabled)",
            container_name
        );
    } else {
        security_opt.push("no-new-privileges".to_string());
    }

    let host_config = HostConfig {
        mounts: Some(mounts),
        memory: Some(spec.memory_bytes),
        memory_swap: Some(spec.memory_bytes),
        cpu_quota: Some(spec.cpu_quota),
        cpu_period: Some(spec.cpu_period),
        pids_limit: Some(spec.pids_limit),
        oom_kill_disable: Some(false),
        security_opt: if security_opt.is_empty() {
            None
        } else {
            Some(security_opt)
        },
        cap_drop: if spec.isolation == Isolation::Hard {
            Some(DockerRuntime::dropped_capabilities())
        } else {
            None
        },
        network_mode: Some(network_mode),
        restart_policy: Some(RestartPolicy {
            name: Some(RestartPolicyNameEnum::NO),
            ..Default::default()
        }),
        readonly_rootfs: Some(spec.read_only_root),
        log_config: Some(bollard::models::HostConfigLogConfig {
            typ: Some("local".to_string()),
            config: Some({
                let mut cfg = HashMap::new();
                cfg.insert("max-size".to_string(), "1m".to_string());
                cfg.insert("max-file".to_string(), "1".to_string());
                cfg
            }),
        }),
        ..Default::default()
    };

    let config = Config {
        image: Some(spec.image.clone()),
        user: Some(spec.user.clone()),
        env: Some(env_vars),
        entrypoint: spec.entrypoint_override.clone(),
        cmd: Some(spec.args.clone()),
        working_dir: Some(spec.working_dir.clone()),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        open_stdin: Some(true),
        stdin_once: Some(true),
        tty: Some(false),
        host_config: Some(host_config),
        ..Default::default()
    };

    docker
        .create_container(
            Some(CreateContainerOptions {
                name: container_name,
                platform: None,
            }),
            config,
        )
        .await?;

    let attach_options = AttachContainerOptions::<String> {
        stdin: Some(true),
        stdout: Some(true),
        stderr: Some(true),
        stream: Some(true),
        logs: Some(false),
        ..Default::default()
    };

    let AttachContainerResults { mut output, mut input } = docker
        .attach_container(container_name, Some(attach_options))
        .await
        .map_err(|e| RuntimeError::AttachFailed(e.to_string()))?;

    docker
        .start_container(container_name, None::<StartContainerOptions<String>>)
        .await?;

    if !spec.stdin.is_empty() {
        input.write_all(&spec.stdin).await?;
    }
    input.shutdown().await?;

    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    const MAX_CAPTURED_BYTES: usize = 1024 * 1024;

    let output_task = tokio::spawn(async move {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => {
                    if let Some(sink) = &sink {
                        sink(OutputStream::Stdout, &message);
                    }
                    if stdout.len() < MAX_CAPTURED_BYTES {
                        stdout.extend_from_slice(&message);
                    }
                }
                Ok(LogOutput::StdErr { message }) => {
                    if let Some(sink) = &sink {
                        sink(OutputStream::Stderr, &message);
                    }
                    if stderr.len() < MAX_CAPTURED_BYTES {
                        stderr.extend_from_slice(&message);
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        (stdout, stderr)
    });

    let wait_options = WaitContainerOptions {
        condition: "not-running",
    };
    let mut wait_stream = docker.wait_container(container_name, Some(wait_options));

    let (exit_code, timed_out) = tokio::select! {
        result = wait_stream.next() => {
            match result {
                Some(Ok(r)) => (r.status_code, false),
                Some(Err(e)) => return Err(RuntimeError::Docker(e)),
                None => (0, false),
            }
        }
        _ = tokio::time::sleep_until(spec.deadline) => {
            warn!("worker {} exceeded its deadline, killing", container_name);
            let _ = docker
                .kill_container(container_name, Some(KillContainerOptions { signal: "SIGKILL" }))
                .await;
            (124, true)
        }
        _ = ctx.cancelled() => {
            let _ = docker
                .kill_container(container_name, Some(KillContainerOptions { signal: "SIGKILL" }))
                .await;
            return Err(RuntimeError::Cancelled);
        }
    };

    if let Ok((out, err)) = output_task.await {
        stdout_buf = out;
        stderr_buf = err;
    }

    Ok(WorkerOutcome {
        exit_code,
        timed_out,
        stdout: stdout_buf,
        stderr: stderr_buf,
    })
}
