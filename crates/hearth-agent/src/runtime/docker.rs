use async_trait::async_trait;
use tokio::process::Command;

use super::{ProcessHandle, RuntimeController, RuntimeError, run_command};
use crate::model::{InstanceConfig, InstancePaths};
use crate::plugin::StartupCommand;

const DEFAULT_BLKIO_WEIGHT: u32 = 500;
const CPU_PERIOD: i64 = 100_000;
const CONTAINER_HOME: &str = "/home/container";

/// Shells out to the docker CLI; the container is named after the instance user.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    image_prefix: String,
}

impl DockerRuntime {
    pub fn new(image_prefix: impl Into<String>) -> Self {
        Self {
            image_prefix: image_prefix.into(),
        }
    }

    pub fn image_for(&self, cfg: &InstanceConfig) -> String {
        format!("{}/{}:latest", self.image_prefix, cfg.plugin.image_family())
    }
}

async fn docker(args: &[&str]) -> Result<String, RuntimeError> {
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    run_command("docker", &args).await
}

async fn lookup_uid(user: &str) -> Result<u32, RuntimeError> {
    let out = run_command("id", &["-u".to_string(), user.to_string()]).await?;
    out.trim().parse::<u32>().map_err(|_| RuntimeError::BadOutput {
        command: format!("id -u {user}"),
        output: out.trim().to_string(),
    })
}

fn push_port(args: &mut Vec<String>, ip: &str, external: u16, internal: u16) {
    args.push("-p".to_string());
    args.push(format!("{ip}:{external}:{internal}"));
    args.push("-p".to_string());
    args.push(format!("{ip}:{external}:{internal}/udp"));
}

/// Arguments for `docker create`; one tcp and one udp publish per port pair.
pub fn build_create_args(cfg: &InstanceConfig, paths: &InstancePaths, uid: u32, image: &str) -> Vec<String> {
    let cpu_quota = if cfg.build.cpu <= 0 {
        -1
    } else {
        cfg.build.cpu.saturating_mul(1000)
    };

    let mut args = vec![
        "create".to_string(),
        "-it".to_string(),
        "--name".to_string(),
        cfg.user.clone(),
        "-h".to_string(),
        "docker".to_string(),
        "-m".to_string(),
        format!("{}M", cfg.build.memory),
        format!(
            "--blkio-weight={}",
            cfg.build.io.unwrap_or(DEFAULT_BLKIO_WEIGHT)
        ),
        format!("--cpu-period={CPU_PERIOD}"),
        format!("--cpu-quota={cpu_quota}"),
    ];

    push_port(&mut args, &cfg.gamehost, cfg.gameport, cfg.gameport);
    for (ip, ports) in &cfg.build.mapping {
        for (internal, external) in ports {
            push_port(&mut args, ip, *external, *internal);
        }
    }

    args.push("-u".to_string());
    args.push(uid.to_string());
    args.push("-v".to_string());
    args.push(format!("{}:{CONTAINER_HOME}", paths.public.display()));
    args.push(image.to_string());
    args
}

#[async_trait]
impl RuntimeController for DockerRuntime {
    fn is_container(&self) -> bool {
        true
    }

    async fn initialize(&self, cfg: &InstanceConfig) -> Result<(), RuntimeError> {
        docker(&["start", &cfg.user]).await.map(|_| ())
    }

    async fn create(&self, cfg: &InstanceConfig, paths: &InstancePaths) -> Result<(), RuntimeError> {
        let uid = lookup_uid(&cfg.user).await?;
        let args = build_create_args(cfg, paths, uid, &self.image_for(cfg));
        tracing::info!(instance = %cfg.name, "creating container");
        run_command("docker", &args).await.map(|_| ())
    }

    async fn start(
        &self,
        cfg: &InstanceConfig,
        _paths: &InstancePaths,
        cmd: &StartupCommand,
    ) -> Result<ProcessHandle, RuntimeError> {
        let child = Command::new("docker")
            .env_remove("DOCKER_API_VERSION")
            .arg("exec")
            .arg("-i")
            .arg(&cfg.user)
            .arg(&cmd.program)
            .args(&cmd.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                command: format!("docker exec -i {} {}", cfg.user, cmd.display()),
                source,
            })?;
        ProcessHandle::from_child(child)
    }

    async fn stop(&self, cfg: &InstanceConfig, pid: Option<u32>) -> Result<(), RuntimeError> {
        match docker(&["stop", &cfg.user]).await {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(instance = %cfg.name, error = %e, "docker stop failed, killing container");
                self.kill(cfg, pid).await
            }
        }
    }

    async fn kill(&self, cfg: &InstanceConfig, _pid: Option<u32>) -> Result<(), RuntimeError> {
        docker(&["kill", "-s", "9", &cfg.user]).await.map(|_| ())
    }

    async fn delete(&self, cfg: &InstanceConfig) -> Result<(), RuntimeError> {
        docker(&["rm", "-vf", &cfg.user]).await.map(|_| ())
    }
}
