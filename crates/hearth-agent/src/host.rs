use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;

use crate::model::{InstanceConfig, InstancePaths};
use crate::runtime::{ProcessHandle, RuntimeError, run_command};

/// Host-side side effects: ownership fixups, pid lookup, account provisioning.
#[async_trait]
pub trait HostOps: Send + Sync {
    async fn fix_permissions(&self, cfg: &InstanceConfig, paths: &InstancePaths) -> anyhow::Result<()>;

    /// First pid owned by `user` whose executable name matches `exe`.
    async fn resolve_pid(&self, user: &str, exe: &str) -> anyhow::Result<Option<u32>>;

    async fn create_user(&self, cfg: &InstanceConfig, password: &str) -> anyhow::Result<()>;

    async fn remove_user(&self, cfg: &InstanceConfig) -> anyhow::Result<()>;

    async fn reset_password(&self, cfg: &InstanceConfig, password: &str) -> anyhow::Result<()>;

    /// Launches an install script from the scripts directory.
    async fn spawn_installer(&self, script: &str, args: &[String]) -> Result<ProcessHandle, RuntimeError>;
}

#[derive(Debug, Clone)]
pub struct SystemHost {
    basepath: PathBuf,
    scripts_dir: PathBuf,
    service_group: String,
}

impl SystemHost {
    pub fn new(basepath: impl Into<PathBuf>, scripts_dir: impl Into<PathBuf>, service_group: impl Into<String>) -> Self {
        Self {
            basepath: basepath.into(),
            scripts_dir: scripts_dir.into(),
            service_group: service_group.into(),
        }
    }

    fn script(&self, name: &str) -> anyhow::Result<String> {
        if name.contains('/') || name.contains("..") {
            anyhow::bail!("invalid script name {name}");
        }
        Ok(self.scripts_dir.join(name).display().to_string())
    }

    async fn run_script(&self, name: &str, args: Vec<String>) -> anyhow::Result<()> {
        let script = self.script(name)?;
        run_command(&script, &args)
            .await
            .with_context(|| format!("script {name}"))?;
        Ok(())
    }
}

pub(crate) fn first_pid(pgrep_output: &str) -> Option<u32> {
    pgrep_output
        .lines()
        .filter_map(|l| l.trim().parse::<u32>().ok())
        .next()
}

fn path_arg(p: &Path) -> String {
    p.display().to_string()
}

#[async_trait]
impl HostOps for SystemHost {
    async fn fix_permissions(&self, cfg: &InstanceConfig, paths: &InstancePaths) -> anyhow::Result<()> {
        run_command(
            "chown",
            &[
                "-R".to_string(),
                format!("{}:{}", cfg.user, self.service_group),
                path_arg(&paths.public),
            ],
        )
        .await
        .context("fix file ownership")?;
        Ok(())
    }

    async fn resolve_pid(&self, user: &str, exe: &str) -> anyhow::Result<Option<u32>> {
        match run_command("pgrep", &["-u".to_string(), user.to_string(), exe.to_string()]).await {
            Ok(out) => Ok(first_pid(&out)),
            // pgrep exits 1 when nothing matched.
            Err(RuntimeError::Failed { code: Some(1), .. }) => Ok(None),
            Err(e) => Err(e).context("pgrep"),
        }
    }

    async fn create_user(&self, cfg: &InstanceConfig, password: &str) -> anyhow::Result<()> {
        self.run_script(
            "create_user.sh",
            vec![path_arg(&self.basepath), cfg.user.clone(), password.to_string()],
        )
        .await
    }

    async fn remove_user(&self, cfg: &InstanceConfig) -> anyhow::Result<()> {
        self.run_script("remove_user.sh", vec![path_arg(&self.basepath), cfg.user.clone()])
            .await
    }

    async fn reset_password(&self, cfg: &InstanceConfig, password: &str) -> anyhow::Result<()> {
        self.run_script("reset_password.sh", vec![cfg.user.clone(), password.to_string()])
            .await
    }

    async fn spawn_installer(&self, script: &str, args: &[String]) -> Result<ProcessHandle, RuntimeError> {
        let program = self.script(script).map_err(|e| RuntimeError::Spawn {
            command: script.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()),
        })?;
        let child = Command::new(&program)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|source| RuntimeError::Spawn {
                command: format!("{program} {}", args.join(" ")),
                source,
            })?;
        ProcessHandle::from_child(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_pid_takes_first_numeric_line() {
        assert_eq!(first_pid("4312\n4400\n"), Some(4312));
        assert_eq!(first_pid("\n  77 \n"), Some(77));
        assert_eq!(first_pid(""), None);
    }

    #[test]
    fn script_names_cannot_leave_scripts_dir() {
        let host = SystemHost::new("/srv", "/opt/scripts", "hearth");
        assert!(host.script("../bin/sh").is_err());
        assert!(host.script("a/b.sh").is_err());
        assert_eq!(host.script("create_user.sh").unwrap(), "/opt/scripts/create_user.sh");
    }

    #[tokio::test]
    async fn installer_output_is_streamed() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("echo_install.sh");
        std::fs::write(&script, "#!/bin/sh\necho \"installing $2\"\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let host = SystemHost::new("/srv", dir.path(), "hearth");
        let mut h = host
            .spawn_installer("echo_install.sh", &["-u".to_string(), "mc1".to_string()])
            .await
            .unwrap();
        assert_eq!(h.output.recv().await.unwrap(), "installing mc1\n");
        assert_eq!(h.exit.await.unwrap(), Some(0));
    }
}
