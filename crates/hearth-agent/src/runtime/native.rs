use async_trait::async_trait;
use tokio::process::Command;

use super::{ProcessHandle, RuntimeController, RuntimeError};
use crate::model::{InstanceConfig, InstancePaths};
use crate::plugin::StartupCommand;

/// Spawns the game directly in its own session; signals target the process group.
#[derive(Debug, Default, Clone)]
pub struct NativeRuntime;

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the daemon dies, take the game down with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, sig: libc::c_int) -> Result<(), RuntimeError> {
    let Some(pid) = pid else {
        return Err(RuntimeError::NoProcess);
    };
    let pgid = pid as i32;
    let rc = unsafe { libc::kill(-pgid, sig) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        return Err(RuntimeError::Spawn {
            command: format!("kill -{sig} -{pgid}"),
            source: err,
        });
    }
    Ok(())
}

#[async_trait]
impl RuntimeController for NativeRuntime {
    fn is_container(&self) -> bool {
        false
    }

    async fn initialize(&self, _cfg: &InstanceConfig) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn create(&self, _cfg: &InstanceConfig, _paths: &InstancePaths) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn start(
        &self,
        cfg: &InstanceConfig,
        paths: &InstancePaths,
        cmd: &StartupCommand,
    ) -> Result<ProcessHandle, RuntimeError> {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .current_dir(&paths.public)
            .env("TERM", "xterm")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                command.pre_exec(|| {
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = command.spawn().map_err(|source| RuntimeError::Spawn {
            command: format!("{} (cwd {})", cmd.display(), paths.public.display()),
            source,
        })?;
        tracing::info!(instance = %cfg.name, pid = ?child.id(), "spawned game process");
        ProcessHandle::from_child(child)
    }

    async fn stop(&self, _cfg: &InstanceConfig, pid: Option<u32>) -> Result<(), RuntimeError> {
        signal_group(pid, libc::SIGTERM)
    }

    async fn kill(&self, _cfg: &InstanceConfig, pid: Option<u32>) -> Result<(), RuntimeError> {
        signal_group(pid, libc::SIGKILL)
    }

    async fn delete(&self, _cfg: &InstanceConfig) -> Result<(), RuntimeError> {
        Ok(())
    }
}
