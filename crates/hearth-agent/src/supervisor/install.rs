use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use hearth_process::PowerState;
use tokio::io::AsyncWriteExt;

use super::{Instance, SupervisorError};
use crate::model::PluginKind;
use crate::output::strip_ansi;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .user_agent("hearth-agent")
            .build()
            .unwrap_or_default()
    })
}

/// `[-d] -b <basepath> -u <user> [build params...]`
pub(crate) fn installer_args(container: bool, basepath: &Path, user: &str, build_params: Option<&str>) -> Vec<String> {
    let mut args = Vec::new();
    if container {
        args.push("-d".to_string());
    }
    args.extend([
        "-b".to_string(),
        basepath.display().to_string(),
        "-u".to_string(),
        user.to_string(),
    ]);
    if let Some(params) = build_params {
        args.extend(params.split_whitespace().map(str::to_string));
    }
    args
}

pub(crate) fn installer_log_path(log_dir: &Path, name: &str, at: chrono::DateTime<chrono::Local>) -> PathBuf {
    log_dir
        .join("installer")
        .join(format!("{name}-{}.log", at.format("%Y.%m.%d.%H.%M.%S")))
}

async fn open_log(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::OpenOptions::new().create(true).append(true).open(path).await
}

impl Instance {
    /// Persists the record and creates the system account for a new instance.
    pub async fn provision(&self, password: &str) -> Result<(), SupervisorError> {
        let _op = self.ops.lock().await;
        let cfg = self.config.read().await.clone();
        self.services.store.save(&cfg).await?;
        tracing::info!(instance = %self.name, user = %cfg.user, "creating system account");
        self.services.host.create_user(&cfg, password).await?;
        Ok(())
    }

    /// Creates the container and runs the game's install script, then
    /// tells the control plane the install finished.
    pub async fn major_install(self: &Arc<Self>, build_params: Option<&str>) -> Result<(), SupervisorError> {
        let _op = self.ops.lock().await;
        self.major_install_locked(build_params).await
    }

    async fn major_install_locked(&self, build_params: Option<&str>) -> Result<(), SupervisorError> {
        tracing::info!(instance = %self.name, "running installer");
        if let Err(e) = self.run_installer(build_params).await {
            tracing::error!(instance = %self.name, error = %e, "install failed");
            self.events.installer(format!("error: install failed: {e}\n"));
            return Err(e);
        }
        if let Err(e) = self.notify_installed().await {
            tracing::error!(instance = %self.name, error = %e, "failed to report finished install");
            self.events
                .installer("error: unable to contact remote service to report the completed install.\n");
            return Err(e);
        }
        self.events.installer("Install completed successfully.\n");
        tracing::info!(instance = %self.name, "install completed");
        Ok(())
    }

    async fn run_installer(&self, build_params: Option<&str>) -> Result<(), SupervisorError> {
        let svc = &self.services;
        let cfg = self.config.read().await.clone();
        let paths = cfg.paths(&svc.settings.basepath);
        svc.runtime.create(&cfg, &paths).await?;

        let script = self.plugin.read().await.metadata().install_script;
        let args = installer_args(svc.runtime.is_container(), &svc.settings.basepath, &cfg.user, build_params);
        let log_path = installer_log_path(&svc.settings.log_dir, &self.name, chrono::Local::now());
        tracing::info!(instance = %self.name, script, args = %args.join(" "), log = %log_path.display(), "executing install script");

        let mut log = match open_log(&log_path).await {
            Ok(f) => Some(f),
            Err(e) => {
                tracing::warn!(instance = %self.name, path = %log_path.display(), error = %e, "cannot open installer log");
                None
            }
        };

        let mut handle = svc.host.spawn_installer(script, &args).await?;
        while let Some(chunk) = handle.output.recv().await {
            let clean = strip_ansi(&chunk);
            if let Some(f) = log.as_mut()
                && let Err(e) = f.write_all(clean.as_bytes()).await
            {
                tracing::warn!(instance = %self.name, error = %e, "installer log write failed");
                log = None;
            }
            tracing::debug!(instance = %self.name, line = clean.trim_end(), "installer");
            self.events.installer(clean);
        }
        let code = handle.exit.await.ok().flatten();

        if let Some(mut f) = log {
            let marker = match code {
                Some(c) => format!("=== Script exited with code {c} ===\n"),
                None => "=== Script was terminated ===\n".to_string(),
            };
            let _ = f.write_all(marker.as_bytes()).await;
            let _ = f.flush().await;
        }

        if code != Some(0) {
            return Err(SupervisorError::InstallerFailed { code, log: log_path });
        }
        Ok(())
    }

    async fn notify_installed(&self) -> Result<(), SupervisorError> {
        let Some(url) = self.services.settings.install_url.as_deref() else {
            return Ok(());
        };
        http_client()
            .post(url)
            .timeout(NOTIFY_TIMEOUT)
            .form(&[("server", self.name.as_str())])
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Kills the server, drops its container and installs it again,
    /// optionally as a different game.
    pub async fn reinstall(
        self: &Arc<Self>,
        plugin: Option<PluginKind>,
        build_params: Option<&str>,
    ) -> Result<(), SupervisorError> {
        let _op = self.ops.lock().await;
        if self.state.lock().await.status != PowerState::Off {
            self.kill_locked().await;
        }

        let cfg = self.config.read().await.clone();
        if let Err(e) = self.services.runtime.delete(&cfg).await {
            tracing::warn!(instance = %self.name, error = %e, "continuing reinstall even though delete failed");
        }
        if let Some(kind) = plugin {
            let mut next = cfg;
            next.plugin = kind;
            self.store_config(next).await?;
        }
        self.major_install_locked(build_params).await
    }

    pub async fn reset_password(&self, password: &str) -> Result<(), SupervisorError> {
        let cfg = self.config.read().await.clone();
        self.services.host.reset_password(&cfg, password).await?;
        tracing::info!(instance = %self.name, user = %cfg.user, "account password reset");
        Ok(())
    }

    /// Removes the account, the durable record and the container.
    pub async fn destroy(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let _op = self.ops.lock().await;
        if self.state.lock().await.status != PowerState::Off {
            self.kill_locked().await;
        }

        let cfg = self.config.read().await.clone();
        self.services.host.remove_user(&cfg).await?;
        tracing::info!(instance = %self.name, user = %cfg.user, "system account removed");
        self.services.store.remove(&self.name).await?;
        if let Err(e) = self.services.runtime.delete(&cfg).await {
            tracing::error!(instance = %self.name, error = %e, "container delete failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{Harness, drain};
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn installer_args_carry_mode_and_build_params() {
        let base = Path::new("/srv/hearth");
        assert_eq!(
            installer_args(false, base, "mc1", None).join(" "),
            "-b /srv/hearth -u mc1"
        );
        assert_eq!(
            installer_args(true, base, "mc1", Some(" -v 1.8.8  -j server.jar ")).join(" "),
            "-d -b /srv/hearth -u mc1 -v 1.8.8 -j server.jar"
        );
    }

    #[test]
    fn installer_log_is_named_after_instance_and_time() {
        let at = chrono::Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let p = installer_log_path(Path::new("/var/log/hearth"), "mc1", at);
        assert_eq!(p, PathBuf::from("/var/log/hearth/installer/mc1-2024.03.09.07.05.01.log"));
    }

    #[tokio::test]
    async fn install_streams_output_and_logs_it() {
        let h = Harness::new();
        *h.host.installer_lines.lock().unwrap() =
            vec!["Downloading\n".to_string(), "\u{1b}[1mUnpacked\u{1b}[0m\n".to_string()];
        *h.host.installer_code.lock().unwrap() = Some(0);
        let mut installer = h.inst.events().subscribe_installer();

        h.inst.major_install(Some("-v 1.8")).await.unwrap();

        assert_eq!(
            drain(&mut installer),
            vec![
                "Downloading\n".to_string(),
                "Unpacked\n".to_string(),
                "Install completed successfully.\n".to_string()
            ]
        );
        assert_eq!(h.rt.count(&h.rt.creates), 1);
        let base = h.dir.path().join("srv");
        assert!(
            h.host
                .calls()
                .contains(&format!("fake_install.sh -b {} -u mc1 -v 1.8", base.display()))
        );

        let logs: Vec<_> = std::fs::read_dir(h.dir.path().join("logs").join("installer"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(logs.len(), 1);
        let text = std::fs::read_to_string(&logs[0]).unwrap();
        assert_eq!(text, "Downloading\nUnpacked\n=== Script exited with code 0 ===\n");
    }

    #[tokio::test]
    async fn failing_install_script_is_reported() {
        let h = Harness::new();
        *h.host.installer_code.lock().unwrap() = Some(2);
        let mut installer = h.inst.events().subscribe_installer();

        let err = h.inst.major_install(None).await.unwrap_err();
        assert!(matches!(err, SupervisorError::InstallerFailed { code: Some(2), .. }));
        let lines = drain(&mut installer);
        assert!(lines.last().unwrap().starts_with("error: install failed"));
    }

    #[tokio::test]
    async fn install_completion_is_reported_to_control_plane() {
        use axum::{Form, Router, routing::post};
        use std::collections::HashMap;

        let (tx, rx) = tokio::sync::mpsc::channel::<HashMap<String, String>>(1);
        let app = Router::new().route(
            "/install",
            post(move |Form(form): Form<HashMap<String, String>>| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(form).await;
                    "ok"
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let h = Harness::with(|o| o.install_url = Some(format!("http://{addr}/install")));
        *h.host.installer_code.lock().unwrap() = Some(0);
        h.inst.major_install(None).await.unwrap();

        let mut rx = rx;
        let form = rx.recv().await.unwrap();
        assert_eq!(form.get("server").map(String::as_str), Some("mc1"));
    }

    #[tokio::test(start_paused = true)]
    async fn reinstall_kills_deletes_and_switches_game() {
        let h = Harness::new();
        *h.host.installer_code.lock().unwrap() = Some(0);
        h.start_on().await;

        h.inst.reinstall(Some(PluginKind::Srcds), None).await.unwrap();

        assert_eq!(h.inst.status().await, PowerState::Off);
        assert_eq!(h.rt.count(&h.rt.kills), 1);
        assert_eq!(h.rt.count(&h.rt.deletes), 1);
        assert_eq!(h.rt.count(&h.rt.creates), 1);
        assert_eq!(h.inst.config().await.plugin, PluginKind::Srcds);
        assert_eq!(h.services.store.load("mc1").await.unwrap().plugin, PluginKind::Srcds);
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_removes_account_record_and_container() {
        let h = Harness::new();
        h.inst.provision("hunter2").await.unwrap();
        assert!(h.services.store.load("mc1").await.is_ok());
        h.start_on().await;

        h.inst.destroy().await.unwrap();

        assert_eq!(h.inst.status().await, PowerState::Off);
        assert!(h.host.calls().contains(&"create_user mc1 hunter2".to_string()));
        assert!(h.host.calls().contains(&"remove_user mc1".to_string()));
        assert!(h.services.store.load("mc1").await.is_err());
        assert_eq!(h.rt.count(&h.rt.deletes), 1);
    }

    #[tokio::test]
    async fn reset_password_runs_host_script() {
        let h = Harness::new();
        h.inst.reset_password("s3cret").await.unwrap();
        assert_eq!(h.host.calls(), vec!["reset_password mc1 s3cret".to_string()]);
    }
}
