//! Backend that runs game processes: docker containers or plain child processes.

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    sync::{mpsc, oneshot},
};

use crate::model::{InstanceConfig, InstancePaths};
use crate::plugin::StartupCommand;

mod docker;
mod native;

pub use docker::DockerRuntime;
pub use native::NativeRuntime;

const OUTPUT_CHANNEL_CAPACITY: usize = 1024;
const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} exited with code {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("no running process to signal")]
    NoProcess,
    #[error("unexpected output from {command}: {output}")]
    BadOutput { command: String, output: String },
}

/// Live process: input pipe, merged output chunks and the exit code.
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub input: Box<dyn AsyncWrite + Send + Unpin>,
    /// Newline-terminated chunks from stdout and stderr, lossily decoded.
    pub output: mpsc::Receiver<String>,
    pub exit: oneshot::Receiver<Option<i32>>,
}

impl ProcessHandle {
    /// Wires reader tasks and a wait task around a spawned child.
    pub fn from_child(mut child: tokio::process::Child) -> Result<Self, RuntimeError> {
        let pid = child.id();
        let input = child.stdin.take().ok_or_else(|| RuntimeError::Spawn {
            command: "child stdin".to_string(),
            source: std::io::Error::other("stdin was not piped"),
        })?;

        let (out_tx, output) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(tokio::spawn(pump_output(out, out_tx.clone())));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(pump_output(err, out_tx.clone())));
        }
        drop(out_tx);

        let (exit_tx, exit) = oneshot::channel();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to wait for child");
                    None
                }
            };
            // Let buffered output drain so triggers are seen before the exit.
            for r in readers {
                let _ = r.await;
            }
            let _ = exit_tx.send(code);
        });

        Ok(Self {
            pid,
            input: Box::new(input),
            output,
            exit,
        })
    }
}

/// Forwards output as soon as it is read. A multi-byte character cut by a
/// read boundary is held back until its remaining bytes arrive.
async fn pump_output<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<String>) {
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    let mut pending = Vec::with_capacity(READ_CHUNK_BYTES + 4);
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "output stream closed");
                break;
            }
        };
        pending.extend_from_slice(&buf[..n]);
        let chunk = take_complete_utf8(&mut pending);
        if !chunk.is_empty() && tx.send(chunk).await.is_err() {
            return;
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned()).await;
    }
}

/// Drains `pending` up to a trailing incomplete UTF-8 sequence, which stays
/// behind (at most three bytes). Invalid bytes are replaced.
fn take_complete_utf8(pending: &mut Vec<u8>) -> String {
    let tail_start = pending.len().saturating_sub(3);
    let mut split = pending.len();
    for i in (tail_start..pending.len()).rev() {
        let b = pending[i];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let needed = match b {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        if pending.len() - i < needed {
            split = i;
        }
        break;
    }
    let chunk = String::from_utf8_lossy(&pending[..split]).into_owned();
    pending.drain(..split);
    chunk
}

#[async_trait]
pub trait RuntimeController: Send + Sync {
    /// Container backends detach the container on every process exit.
    fn is_container(&self) -> bool;

    async fn initialize(&self, cfg: &InstanceConfig) -> Result<(), RuntimeError>;

    async fn create(&self, cfg: &InstanceConfig, paths: &InstancePaths) -> Result<(), RuntimeError>;

    async fn start(
        &self,
        cfg: &InstanceConfig,
        paths: &InstancePaths,
        cmd: &StartupCommand,
    ) -> Result<ProcessHandle, RuntimeError>;

    async fn stop(&self, cfg: &InstanceConfig, pid: Option<u32>) -> Result<(), RuntimeError>;

    async fn kill(&self, cfg: &InstanceConfig, pid: Option<u32>) -> Result<(), RuntimeError>;

    async fn delete(&self, cfg: &InstanceConfig) -> Result<(), RuntimeError>;
}

/// Runs a short-lived command to completion, failing on non-zero exit.
pub(crate) async fn run_command(program: &str, args: &[String]) -> Result<String, RuntimeError> {
    let command = format!("{program} {}", args.join(" "));
    tracing::debug!(%command, "exec");

    let out = tokio::process::Command::new(program)
        .env_remove("DOCKER_API_VERSION")
        .args(args)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|source| RuntimeError::Spawn {
            command: command.clone(),
            source,
        })?;

    if !out.status.success() {
        return Err(RuntimeError::Failed {
            command,
            code: out.status.code(),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn run_command_reports_non_zero_exit() {
        let err = run_command("sh", &["-c".to_string(), "echo oops >&2; exit 3".to_string()])
            .await
            .unwrap_err();
        match err {
            RuntimeError::Failed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn run_command_reports_missing_program() {
        let err = run_command("/nonexistent/definitely-not-here", &[]).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }

    #[tokio::test]
    async fn handle_streams_lines_and_exit_code() {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("read line; echo \"got $line\"; echo err >&2; exit 7")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let mut h = ProcessHandle::from_child(child).unwrap();
        assert!(h.pid.is_some());

        h.input.write_all(b"hello\n").await.unwrap();
        h.input.flush().await.unwrap();

        let mut lines = Vec::new();
        while let Some(l) = h.output.recv().await {
            lines.push(l);
        }
        lines.sort();
        assert_eq!(lines, vec!["err\n".to_string(), "got hello\n".to_string()]);
        assert_eq!(h.exit.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn output_without_newline_is_forwarded() {
        let (mut w, r) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(pump_output(r, tx));

        w.write_all(b"Server> Done").await.unwrap();
        let chunk = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk, "Server> Done");

        drop(w);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn split_multibyte_character_is_reassembled() {
        let (mut w, r) = tokio::io::duplex(64);
        let (tx, mut rx) = mpsc::channel(8);
        tokio::spawn(pump_output(r, tx));

        // "héllo" with the two bytes of 'é' in separate writes.
        w.write_all(b"h\xC3").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        w.write_all(b"\xA9llo\n").await.unwrap();
        drop(w);

        let mut out = String::new();
        while let Some(chunk) = rx.recv().await {
            out.push_str(&chunk);
        }
        assert_eq!(out, "h\u{e9}llo\n");
    }

    #[test]
    fn incomplete_tail_is_kept_back() {
        let mut pending = b"ab\xE2\x82".to_vec();
        assert_eq!(take_complete_utf8(&mut pending), "ab");
        assert_eq!(pending, b"\xE2\x82");
        pending.push(0xAC);
        assert_eq!(take_complete_utf8(&mut pending), "\u{20ac}");
        assert!(pending.is_empty());
    }
}
