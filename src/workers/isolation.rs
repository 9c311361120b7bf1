//! Isolation back-end interface (§4.K): `spawn`/`exec`/`copy_in`/`status`/
//! `kill`, with container and process variants. Per §9's closed-variant-set
//! note, new back-ends are added by extending this module, not by ad-hoc
//! reflection.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error, Diagnostic)]
pub enum IsolationError {
    #[error("failed to spawn isolation boundary for journey {journey_id}: {message}")]
    #[diagnostic(code(stepgraph::workers::isolation_spawn))]
    Spawn { journey_id: String, message: String },

    #[error("command in journey {journey_id} timed out after {timeout_ms}ms")]
    #[diagnostic(code(stepgraph::workers::isolation_timeout))]
    Timeout { journey_id: String, timeout_ms: u64 },

    #[error("command in journey {journey_id} failed: {message}")]
    #[diagnostic(code(stepgraph::workers::isolation_exec))]
    Exec { journey_id: String, message: String },

    #[error("io error for journey {journey_id}: {source}")]
    #[diagnostic(code(stepgraph::workers::isolation_io))]
    Io {
        #[source]
        source: std::io::Error,
        journey_id: String,
    },
}

/// Opaque handle to a materialised isolation boundary.
#[derive(Debug, Clone)]
pub struct IsolationHandle {
    pub journey_id: String,
    pub workspace_path: PathBuf,
    /// Container id/name when the handle was produced by [`ContainerBackend`]; `None` for [`ProcessBackend`].
    pub container_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    Running,
    Stopped,
}

/// Pluggable facility materialising per-journey execution boundaries.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    async fn spawn(
        &self,
        journey_id: &str,
        workspace_path: &Path,
        image: Option<&str>,
        read_only: bool,
    ) -> Result<IsolationHandle, IsolationError>;

    async fn exec(
        &self,
        handle: &IsolationHandle,
        command: &str,
        workdir: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecOutput, IsolationError>;

    async fn copy_in(&self, handle: &IsolationHandle, src: &Path, dst: &str) -> Result<(), IsolationError>;

    async fn status(&self, handle: &IsolationHandle) -> Result<HandleStatus, IsolationError>;

    /// Release container/process resources. Must be idempotent.
    async fn kill(&self, handle: &IsolationHandle) -> Result<(), IsolationError>;
}

/// Bind-mounts `workspace_path -> /workspace`, a writable tmpfs at `/tmp`, an
/// isolated network namespace, and `USER_JOURNEY_ID` in the environment.
/// Commands run through the host's container exec API — here, the same
/// `docker exec <container>` invocation pattern the CLI-subprocess provider
/// uses (§4.G) — with a timeout. Containers are kept alive until `kill`.
pub struct ContainerBackend {
    docker_binary: String,
}

impl Default for ContainerBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerBackend {
    #[must_use]
    pub fn new() -> Self {
        Self { docker_binary: "docker".to_string() }
    }

    #[must_use]
    pub fn with_docker_binary(mut self, binary: impl Into<String>) -> Self {
        self.docker_binary = binary.into();
        self
    }
}

#[async_trait]
impl IsolationBackend for ContainerBackend {
    async fn spawn(
        &self,
        journey_id: &str,
        workspace_path: &Path,
        image: Option<&str>,
        read_only: bool,
    ) -> Result<IsolationHandle, IsolationError> {
        tokio::fs::create_dir_all(workspace_path)
            .await
            .map_err(|err| IsolationError::Io { source: err, journey_id: journey_id.to_string() })?;

        let image = image.unwrap_or("alpine:latest");
        let container_name = format!("stepgraph-worker-{journey_id}");
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            container_name.clone(),
            "--network".to_string(),
            "none".to_string(),
            "--tmpfs".to_string(),
            "/tmp:rw".to_string(),
            "-e".to_string(),
            format!("USER_JOURNEY_ID={journey_id}"),
            "-v".to_string(),
            format!("{}:/workspace:{}", workspace_path.display(), if read_only { "ro" } else { "rw" }),
        ];
        args.push(image.to_string());
        args.extend(["sleep".to_string(), "infinity".to_string()]);

        let output = Command::new(&self.docker_binary)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|err| IsolationError::Io { source: err, journey_id: journey_id.to_string() })?;

        if !output.status.success() {
            return Err(IsolationError::Spawn {
                journey_id: journey_id.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(IsolationHandle {
            journey_id: journey_id.to_string(),
            workspace_path: workspace_path.to_path_buf(),
            container_id: Some(container_name),
        })
    }

    async fn exec(
        &self,
        handle: &IsolationHandle,
        command: &str,
        workdir: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecOutput, IsolationError> {
        let container = handle.container_id.as_deref().ok_or_else(|| IsolationError::Exec {
            journey_id: handle.journey_id.clone(),
            message: "handle has no container id".to_string(),
        })?;

        let mut args = vec!["exec".to_string()];
        if let Some(workdir) = workdir {
            args.extend(["-w".to_string(), workdir.to_string()]);
        }
        args.extend([container.to_string(), "sh".to_string(), "-c".to_string(), command.to_string()]);

        let mut cmd = Command::new(&self.docker_binary);
        cmd.args(&args).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| IsolationError::Timeout { journey_id: handle.journey_id.clone(), timeout_ms: timeout.as_millis() as u64 })?
            .map_err(|err| IsolationError::Io { source: err, journey_id: handle.journey_id.clone() })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ExecOutput { exit_code: output.status.code().unwrap_or(-1), output: combined })
    }

    async fn copy_in(&self, handle: &IsolationHandle, src: &Path, dst: &str) -> Result<(), IsolationError> {
        let container = handle.container_id.as_deref().ok_or_else(|| IsolationError::Exec {
            journey_id: handle.journey_id.clone(),
            message: "handle has no container id".to_string(),
        })?;
        let output = Command::new(&self.docker_binary)
            .args(["cp", &src.display().to_string(), &format!("{container}:{dst}")])
            .output()
            .await
            .map_err(|err| IsolationError::Io { source: err, journey_id: handle.journey_id.clone() })?;
        if !output.status.success() {
            return Err(IsolationError::Exec {
                journey_id: handle.journey_id.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn status(&self, handle: &IsolationHandle) -> Result<HandleStatus, IsolationError> {
        let Some(container) = handle.container_id.as_deref() else {
            return Ok(HandleStatus::Stopped);
        };
        let output = Command::new(&self.docker_binary)
            .args(["inspect", "-f", "{{.State.Running}}", container])
            .output()
            .await
            .map_err(|err| IsolationError::Io { source: err, journey_id: handle.journey_id.clone() })?;
        if !output.status.success() {
            return Ok(HandleStatus::Stopped);
        }
        let running = String::from_utf8_lossy(&output.stdout).trim() == "true";
        Ok(if running { HandleStatus::Running } else { HandleStatus::Stopped })
    }

    async fn kill(&self, handle: &IsolationHandle) -> Result<(), IsolationError> {
        let Some(container) = handle.container_id.as_deref() else {
            return Ok(());
        };
        // `docker rm -f` on an already-gone container exits non-zero but
        // that's still a successful kill from our perspective — idempotent.
        let _ = Command::new(&self.docker_binary).args(["rm", "-f", container]).output().await;
        Ok(())
    }
}

/// No container: the workspace directory is created and the worker executes
/// in-process with its path. Commands run as ordinary child processes of the
/// host.
#[derive(Default)]
pub struct ProcessBackend;

impl ProcessBackend {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    async fn spawn(
        &self,
        journey_id: &str,
        workspace_path: &Path,
        _image: Option<&str>,
        _read_only: bool,
    ) -> Result<IsolationHandle, IsolationError> {
        tokio::fs::create_dir_all(workspace_path)
            .await
            .map_err(|err| IsolationError::Io { source: err, journey_id: journey_id.to_string() })?;
        Ok(IsolationHandle {
            journey_id: journey_id.to_string(),
            workspace_path: workspace_path.to_path_buf(),
            container_id: None,
        })
    }

    async fn exec(
        &self,
        handle: &IsolationHandle,
        command: &str,
        workdir: Option<&str>,
        timeout: Duration,
    ) -> Result<ExecOutput, IsolationError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.current_dir(workdir.map(PathBuf::from).unwrap_or_else(|| handle.workspace_path.clone()));
        cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| IsolationError::Timeout { journey_id: handle.journey_id.clone(), timeout_ms: timeout.as_millis() as u64 })?
            .map_err(|err| IsolationError::Io { source: err, journey_id: handle.journey_id.clone() })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(ExecOutput { exit_code: output.status.code().unwrap_or(-1), output: combined })
    }

    async fn copy_in(&self, handle: &IsolationHandle, src: &Path, dst: &str) -> Result<(), IsolationError> {
        let dst_path = handle.workspace_path.join(dst);
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| IsolationError::Io { source: err, journey_id: handle.journey_id.clone() })?;
        }
        tokio::fs::copy(src, &dst_path).await.map_err(|err| IsolationError::Io { source: err, journey_id: handle.journey_id.clone() })?;
        Ok(())
    }

    async fn status(&self, handle: &IsolationHandle) -> Result<HandleStatus, IsolationError> {
        Ok(if handle.workspace_path.exists() { HandleStatus::Running } else { HandleStatus::Stopped })
    }

    async fn kill(&self, _handle: &IsolationHandle) -> Result<(), IsolationError> {
        // The process backend holds no separate container resource; the
        // workspace directory itself is left for the caller to reclaim.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn process_backend_spawn_creates_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("journey-1");
        let backend = ProcessBackend::new();
        let handle = backend.spawn("journey-1", &workspace, None, false).await.unwrap();
        assert!(workspace.exists());
        assert_eq!(backend.status(&handle).await.unwrap(), HandleStatus::Running);
    }

    #[tokio::test]
    async fn process_backend_exec_runs_command() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("journey-2");
        let backend = ProcessBackend::new();
        let handle = backend.spawn("journey-2", &workspace, None, false).await.unwrap();
        let result = backend.exec(&handle, "echo hello", None, Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.output.contains("hello"));
    }

    #[tokio::test]
    async fn process_backend_kill_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("journey-3");
        let backend = ProcessBackend::new();
        let handle = backend.spawn("journey-3", &workspace, None, false).await.unwrap();
        backend.kill(&handle).await.unwrap();
        backend.kill(&handle).await.unwrap();
    }
}
