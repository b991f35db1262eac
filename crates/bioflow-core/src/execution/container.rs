//! Container driver abstraction and the Docker implementation.
//!
//! The engine treats the container runtime as an opaque capability:
//! `ensure_image` + `start` on the driver, `wait`/`stop`/`kill` on the
//! returned handle. `DockerDriver` shells out to the `docker` CLI via
//! `tokio::process`, teeing container stdout+stderr into the step's log
//! file in append mode.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced by container drivers.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// The container process could not be launched.
    #[error("failed to launch container: {0}")]
    Launch(String),

    /// Pulling the image failed (not found, registry unreachable).
    #[error("failed to pull image '{image}': {message}")]
    Pull { image: String, message: String },

    /// The container runtime itself is unreachable or misbehaving.
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// Log file or process I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Spec and traits
// ---------------------------------------------------------------------------

/// Everything needed to start one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container image reference.
    pub image: String,
    /// Fully substituted shell command.
    pub command: String,
    /// CPU core request.
    pub cpu: u32,
    /// Memory request string (e.g. "4G").
    pub memory: String,
    /// Host directory mounted into the container at the same path, so
    /// `${run_dir}` expansions resolve on both sides.
    pub mount_dir: PathBuf,
    /// File receiving the container's combined stdout+stderr (append mode).
    pub log_file: PathBuf,
    /// Runtime-level container name, used for stop/kill.
    pub container_name: String,
}

/// A container runtime capable of pulling images and starting containers.
pub trait ContainerDriver: Send + Sync + 'static {
    type Handle: ContainerHandle;

    /// Make sure `image` is available locally, pulling it if necessary.
    fn ensure_image(
        &self,
        image: &str,
    ) -> impl std::future::Future<Output = Result<(), ContainerError>> + Send;

    /// Launch a container and return a handle to it.
    fn start(
        &self,
        spec: &ContainerSpec,
    ) -> impl std::future::Future<Output = Result<Self::Handle, ContainerError>> + Send;
}

/// A running container.
pub trait ContainerHandle: Send + 'static {
    /// Wait for the container to exit and return its exit code.
    fn wait(
        &mut self,
    ) -> impl std::future::Future<Output = Result<i64, ContainerError>> + Send;

    /// Soft-stop the container, allowing `grace` for it to exit.
    fn stop(
        &mut self,
        grace: Duration,
    ) -> impl std::future::Future<Output = Result<(), ContainerError>> + Send;

    /// Hard-kill the container.
    fn kill(&mut self) -> impl std::future::Future<Output = Result<(), ContainerError>> + Send;
}

// ---------------------------------------------------------------------------
// Docker driver
// ---------------------------------------------------------------------------

/// Driver that wraps the local `docker` CLI.
#[derive(Debug, Clone, Default)]
pub struct DockerDriver;

impl DockerDriver {
    pub fn new() -> Self {
        Self
    }
}

/// Arguments for `docker run`, factored out for testability.
fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mount = spec.mount_dir.display().to_string();
    vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        spec.container_name.clone(),
        "--cpus".to_string(),
        spec.cpu.to_string(),
        "--memory".to_string(),
        spec.memory.clone(),
        "-v".to_string(),
        format!("{mount}:{mount}"),
        "-w".to_string(),
        mount,
        spec.image.clone(),
        "sh".to_string(),
        "-c".to_string(),
        spec.command.clone(),
    ]
}

/// Open the step log file in append mode, creating parents as needed.
fn open_log_file(path: &Path) -> Result<std::fs::File, ContainerError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(file)
}

impl ContainerDriver for DockerDriver {
    type Handle = DockerHandle;

    async fn ensure_image(&self, image: &str) -> Result<(), ContainerError> {
        let inspect = Command::new("docker")
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| ContainerError::Runtime(e.to_string()))?;

        if inspect.success() {
            return Ok(());
        }

        tracing::info!(image, "pulling container image");
        let pull = Command::new("docker")
            .args(["pull", image])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ContainerError::Runtime(e.to_string()))?;

        if !pull.status.success() {
            return Err(ContainerError::Pull {
                image: image.to_string(),
                message: String::from_utf8_lossy(&pull.stderr).trim().to_string(),
            });
        }

        Ok(())
    }

    async fn start(&self, spec: &ContainerSpec) -> Result<DockerHandle, ContainerError> {
        let log = open_log_file(&spec.log_file)?;
        let log_err = log.try_clone()?;

        let child = Command::new("docker")
            .args(run_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| ContainerError::Launch(e.to_string()))?;

        tracing::debug!(
            image = spec.image.as_str(),
            container = spec.container_name.as_str(),
            "started container"
        );

        Ok(DockerHandle {
            container_name: spec.container_name.clone(),
            child,
        })
    }
}

/// Handle to a container started by [`DockerDriver`].
pub struct DockerHandle {
    container_name: String,
    child: Child,
}

impl ContainerHandle for DockerHandle {
    async fn wait(&mut self) -> Result<i64, ContainerError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ContainerError::Runtime(e.to_string()))?;
        // Signal-terminated processes have no code; report the conventional
        // shell encoding so the step records something meaningful.
        Ok(status.code().map(i64::from).unwrap_or(-1))
    }

    async fn stop(&mut self, grace: Duration) -> Result<(), ContainerError> {
        let status = Command::new("docker")
            .args([
                "stop",
                "-t",
                &grace.as_secs().to_string(),
                &self.container_name,
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| ContainerError::Runtime(e.to_string()))?;

        if !status.success() {
            tracing::warn!(
                container = self.container_name.as_str(),
                "docker stop reported failure"
            );
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), ContainerError> {
        let _ = Command::new("docker")
            .args(["kill", &self.container_name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        // Reap the docker-run client process if it is still around.
        if let Err(e) = self.child.start_kill() {
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(ContainerError::Runtime(e.to_string()));
            }
        }
        let _ = self.child.wait().await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            image: "ubuntu:22.04".to_string(),
            command: "echo hi > outputs/a.txt".to_string(),
            cpu: 2,
            memory: "4G".to_string(),
            mount_dir: PathBuf::from("/data/runs/wf/1.0.0/run1"),
            log_file: PathBuf::from("/data/runs/wf/1.0.0/run1/logs/a.log"),
            container_name: "bioflow-run1-a".to_string(),
        }
    }

    #[test]
    fn test_run_args_shape() {
        let args = run_args(&spec());
        assert_eq!(args[0], "run");
        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"bioflow-run1-a".to_string()));
        // Mounted at the same path on both sides.
        assert!(args.contains(&"/data/runs/wf/1.0.0/run1:/data/runs/wf/1.0.0/run1".to_string()));
        // Working directory inside the container is the run dir.
        let w_idx = args.iter().position(|a| a == "-w").unwrap();
        assert_eq!(args[w_idx + 1], "/data/runs/wf/1.0.0/run1");
        // Command is handed to sh -c verbatim.
        assert_eq!(args[args.len() - 2], "-c");
        assert_eq!(args[args.len() - 1], "echo hi > outputs/a.txt");
    }

    #[test]
    fn test_run_args_resource_flags() {
        let args = run_args(&spec());
        let cpus_idx = args.iter().position(|a| a == "--cpus").unwrap();
        assert_eq!(args[cpus_idx + 1], "2");
        let mem_idx = args.iter().position(|a| a == "--memory").unwrap();
        assert_eq!(args[mem_idx + 1], "4G");
    }

    #[test]
    fn test_open_log_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/step.log");

        {
            use std::io::Write;
            let mut f = open_log_file(&path).unwrap();
            writeln!(f, "first").unwrap();
        }
        {
            use std::io::Write;
            let mut f = open_log_file(&path).unwrap();
            writeln!(f, "second").unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "first\nsecond\n");
    }
}
