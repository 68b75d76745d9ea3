//! Isolated execution environments (pluggable backends).
//!
//! The pipeline only sees [`Environment`]: `create`, `start`, `stop` and `run`.
//! [`DockerBackend`] drives the container CLI; tests plug in a scripted fake.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::config::DockerConfig;
use crate::error::EnvironmentError;

/// Upper bound on captured output kept per command; the tail is kept.
const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

/// Result of one remote command. A non-zero exit is data, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    /// Combined stdout/stderr; empty when the output was streamed.
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait Environment: Send + Sync {
    fn name(&self) -> &str;

    /// Build or fetch the base image and instantiate the environment.
    async fn create(&self) -> Result<(), EnvironmentError>;

    async fn start(&self) -> Result<(), EnvironmentError>;

    /// Tear down. Safe on an environment that is stopped or was never created.
    async fn stop(&self) -> Result<(), EnvironmentError>;

    /// Run `command` through a shell. With `capture == false` the output is
    /// streamed to the log and only the exit code comes back.
    async fn run(&self, command: &str, capture: bool) -> Result<CommandOutput, EnvironmentError>;
}

/// Hands out one environment handle per build.
pub trait EnvironmentBackend: Send + Sync {
    fn environment(&self, name: &str, build_id: i64) -> Arc<dyn Environment>;
}

/// Scoped ownership of a build's environment.
///
/// The lease is taken before `create`, so whatever `provision` managed to
/// bring up is covered. `release` stops the environment; a lease dropped
/// without `release` still schedules a `stop` on the current runtime.
pub struct EnvironmentLease {
    env: Arc<dyn Environment>,
    released: bool,
}

impl EnvironmentLease {
    pub fn new(env: Arc<dyn Environment>) -> Self {
        crate::metrics::environment_acquired();
        Self {
            env,
            released: false,
        }
    }

    /// `create` then `start`.
    pub async fn provision(&self) -> Result<(), EnvironmentError> {
        self.env.create().await?;
        self.env.start().await
    }

    pub fn environment(&self) -> &dyn Environment {
        self.env.as_ref()
    }

    pub async fn release(mut self) -> Result<(), EnvironmentError> {
        self.released = true;
        crate::metrics::environment_released();
        self.env.stop().await
    }
}

impl Drop for EnvironmentLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        crate::metrics::environment_released();
        let env = Arc::clone(&self.env);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = env.stop().await {
                        tracing::warn!(environment = env.name(), "deferred teardown failed: {e}");
                    }
                });
            }
            Err(_) => {
                tracing::error!(environment = env.name(), "lease dropped outside a runtime, environment leaked");
            }
        }
    }
}

/// Containers driven through the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerBackend {
    config: DockerConfig,
}

impl DockerBackend {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    /// Host ports `(ssh, http)` of a build, derived from its id.
    pub fn ports(&self, build_id: i64) -> (u32, u32) {
        let offset = build_id.rem_euclid(i64::from(self.config.port_span.max(1))) as u32;
        (
            self.config.base_ssh_port + offset,
            self.config.base_http_port + offset,
        )
    }
}

impl EnvironmentBackend for DockerBackend {
    fn environment(&self, name: &str, build_id: i64) -> Arc<dyn Environment> {
        let (ssh_port, http_port) = self.ports(build_id);
        Arc::new(DockerEnvironment {
            config: self.config.clone(),
            name: name.to_string(),
            ssh_port,
            http_port,
        })
    }
}

pub struct DockerEnvironment {
    config: DockerConfig,
    name: String,
    ssh_port: u32,
    http_port: u32,
}

impl DockerEnvironment {
    fn docker(&self) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        if let Some(host) = &self.config.host {
            cmd.arg("-H").arg(host);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run a docker subcommand to completion; `Err` carries stderr.
    async fn docker_ok(&self, args: &[&str]) -> Result<(), String> {
        let output = self
            .docker()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {e}", self.config.binary))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }

    fn command_error(&self, reason: impl Into<String>) -> EnvironmentError {
        EnvironmentError::Command {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl Environment for DockerEnvironment {
    fn name(&self) -> &str {
        &self.name
    }

    // Port bindings are fixed at container creation, so they are applied here
    // rather than in `start`.
    async fn create(&self) -> Result<(), EnvironmentError> {
        let provision = |reason: String| EnvironmentError::Provision {
            name: self.name.clone(),
            reason,
        };

        if let Some(dir) = &self.config.dockerfile_dir {
            tracing::info!(image = %self.config.image, dir = %dir, "Building environment image");
            self.docker_ok(&["build", "-t", &self.config.image, dir])
                .await
                .map_err(provision)?;
        }

        let http = format!("0.0.0.0:{}:80", self.http_port);
        let ssh = format!("0.0.0.0:{}:22", self.ssh_port);
        self.docker_ok(&[
            "create",
            "--name",
            &self.name,
            "-p",
            &http,
            "-p",
            &ssh,
            &self.config.image,
            "sleep",
            "infinity",
        ])
        .await
        .map_err(provision)?;

        tracing::info!(
            environment = %self.name,
            ssh_port = self.ssh_port,
            http_port = self.http_port,
            "Environment created"
        );
        Ok(())
    }

    async fn start(&self) -> Result<(), EnvironmentError> {
        self.docker_ok(&["start", &self.name])
            .await
            .map_err(|reason| EnvironmentError::Start {
                name: self.name.clone(),
                reason,
            })
    }

    async fn stop(&self) -> Result<(), EnvironmentError> {
        match self.docker_ok(&["rm", "-f", &self.name]).await {
            Ok(()) => {
                tracing::info!(environment = %self.name, "Environment removed");
                Ok(())
            }
            Err(reason) if reason.contains("No such container") => Ok(()),
            Err(reason) => Err(self.command_error(reason)),
        }
    }

    async fn run(&self, command: &str, capture: bool) -> Result<CommandOutput, EnvironmentError> {
        let script = format!("exec 2>&1\n{command}");
        let mut cmd = self.docker();
        cmd.args(["exec", &self.name, "sh", "-c", &script])
            .stdin(Stdio::null());

        if capture {
            let output = cmd
                .output()
                .await
                .map_err(|e| self.command_error(e.to_string()))?;
            // stderr only carries docker's own complaints; the script's went to stdout.
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            return Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(-1),
                output: keep_tail(&text, MAX_CAPTURED_OUTPUT),
            });
        }

        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.command_error(e.to_string()))?;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| self.command_error(e.to_string()))?
            {
                tracing::info!(environment = %self.name, "{line}");
            }
        }
        let status = child
            .wait()
            .await
            .map_err(|e| self.command_error(e.to_string()))?;
        Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            output: String::new(),
        })
    }
}

fn keep_tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...truncated...\n{}", &text[start..])
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingEnv {
        fail_create: bool,
        fail_start: bool,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl Environment for CountingEnv {
        fn name(&self) -> &str {
            "counting"
        }
        async fn create(&self) -> Result<(), EnvironmentError> {
            if self.fail_create {
                return Err(EnvironmentError::Provision {
                    name: "counting".to_string(),
                    reason: "image build failed".to_string(),
                });
            }
            Ok(())
        }
        async fn start(&self) -> Result<(), EnvironmentError> {
            if self.fail_start {
                return Err(EnvironmentError::Start {
                    name: "counting".to_string(),
                    reason: "port in use".to_string(),
                });
            }
            Ok(())
        }
        async fn stop(&self) -> Result<(), EnvironmentError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn run(&self, _: &str, _: bool) -> Result<CommandOutput, EnvironmentError> {
            Ok(CommandOutput::default())
        }
    }

    #[tokio::test]
    async fn release_stops_once() {
        let env = Arc::new(CountingEnv::default());
        let lease = EnvironmentLease::new(env.clone());
        lease.provision().await.unwrap();
        lease.release().await.unwrap();
        assert_eq!(env.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_start_still_tears_down() {
        let env = Arc::new(CountingEnv {
            fail_start: true,
            ..CountingEnv::default()
        });
        let lease = EnvironmentLease::new(env.clone());
        let err = lease.provision().await.unwrap_err();
        assert!(matches!(err, EnvironmentError::Start { .. }));
        lease.release().await.unwrap();
        assert_eq!(env.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_create_is_a_provision_error() {
        let env = Arc::new(CountingEnv {
            fail_create: true,
            ..CountingEnv::default()
        });
        let lease = EnvironmentLease::new(env.clone());
        let err = lease.provision().await.unwrap_err();
        assert!(matches!(err, EnvironmentError::Provision { .. }));
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_lease_still_stops() {
        let env = Arc::new(CountingEnv::default());
        let lease = EnvironmentLease::new(env.clone());
        lease.provision().await.unwrap();
        drop(lease);
        for _ in 0..10 {
            if env.stops.load(Ordering::SeqCst) == 1 {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("deferred stop never ran");
    }

    #[test]
    fn ports_are_derived_from_build_id() {
        let backend = DockerBackend::new(DockerConfig::default());
        assert_eq!(backend.ports(7), (15007, 18007));
        assert_eq!(backend.ports(1007), (15007, 18007));
        assert_ne!(backend.ports(7), backend.ports(8));
    }

    #[test]
    fn keep_tail_respects_char_boundaries() {
        let text = "é".repeat(10);
        let kept = keep_tail(&text, 5);
        assert!(kept.starts_with("...truncated...\n"));
        assert!(kept.ends_with('é'));
        assert_eq!(keep_tail("short", 64), "short");
    }
}
