//! In-process fakes for the environment backend and the reporter.
//!
//! `FakeBackend` answers commands from a script of substring rules and records
//! every call; `RecordingReporter` records every outbound report.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::EnvironmentError;
use crate::services::environment_service::{CommandOutput, Environment, EnvironmentBackend};
use crate::services::orchestrator::PipelineReport;
use crate::services::reporter::{BuildTarget, CommitState, Reporter, WebhookPayload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvCall {
    Create(String),
    Start(String),
    Stop(String),
    Run { env: String, command: String, capture: bool },
}

#[derive(Debug, Clone)]
enum Behavior {
    Exit(i32, String),
    Hang,
    BreakChannel,
}

#[derive(Default)]
struct Script {
    rules: Vec<(String, Behavior)>,
    fail_create: bool,
    fail_start: bool,
}

#[derive(Default)]
struct Inner {
    script: Mutex<Script>,
    calls: Mutex<Vec<EnvCall>>,
}

/// Scripted environment backend. Commands matching no rule exit 0 silently.
#[derive(Clone, Default)]
pub struct FakeBackend {
    inner: Arc<Inner>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn rule(self, pattern: &str, behavior: Behavior) -> Self {
        self.inner
            .script
            .lock()
            .unwrap()
            .rules
            .push((pattern.to_string(), behavior));
        self
    }

    /// Serve `yaml` as the repository's configuration file.
    pub fn with_config(self, yaml: &str) -> Self {
        self.rule("cat '", Behavior::Exit(0, yaml.to_string()))
    }

    pub fn without_config(self) -> Self {
        self.rule("cat '", Behavior::Exit(1, "cat: No such file or directory\n".to_string()))
    }

    /// Commands containing `pattern` exit with `exit_code` and print `output`.
    pub fn on(self, pattern: &str, exit_code: i32, output: &str) -> Self {
        self.rule(pattern, Behavior::Exit(exit_code, output.to_string()))
    }

    /// Commands containing `pattern` never return.
    pub fn hang_on(self, pattern: &str) -> Self {
        self.rule(pattern, Behavior::Hang)
    }

    /// Commands containing `pattern` fail at the command channel.
    pub fn break_channel_on(self, pattern: &str) -> Self {
        self.rule(pattern, Behavior::BreakChannel)
    }

    pub fn fail_create(self) -> Self {
        self.inner.script.lock().unwrap().fail_create = true;
        self
    }

    pub fn fail_start(self) -> Self {
        self.inner.script.lock().unwrap().fail_start = true;
        self
    }

    pub fn calls(&self) -> Vec<EnvCall> {
        self.inner.calls.lock().unwrap().clone()
    }

    /// Commands run, in order.
    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EnvCall::Run { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    pub fn created(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                EnvCall::Create(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn stops(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, EnvCall::Stop(_)))
            .count()
    }
}

impl EnvironmentBackend for FakeBackend {
    fn environment(&self, name: &str, _build_id: i64) -> Arc<dyn Environment> {
        Arc::new(FakeEnvironment {
            name: name.to_string(),
            inner: Arc::clone(&self.inner),
        })
    }
}

struct FakeEnvironment {
    name: String,
    inner: Arc<Inner>,
}

impl FakeEnvironment {
    fn record(&self, call: EnvCall) {
        self.inner.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Environment for FakeEnvironment {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create(&self) -> Result<(), EnvironmentError> {
        self.record(EnvCall::Create(self.name.clone()));
        if self.inner.script.lock().unwrap().fail_create {
            return Err(EnvironmentError::Provision {
                name: self.name.clone(),
                reason: "image build failed".to_string(),
            });
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), EnvironmentError> {
        self.record(EnvCall::Start(self.name.clone()));
        if self.inner.script.lock().unwrap().fail_start {
            return Err(EnvironmentError::Start {
                name: self.name.clone(),
                reason: "port already allocated".to_string(),
            });
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), EnvironmentError> {
        self.record(EnvCall::Stop(self.name.clone()));
        Ok(())
    }

    async fn run(&self, command: &str, capture: bool) -> Result<CommandOutput, EnvironmentError> {
        self.record(EnvCall::Run {
            env: self.name.clone(),
            command: command.to_string(),
            capture,
        });
        let behavior = self
            .inner
            .script
            .lock()
            .unwrap()
            .rules
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, behavior)| behavior.clone());

        match behavior {
            None => Ok(CommandOutput::default()),
            Some(Behavior::Exit(exit_code, output)) => Ok(CommandOutput {
                exit_code,
                output: if capture { output } else { String::new() },
            }),
            Some(Behavior::Hang) => std::future::pending().await,
            Some(Behavior::BreakChannel) => Err(EnvironmentError::Command {
                name: self.name.clone(),
                reason: "connection reset by peer".to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportCall {
    Status {
        sha: String,
        state: CommitState,
        description: String,
    },
    Comment {
        sha: String,
        body: String,
    },
    Webhook {
        url: String,
        payload: WebhookPayload,
    },
}

/// Reporter that records every call. Webhooks to URLs containing
/// `fail_pattern` return an error after being recorded.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    calls: Arc<Mutex<Vec<ReportCall>>>,
    fail_pattern: Option<String>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_webhooks(pattern: &str) -> Self {
        Self {
            calls: Arc::default(),
            fail_pattern: Some(pattern.to_string()),
        }
    }

    pub fn calls(&self) -> Vec<ReportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<CommitState> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ReportCall::Status { state, .. } => Some(state),
                _ => None,
            })
            .collect()
    }

    pub fn comments(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ReportCall::Comment { body, .. } => Some(body),
                _ => None,
            })
            .collect()
    }

    pub fn webhooks(&self) -> Vec<(String, WebhookPayload)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ReportCall::Webhook { url, payload } => Some((url, payload)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Reporter for RecordingReporter {
    async fn set_commit_status(
        &self,
        target: &BuildTarget,
        state: CommitState,
        description: &str,
    ) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(ReportCall::Status {
            sha: target.sha.clone(),
            state,
            description: description.to_string(),
        });
        Ok(())
    }

    async fn post_comment(&self, target: &BuildTarget, body: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(ReportCall::Comment {
            sha: target.sha.clone(),
            body: body.to_string(),
        });
        Ok(())
    }

    async fn send_webhook(&self, url: &str, payload: &WebhookPayload) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(ReportCall::Webhook {
            url: url.to_string(),
            payload: payload.clone(),
        });
        match &self.fail_pattern {
            Some(pattern) if url.contains(pattern.as_str()) => {
                anyhow::bail!("connection refused")
            }
            _ => Ok(()),
        }
    }
}

/// Wait up to five seconds for the report of `build_id`.
pub async fn wait_for_report(
    rx: &mut broadcast::Receiver<PipelineReport>,
    build_id: i64,
) -> PipelineReport {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(report) if report.build_id == build_id => return report,
                Ok(_) => continue,
                Err(e) => panic!("results channel failed: {e}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no report for build {build_id}"))
}
