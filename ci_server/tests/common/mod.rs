#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ci_server::config::CiConfig;
use ci_server::fakes::{wait_for_report, FakeBackend, RecordingReporter};
use ci_server::models::build::CiBuild;
use ci_server::models::trigger::{repository_url, BuildRequest};
use ci_server::services::orchestrator::{Orchestrator, PipelineReport};
use ci_server::store::{BuildStore, MemoryStore};

pub const SHA: &str = "6ab4d34e2f0c1b5d";

pub fn test_config() -> CiConfig {
    CiConfig {
        dashboard_url: "http://ci.test".to_string(),
        auto_approve_owners: vec!["acme".to_string()],
        workers: 2,
        queue_capacity: 8,
        command_timeout: Duration::from_secs(5),
        pipeline_timeout: Duration::from_secs(10),
        webhook_timeout: Duration::from_secs(1),
        ..CiConfig::default()
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<MemoryStore>,
    pub backend: FakeBackend,
    pub reporter: RecordingReporter,
}

impl Harness {
    pub fn new(backend: FakeBackend) -> Self {
        Self::with(test_config(), backend, RecordingReporter::new())
    }

    pub fn with(config: CiConfig, backend: FakeBackend, reporter: RecordingReporter) -> Self {
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Arc::new(Orchestrator::spawn(
            Arc::clone(&store) as Arc<dyn BuildStore>,
            Arc::new(backend.clone()),
            Arc::new(reporter.clone()),
            Arc::new(config),
        ));
        Self {
            orchestrator,
            store,
            backend,
            reporter,
        }
    }

    /// Submit `request` and wait for its pipeline to finish.
    pub async fn run(&self, request: &BuildRequest) -> (CiBuild, PipelineReport) {
        let mut rx = self.orchestrator.subscribe();
        let build = self
            .orchestrator
            .submit(request)
            .await
            .expect("build accepted");
        let report = wait_for_report(&mut rx, build.id).await;
        (build, report)
    }
}

pub fn push(owner: &str, name: &str) -> BuildRequest {
    BuildRequest {
        repo_url: repository_url(owner, name),
        repo_owner: owner.to_string(),
        repo_name: name.to_string(),
        private: false,
        pull_request_id: 0,
        branch: "master".to_string(),
        sha: SHA.to_string(),
    }
}

pub fn pull_request(owner: &str, name: &str, number: i32, sha: &str) -> BuildRequest {
    BuildRequest {
        pull_request_id: number,
        branch: "feature/login".to_string(),
        sha: sha.to_string(),
        ..push(owner, name)
    }
}

/// YAML configuration running `tasks` with the given extras appended.
pub fn yaml(tasks: &[&str], extra: &str) -> String {
    let mut text = String::from("tasks:\n");
    for task in tasks {
        text.push_str(&format!("  - \"{task}\"\n"));
    }
    text.push_str(extra);
    text
}

/// Poll until `check` holds, for at most five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}
