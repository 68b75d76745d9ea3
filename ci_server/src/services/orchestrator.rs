//! Build orchestration: admission, the worker pool, and the pipeline itself.
//!
//! `start` numbers and persists the build, then queues it on a bounded
//! channel drained by a fixed set of workers. Each pipeline walks
//! `Provisioning → Cloned → Configured → Running → Reported → Done` and ends
//! in `Errored` on any fatal error, timeout or cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::CiConfig;
use crate::error::{OrchestratorError, PipelineError};
use crate::events::build::{BuildLifecycle, PipelineState};
use crate::models::build::CiBuild;
use crate::models::project::{CiProject, NewCiProject};
use crate::models::result::BuildOutcome;
use crate::models::trigger::{BuildRequest, RetestRequest};
use crate::services::config_loader::{self, BuildConfiguration};
use crate::services::environment_service::{Environment, EnvironmentBackend, EnvironmentLease};
use crate::services::reporter::{
    outcome_description, BuildTarget, CommitState, Reporter, WebhookPayload,
};
use crate::services::task_runner::{run_command, shell_quote, TaskRunner};
use crate::store::BuildStore;

const RESULTS_CAPACITY: usize = 64;

/// Sent on the results channel when a pipeline finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub build_id: i64,
    pub state: PipelineState,
    /// `None` when the build never produced a result.
    pub succeeded: Option<bool>,
}

struct Job {
    project: CiProject,
    build: CiBuild,
    token: CancellationToken,
}

/// How far a pipeline got; read after it finished, timed out or was cancelled.
#[derive(Default)]
struct Progress {
    lifecycle: BuildLifecycle,
    config: Option<BuildConfiguration>,
    result_created: bool,
}

struct Shared {
    store: Arc<dyn BuildStore>,
    backend: Arc<dyn EnvironmentBackend>,
    reporter: Arc<dyn Reporter>,
    config: Arc<CiConfig>,
    running: Mutex<HashMap<i64, CancellationToken>>,
    results: broadcast::Sender<PipelineReport>,
    queued: AtomicUsize,
    shutdown: CancellationToken,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    queue: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Orchestrator {
    /// Create the orchestrator and spawn its workers on the current runtime.
    pub fn spawn(
        store: Arc<dyn BuildStore>,
        backend: Arc<dyn EnvironmentBackend>,
        reporter: Arc<dyn Reporter>,
        config: Arc<CiConfig>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (results, _) = broadcast::channel(RESULTS_CAPACITY);
        let workers = config.workers.max(1);

        let shared = Arc::new(Shared {
            store,
            backend,
            reporter,
            config,
            running: Mutex::new(HashMap::new()),
            results,
            queued: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
        });

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handles = (0..workers)
            .map(|index| tokio::spawn(worker(index, Arc::clone(&shared), Arc::clone(&rx))))
            .collect();

        tracing::info!(workers, queue_capacity = shared.config.queue_capacity, "Build orchestrator started");

        Self {
            shared,
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
        }
    }

    pub fn store(&self) -> &Arc<dyn BuildStore> {
        &self.shared.store
    }

    pub fn config(&self) -> &CiConfig {
        &self.shared.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineReport> {
        self.shared.results.subscribe()
    }

    /// Find or register the project of `request`, then start a build.
    pub async fn submit(&self, request: &BuildRequest) -> Result<CiBuild, OrchestratorError> {
        let project = self.project_for(&request.repo_url, request.private).await?;
        self.start(&project, request).await
    }

    /// Rebuild the revision of the latest build of a pull request.
    ///
    /// `Ok(None)` when the pull request has never been built.
    pub async fn retest(&self, request: RetestRequest) -> Result<Option<CiBuild>, OrchestratorError> {
        let Some(project) = self
            .shared
            .store
            .find_project(&request.repo_owner, &request.repo_name)
            .await?
        else {
            return Ok(None);
        };
        let Some(previous) = self
            .shared
            .store
            .latest_build_for_pull_request(project.id, request.pull_request_id)
            .await?
        else {
            tracing::info!(
                project = %project,
                pull_request_id = request.pull_request_id,
                "Retest requested for a pull request without builds"
            );
            return Ok(None);
        };
        let request = request.resolve(previous.branch, previous.sha);
        self.start(&project, &request).await.map(Some)
    }

    async fn project_for(&self, repo_url: &str, private: bool) -> Result<CiProject, OrchestratorError> {
        let Some(new_project) = NewCiProject::from_url(repo_url, private, false) else {
            return Err(OrchestratorError::InvalidRepository(repo_url.to_string()));
        };
        let approved = self.shared.config.is_auto_approved(&new_project.owner);
        let project = self
            .shared
            .store
            .get_or_create_project(NewCiProject {
                approved,
                ..new_project
            })
            .await?;
        Ok(project)
    }

    /// Create a build for `request` and queue its pipeline.
    ///
    /// Unapproved projects get a numbered build with a failed result and no
    /// pipeline. Returns without waiting for the pipeline.
    pub async fn start(
        &self,
        project: &CiProject,
        request: &BuildRequest,
    ) -> Result<CiBuild, OrchestratorError> {
        let store = &self.shared.store;

        if !project.approved {
            let build = store.create_build(project.id, request).await?;
            store.create_result(build.id, &BuildOutcome::not_approved()).await?;
            store.update_build_state(build.id, PipelineState::Errored).await?;
            tracing::info!(build_id = build.id, project = %project, "Project not approved, build skipped");
            crate::metrics::error_recorded(PipelineError::NotApproved.category());
            crate::metrics::build_status_changed(PipelineState::Errored.as_str());
            let _ = self.shared.results.send(PipelineReport {
                build_id: build.id,
                state: PipelineState::Errored,
                succeeded: Some(false),
            });
            return Ok(build);
        }

        // The slot is reserved before the build exists; a full queue creates nothing.
        let sender = lock(&self.queue).clone().ok_or(OrchestratorError::ShuttingDown)?;
        let permit = sender.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => OrchestratorError::QueueFull,
            mpsc::error::TrySendError::Closed(()) => OrchestratorError::ShuttingDown,
        })?;

        let build = store.create_build(project.id, request).await?;
        let token = self.shared.register(build.id)?;

        tracing::info!(
            build_id = build.id,
            build_number = build.build_number,
            project = %project,
            branch = %build.branch,
            "Build queued"
        );
        crate::metrics::build_status_changed(PipelineState::Created.as_str());
        let depth = self.shared.queued.fetch_add(1, Ordering::SeqCst) + 1;
        crate::metrics::queue_depth(depth);

        permit.send(Job {
            project: project.clone(),
            build: build.clone(),
            token,
        });
        Ok(build)
    }

    /// Signal the pipeline of `build_id` to stop. `false` if it is not running.
    pub fn cancel(&self, build_id: i64) -> bool {
        match lock(&self.shared.running).get(&build_id) {
            Some(token) => {
                tracing::info!(build_id, "Cancelling build");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, build_id: i64) -> bool {
        lock(&self.shared.running).contains_key(&build_id)
    }

    /// Stop accepting builds, cancel the running ones and wait for every worker.
    pub async fn shutdown(&self) {
        lock(&self.queue).take();
        self.shared.shutdown.cancel();
        let handles: Vec<_> = lock(&self.workers).drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("pipeline worker panicked: {e}");
            }
        }
        tracing::info!("Build orchestrator stopped");
    }
}

async fn worker(index: usize, shared: Arc<Shared>, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = rx.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };
        let depth = shared.queued.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        crate::metrics::queue_depth(depth);

        let span = tracing::info_span!(
            "pipeline",
            worker = index,
            build_id = job.build.id,
            project = %job.project,
        );
        shared.run_pipeline(job).instrument(span).await;
    }
    tracing::debug!(worker = index, "Pipeline worker exiting");
}

impl Shared {
    fn register(&self, build_id: i64) -> Result<CancellationToken, OrchestratorError> {
        let mut running = lock(&self.running);
        if running.contains_key(&build_id) {
            return Err(OrchestratorError::AlreadyRunning(build_id));
        }
        let token = self.shutdown.child_token();
        running.insert(build_id, token.clone());
        Ok(token)
    }

    fn target(&self, project: &CiProject, build: &CiBuild) -> BuildTarget {
        BuildTarget {
            build_id: build.id,
            repo: project.full_name(),
            git_repository: project.git_repository.clone(),
            sha: build.sha.clone(),
            build_url: self
                .config
                .build_url(&project.owner, &project.name, build.build_number),
            pull_request_id: build.pull_request_id,
        }
    }

    async fn run_pipeline(&self, job: Job) {
        let Job {
            project,
            build,
            token,
        } = job;
        let started = Instant::now();
        let target = self.target(&project, &build);
        let working_dir = build.working_directory(&self.config.workspace_dir, &project);
        let env = self
            .backend
            .environment(&build.environment_name(&project), build.id);
        let lease = EnvironmentLease::new(env);
        let mut progress = Progress::default();
        let deadline = self.config.pipeline_timeout;

        let result = tokio::select! {
            biased;
            () = token.cancelled() => Err(PipelineError::Cancelled),
            () = tokio::time::sleep(deadline) => Err(PipelineError::Timeout(deadline)),
            r = self.drive(&project, &build, &target, &lease, &working_dir, &mut progress) => r,
        };

        // A stuck or cancelled environment goes away before anything is reported.
        let lease = match &result {
            Err(PipelineError::Timeout(_) | PipelineError::Cancelled) => {
                release(lease).await;
                None
            }
            _ => Some(lease),
        };

        let (state, succeeded) = self.finalize(&target, &mut progress, result).await;

        if let Some(lease) = lease {
            release(lease).await;
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        if let Err(e) = self
            .store
            .finish_build(build.id, state, i32::try_from(duration_ms).unwrap_or(i32::MAX))
            .await
        {
            tracing::error!(build_id = build.id, "could not record build end: {e}");
        }
        lock(&self.running).remove(&build.id);

        crate::metrics::build_status_changed(state.as_str());
        crate::metrics::build_duration(duration_ms);
        tracing::info!(build_id = build.id, state = %state, duration_ms, "Build finished");

        let _ = self.results.send(PipelineReport {
            build_id: build.id,
            state,
            succeeded,
        });
    }

    async fn advance(
        &self,
        build_id: i64,
        progress: &mut Progress,
        next: PipelineState,
    ) -> Result<(), PipelineError> {
        progress
            .lifecycle
            .advance(next)
            .map_err(|e| PipelineError::Task(e.to_string()))?;
        self.store.update_build_state(build_id, next).await?;
        tracing::debug!(build_id, state = %next, "Pipeline state");
        Ok(())
    }

    /// Provision, clone, configure, announce and run the tasks.
    async fn drive(
        &self,
        project: &CiProject,
        build: &CiBuild,
        target: &BuildTarget,
        lease: &EnvironmentLease,
        working_dir: &str,
        progress: &mut Progress,
    ) -> Result<BuildOutcome, PipelineError> {
        let timeout = self.config.command_timeout;
        let env = lease.environment();

        self.advance(build.id, progress, PipelineState::Provisioning).await?;
        lease.provision().await?;

        self.checkout(env, project, build, working_dir).await?;
        self.advance(build.id, progress, PipelineState::Cloned).await?;

        let config = config_loader::load(env, working_dir, &self.config.config_file, timeout).await?;
        progress.config = Some(config.clone());
        self.advance(build.id, progress, PipelineState::Configured).await?;

        self.status(target, CommitState::Pending, "Build started").await;

        self.store.create_result(build.id, &BuildOutcome::default()).await?;
        progress.result_created = true;
        self.advance(build.id, progress, PipelineState::Running).await?;

        TaskRunner::new(env, self.store.as_ref(), build.id, working_dir, timeout)
            .run_tasks(&config.tasks, BuildOutcome::default())
            .await
    }

    async fn checkout(
        &self,
        env: &dyn Environment,
        project: &CiProject,
        build: &CiBuild,
        working_dir: &str,
    ) -> Result<(), PipelineError> {
        let token = &self.config.github_token;
        let clone_url = project.clone_url(token);
        for command in checkout_commands(build, &clone_url, working_dir) {
            let output = run_command(env, &command, true, self.config.command_timeout).await?;
            if !output.success() {
                return Err(PipelineError::Clone(redact(
                    &format!(
                        "`{command}` exited with {}: {}",
                        output.exit_code,
                        output.output.trim()
                    ),
                    token,
                )));
            }
        }
        Ok(())
    }

    /// Report a pipeline whose tasks ran to a verdict.
    async fn report_outcome(
        &self,
        target: &BuildTarget,
        progress: &mut Progress,
        outcome: BuildOutcome,
    ) -> (PipelineState, Option<bool>) {
        self.status(
            target,
            CommitState::from_outcome(&outcome),
            outcome_description(&outcome),
        )
        .await;
        if let Some(config) = &progress.config {
            if config.comment {
                self.comment(target, &outcome.comment_message(&target.build_url))
                    .await;
            }
            self.notify(target, config, &outcome).await;
        }

        let state = match progress.lifecycle.advance(PipelineState::Reported) {
            Ok(_) => PipelineState::Done,
            Err(e) => {
                tracing::error!(build_id = target.build_id, "{e}");
                PipelineState::Errored
            }
        };
        if let Err(e) = self
            .store
            .update_build_state(target.build_id, PipelineState::Reported)
            .await
        {
            tracing::warn!(build_id = target.build_id, "could not record reported state: {e}");
        }
        (state, Some(outcome.succeeded))
    }

    /// Record and report a pipeline that stopped on an error.
    async fn finalize(
        &self,
        target: &BuildTarget,
        progress: &mut Progress,
        result: Result<BuildOutcome, PipelineError>,
    ) -> (PipelineState, Option<bool>) {
        let build_id = target.build_id;
        let err = match result {
            Ok(outcome) => return self.report_outcome(target, progress, outcome).await,
            Err(err) => err,
        };
        crate::metrics::error_recorded(err.category());
        tracing::warn!(build_id, category = err.category(), "Pipeline stopped: {err}");

        if let PipelineError::ConfigurationMissing(_) = err {
            let body = config_loader::missing_comment(&self.config.config_file, &err);
            self.comment(target, &body).await;
            return (PipelineState::Errored, None);
        }

        let reason = err.to_string();
        let (failed, saved) = if progress.result_created {
            // Tasks that already ran stay in the log; the reason is appended.
            let partial = match self.store.get_result(build_id).await {
                Ok(stored) => stored.map(|r| r.outcome()).unwrap_or_default(),
                Err(e) => {
                    tracing::warn!(build_id, "could not load partial result: {e}");
                    BuildOutcome::default()
                }
            };
            let failed = partial.interrupted(&reason);
            let saved = self.store.save_result(build_id, &failed).await;
            (failed, saved)
        } else {
            let failed = BuildOutcome::failed(reason);
            let saved = self.store.create_result(build_id, &failed).await.map(|_| ());
            (failed, saved)
        };
        if let Err(e) = saved {
            tracing::error!(build_id, "could not record failed result: {e}");
        }

        self.status(target, CommitState::Error, &err.to_string()).await;

        if let Some(config) = &progress.config {
            if config.comment {
                let body = format!(
                    "I was not able to perform the tests. Sorry.\n\nMore information:\n\n{err}"
                );
                self.comment(target, &body).await;
            }
            self.notify(target, config, &failed).await;
        }

        (PipelineState::Errored, Some(false))
    }

    async fn status(&self, target: &BuildTarget, state: CommitState, description: &str) {
        if let Err(e) = self
            .reporter
            .set_commit_status(target, state, description)
            .await
        {
            tracing::warn!(build_id = target.build_id, state = %state, "commit status failed: {e}");
        }
    }

    async fn comment(&self, target: &BuildTarget, body: &str) {
        if let Err(e) = self.reporter.post_comment(target, body).await {
            tracing::warn!(build_id = target.build_id, "comment failed: {e}");
        }
    }

    /// One delivery per configured URL; failures are logged and dropped.
    async fn notify(&self, target: &BuildTarget, config: &BuildConfiguration, outcome: &BuildOutcome) {
        let payload = WebhookPayload::new(target, outcome);
        for url in &config.webhooks {
            match self.reporter.send_webhook(url, &payload).await {
                Ok(()) => crate::metrics::webhook_delivered(true),
                Err(e) => {
                    crate::metrics::webhook_delivered(false);
                    tracing::warn!(build_id = target.build_id, url = %url, "webhook delivery failed: {e}");
                }
            }
        }
    }
}

async fn release(lease: EnvironmentLease) {
    let name = lease.environment().name().to_string();
    if let Err(e) = lease.release().await {
        tracing::error!(environment = %name, "environment teardown failed: {e}");
    }
}

/// Shell commands that leave `working_dir` at the revision of `build`.
pub fn checkout_commands(build: &CiBuild, clone_url: &str, working_dir: &str) -> Vec<String> {
    let dir = shell_quote(working_dir);
    let parent = working_dir
        .trim_end_matches('/')
        .rsplit_once('/')
        .map(|(parent, _)| parent)
        .filter(|parent| !parent.is_empty())
        .unwrap_or("/");

    let mut commands = vec![
        format!("rm -rf {dir}"),
        format!("mkdir -p {}", shell_quote(parent)),
        format!(
            "git clone --depth=1 --no-single-branch {} {dir}",
            shell_quote(clone_url)
        ),
    ];

    if build.is_pull_request() {
        commands.push(format!(
            "cd {dir} && git fetch -q --depth=1 origin {} && git checkout -qf FETCH_HEAD",
            shell_quote(&format!("pull/{}/head", build.pull_request_id))
        ));
    } else {
        commands.push(format!(
            "cd {dir} && git checkout -q {}",
            shell_quote(&build.branch)
        ));
    }
    // The branch or pull head may have moved since the event; pin the reported revision.
    if !build.sha.is_empty() {
        let sha = shell_quote(&build.sha);
        commands.push(format!(
            "cd {dir} && (git checkout -qf {sha} || (git fetch -q --depth=1 origin {sha} && git checkout -qf FETCH_HEAD))"
        ));
    }
    commands
}

fn redact(text: &str, secret: &str) -> String {
    if secret.is_empty() {
        text.to_string()
    } else {
        text.replace(secret, "***")
    }
}
