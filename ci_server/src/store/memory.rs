//! In-process store used when no database is configured, and by tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::{AVERAGE_WINDOW, BuildStore};
use crate::error::{StoreError, StoreResult};
use crate::events::build::PipelineState;
use crate::models::build::CiBuild;
use crate::models::project::{CiProject, NewCiProject};
use crate::models::result::{BuildOutcome, CiBuildResult};
use crate::models::trigger::BuildRequest;

#[derive(Debug, Default)]
struct Tables {
    projects: Vec<CiProject>,
    builds: Vec<CiBuild>,
    /// Keyed by build id.
    results: HashMap<i64, CiBuildResult>,
    next_result_id: i64,
}

/// All tables behind one mutex; every operation is a single critical section.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl Tables {
    fn project_mut(&mut self, project_id: i64) -> StoreResult<&mut CiProject> {
        self.projects
            .iter_mut()
            .find(|p| p.id == project_id)
            .ok_or(StoreError::NotFound {
                entity: "project",
                id: project_id,
            })
    }

    fn build_mut(&mut self, build_id: i64) -> StoreResult<&mut CiBuild> {
        self.builds
            .iter_mut()
            .find(|b| b.id == build_id)
            .ok_or(StoreError::NotFound {
                entity: "build",
                id: build_id,
            })
    }

    fn refresh_average(&mut self, project_id: i64) -> StoreResult<()> {
        let mut finished: Vec<&CiBuild> = self
            .builds
            .iter()
            .filter(|b| b.project_id == project_id && b.duration_ms.is_some())
            .collect();
        finished.sort_by_key(|b| std::cmp::Reverse(b.build_number));
        let recent: Vec<i64> = finished
            .iter()
            .take(AVERAGE_WINDOW)
            .filter_map(|b| b.duration_ms.map(i64::from))
            .collect();
        let average = if recent.is_empty() {
            None
        } else {
            Some((recent.iter().sum::<i64>() / recent.len() as i64) as i32)
        };
        self.project_mut(project_id)?.average_time = average;
        Ok(())
    }
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn get_or_create_project(&self, new_project: NewCiProject) -> StoreResult<CiProject> {
        let mut tables = self.tables()?;
        if let Some(existing) = tables
            .projects
            .iter()
            .find(|p| p.owner == new_project.owner && p.name == new_project.name)
        {
            return Ok(existing.clone());
        }
        let now = Utc::now();
        let project = CiProject {
            id: tables.projects.len() as i64 + 1,
            owner: new_project.owner,
            name: new_project.name,
            git_repository: new_project.git_repository,
            private: new_project.private,
            approved: new_project.approved,
            average_time: None,
            last_build_number: 0,
            active: true,
            create_date: Some(now),
            write_date: Some(now),
        };
        tables.projects.push(project.clone());
        Ok(project)
    }

    async fn find_project(&self, owner: &str, name: &str) -> StoreResult<Option<CiProject>> {
        let tables = self.tables()?;
        Ok(tables
            .projects
            .iter()
            .find(|p| p.owner == owner && p.name == name)
            .cloned())
    }

    async fn get_project(&self, project_id: i64) -> StoreResult<CiProject> {
        let mut tables = self.tables()?;
        tables.project_mut(project_id).map(|p| p.clone())
    }

    async fn set_project_approved(&self, project_id: i64, approved: bool) -> StoreResult<()> {
        let mut tables = self.tables()?;
        let project = tables.project_mut(project_id)?;
        project.approved = approved;
        project.write_date = Some(Utc::now());
        Ok(())
    }

    async fn create_build(&self, project_id: i64, request: &BuildRequest) -> StoreResult<CiBuild> {
        let mut tables = self.tables()?;
        let project = tables.project_mut(project_id)?;
        project.last_build_number += 1;
        let build_number = project.last_build_number;

        let now = Utc::now();
        let build = CiBuild {
            id: tables.builds.len() as i64 + 1,
            project_id,
            build_number,
            branch: request.branch.clone(),
            sha: request.sha.clone(),
            pull_request_id: request.pull_request_id,
            state: PipelineState::Created.as_str().to_string(),
            started_at: None,
            finished_at: None,
            duration_ms: None,
            create_date: Some(now),
            write_date: Some(now),
        };
        tables.builds.push(build.clone());
        Ok(build)
    }

    async fn get_build(&self, build_id: i64) -> StoreResult<Option<CiBuild>> {
        let tables = self.tables()?;
        Ok(tables.builds.iter().find(|b| b.id == build_id).cloned())
    }

    async fn find_build_by_number(
        &self,
        project_id: i64,
        build_number: i32,
    ) -> StoreResult<Option<CiBuild>> {
        let tables = self.tables()?;
        Ok(tables
            .builds
            .iter()
            .find(|b| b.project_id == project_id && b.build_number == build_number)
            .cloned())
    }

    async fn latest_build_for_pull_request(
        &self,
        project_id: i64,
        pull_request_id: i32,
    ) -> StoreResult<Option<CiBuild>> {
        let tables = self.tables()?;
        Ok(tables
            .builds
            .iter()
            .filter(|b| b.project_id == project_id && b.pull_request_id == pull_request_id)
            .max_by_key(|b| b.build_number)
            .cloned())
    }

    async fn list_builds(&self, project_id: i64) -> StoreResult<Vec<CiBuild>> {
        let tables = self.tables()?;
        let mut builds: Vec<CiBuild> = tables
            .builds
            .iter()
            .filter(|b| b.project_id == project_id)
            .cloned()
            .collect();
        builds.sort_by_key(|b| b.build_number);
        Ok(builds)
    }

    async fn update_build_state(&self, build_id: i64, state: PipelineState) -> StoreResult<()> {
        let mut tables = self.tables()?;
        let build = tables.build_mut(build_id)?;
        let now = Utc::now();
        if state == PipelineState::Provisioning {
            build.started_at = Some(now);
        }
        build.state = state.as_str().to_string();
        build.write_date = Some(now);
        Ok(())
    }

    async fn finish_build(
        &self,
        build_id: i64,
        state: PipelineState,
        duration_ms: i32,
    ) -> StoreResult<()> {
        let mut tables = self.tables()?;
        let build = tables.build_mut(build_id)?;
        let now = Utc::now();
        build.state = state.as_str().to_string();
        build.finished_at = Some(now);
        build.duration_ms = Some(duration_ms);
        build.write_date = Some(now);
        let project_id = build.project_id;
        tables.refresh_average(project_id)
    }

    async fn create_result(
        &self,
        build_id: i64,
        outcome: &BuildOutcome,
    ) -> StoreResult<CiBuildResult> {
        let mut tables = self.tables()?;
        tables.build_mut(build_id)?;
        tables.next_result_id += 1;
        let now = Utc::now();
        let result = CiBuildResult {
            id: tables.next_result_id,
            build_id,
            succeeded: outcome.succeeded,
            result_log: outcome.log.clone(),
            return_codes: outcome.return_codes(),
            create_date: Some(now),
            write_date: Some(now),
        };
        tables.results.insert(build_id, result.clone());
        Ok(result)
    }

    async fn save_result(&self, build_id: i64, outcome: &BuildOutcome) -> StoreResult<()> {
        let mut tables = self.tables()?;
        let result = tables
            .results
            .get_mut(&build_id)
            .ok_or(StoreError::NotFound {
                entity: "result",
                id: build_id,
            })?;
        result.succeeded = outcome.succeeded;
        result.result_log = outcome.log.clone();
        result.return_codes = outcome.return_codes();
        result.write_date = Some(Utc::now());
        Ok(())
    }

    async fn get_result(&self, build_id: i64) -> StoreResult<Option<CiBuildResult>> {
        let tables = self.tables()?;
        Ok(tables.results.get(&build_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::models::trigger::repository_url;

    fn request(pull_request_id: i32, sha: &str) -> BuildRequest {
        BuildRequest {
            repo_url: repository_url("acme", "widgets"),
            repo_owner: "acme".to_string(),
            repo_name: "widgets".to_string(),
            private: false,
            pull_request_id,
            branch: "master".to_string(),
            sha: sha.to_string(),
        }
    }

    async fn project(store: &MemoryStore) -> CiProject {
        let new = NewCiProject::from_url(&repository_url("acme", "widgets"), false, true).unwrap();
        store.get_or_create_project(new).await.unwrap()
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let store = MemoryStore::new();
        let first = project(&store).await;
        let second = project(&store).await;
        assert_eq!(first.id, second.id);
        assert_eq!(first.last_build_number, 0);
    }

    #[tokio::test]
    async fn build_numbers_increase_by_one() {
        let store = MemoryStore::new();
        let project = project(&store).await;
        for expected in 1..=3 {
            let build = store.create_build(project.id, &request(0, "abc")).await.unwrap();
            assert_eq!(build.build_number, expected);
        }
        assert_eq!(store.get_project(project.id).await.unwrap().last_build_number, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_builds_never_share_a_number() {
        let store = Arc::new(MemoryStore::new());
        let project = project(&store).await;

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .create_build(project.id, &request(0, &format!("sha{i}")))
                        .await
                        .unwrap()
                        .build_number
                })
            })
            .collect();

        let mut numbers = Vec::new();
        for handle in handles {
            numbers.push(handle.await.unwrap());
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn latest_build_for_pull_request_picks_highest_number() {
        let store = MemoryStore::new();
        let project = project(&store).await;
        store.create_build(project.id, &request(4, "old")).await.unwrap();
        store.create_build(project.id, &request(0, "branch")).await.unwrap();
        store.create_build(project.id, &request(4, "new")).await.unwrap();

        let latest = store
            .latest_build_for_pull_request(project.id, 4)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.sha, "new");
        assert!(store.latest_build_for_pull_request(project.id, 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finish_build_refreshes_average_time() {
        let store = MemoryStore::new();
        let project = project(&store).await;
        let a = store.create_build(project.id, &request(0, "a")).await.unwrap();
        let b = store.create_build(project.id, &request(0, "b")).await.unwrap();

        store.finish_build(a.id, PipelineState::Done, 1000).await.unwrap();
        assert_eq!(store.get_project(project.id).await.unwrap().average_time, Some(1000));

        store.finish_build(b.id, PipelineState::Errored, 3000).await.unwrap();
        assert_eq!(store.get_project(project.id).await.unwrap().average_time, Some(2000));
    }

    #[tokio::test]
    async fn save_result_requires_existing_result() {
        let store = MemoryStore::new();
        let project = project(&store).await;
        let build = store.create_build(project.id, &request(0, "a")).await.unwrap();

        let outcome = BuildOutcome::default().record_task("true", "", 0);
        assert!(matches!(
            store.save_result(build.id, &outcome).await,
            Err(StoreError::NotFound { entity: "result", .. })
        ));

        store.create_result(build.id, &BuildOutcome::default()).await.unwrap();
        store.save_result(build.id, &outcome).await.unwrap();
        let stored = store.get_result(build.id).await.unwrap().unwrap();
        assert!(stored.succeeded);
        assert_eq!(stored.return_codes, "0");
    }
}
