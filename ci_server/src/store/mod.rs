//! Persistence of projects, builds and results.
//!
//! The orchestrator only talks to [`BuildStore`]; `PgStore` backs it with
//! PostgreSQL, `MemoryStore` keeps everything in process.

pub mod memory;
pub mod pg;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::events::build::PipelineState;
use crate::models::build::CiBuild;
use crate::models::project::{CiProject, NewCiProject};
use crate::models::result::{BuildOutcome, CiBuildResult};
use crate::models::trigger::BuildRequest;

pub use memory::MemoryStore;
pub use pg::PgStore;

/// Number of recent finished builds averaged into `CiProject::average_time`.
pub const AVERAGE_WINDOW: usize = 5;

#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Return the project with this owner/name, inserting `new_project` if unseen.
    async fn get_or_create_project(&self, new_project: NewCiProject) -> StoreResult<CiProject>;

    async fn find_project(&self, owner: &str, name: &str) -> StoreResult<Option<CiProject>>;

    async fn get_project(&self, project_id: i64) -> StoreResult<CiProject>;

    async fn set_project_approved(&self, project_id: i64, approved: bool) -> StoreResult<()>;

    /// Insert a build numbered `last_build_number + 1`.
    ///
    /// The increment and the insert are one atomic step, so concurrent
    /// calls for the same project never share a number.
    async fn create_build(&self, project_id: i64, request: &BuildRequest) -> StoreResult<CiBuild>;

    async fn get_build(&self, build_id: i64) -> StoreResult<Option<CiBuild>>;

    async fn find_build_by_number(
        &self,
        project_id: i64,
        build_number: i32,
    ) -> StoreResult<Option<CiBuild>>;

    async fn latest_build_for_pull_request(
        &self,
        project_id: i64,
        pull_request_id: i32,
    ) -> StoreResult<Option<CiBuild>>;

    /// Builds of a project, lowest number first.
    async fn list_builds(&self, project_id: i64) -> StoreResult<Vec<CiBuild>>;

    /// Persist a pipeline transition. Entering `Provisioning` stamps `started_at`.
    async fn update_build_state(&self, build_id: i64, state: PipelineState) -> StoreResult<()>;

    /// Persist the terminal state and duration, then refresh the project's average.
    async fn finish_build(
        &self,
        build_id: i64,
        state: PipelineState,
        duration_ms: i32,
    ) -> StoreResult<()>;

    async fn create_result(
        &self,
        build_id: i64,
        outcome: &BuildOutcome,
    ) -> StoreResult<CiBuildResult>;

    async fn save_result(&self, build_id: i64, outcome: &BuildOutcome) -> StoreResult<()>;

    async fn get_result(&self, build_id: i64) -> StoreResult<Option<CiBuildResult>>;
}
