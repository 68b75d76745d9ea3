//! PostgreSQL store over a diesel-async deadpool.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};

use super::{AVERAGE_WINDOW, BuildStore};
use crate::error::{StoreError, StoreResult};
use crate::events::build::PipelineState;
use crate::models::build::{CiBuild, NewCiBuild};
use crate::models::project::{CiProject, NewCiProject};
use crate::models::result::{BuildOutcome, CiBuildResult, NewCiBuildResult};
use crate::models::trigger::BuildRequest;
use crate::schema::{ci_build_results, ci_builds, ci_projects};

pub type PgPool = Pool<AsyncPgConnection>;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Pool for `database_url`; connections are opened lazily.
    pub fn connect(database_url: &str) -> anyhow::Result<Self> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder(manager)
            .build()
            .map_err(|e| anyhow::anyhow!("diesel pool: {e}"))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn conn(&self) -> StoreResult<Object<AsyncPgConnection>> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }
}

#[async_trait]
impl BuildStore for PgStore {
    async fn get_or_create_project(&self, new_project: NewCiProject) -> StoreResult<CiProject> {
        let mut conn = self.conn().await?;
        diesel::insert_into(ci_projects::table)
            .values(&new_project)
            .on_conflict((ci_projects::owner, ci_projects::name))
            .do_nothing()
            .execute(&mut conn)
            .await?;

        let project = ci_projects::table
            .filter(ci_projects::owner.eq(&new_project.owner))
            .filter(ci_projects::name.eq(&new_project.name))
            .select(CiProject::as_select())
            .first(&mut conn)
            .await?;
        Ok(project)
    }

    async fn find_project(&self, owner: &str, name: &str) -> StoreResult<Option<CiProject>> {
        let mut conn = self.conn().await?;
        let project = ci_projects::table
            .filter(ci_projects::owner.eq(owner))
            .filter(ci_projects::name.eq(name))
            .select(CiProject::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(project)
    }

    async fn get_project(&self, project_id: i64) -> StoreResult<CiProject> {
        let mut conn = self.conn().await?;
        ci_projects::table
            .find(project_id)
            .select(CiProject::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "project",
                id: project_id,
            })
    }

    async fn set_project_approved(&self, project_id: i64, approved: bool) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(ci_projects::table.find(project_id))
            .set((
                ci_projects::approved.eq(approved),
                ci_projects::write_date.eq(Some(Utc::now())),
            ))
            .execute(&mut conn)
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "project",
                id: project_id,
            });
        }
        Ok(())
    }

    async fn create_build(&self, project_id: i64, request: &BuildRequest) -> StoreResult<CiBuild> {
        let mut conn = self.conn().await?;
        let branch = request.branch.clone();
        let sha = request.sha.clone();
        let pull_request_id = request.pull_request_id;

        // The row lock taken by the UPDATE serializes concurrent numbering.
        let build = conn
            .transaction::<_, diesel::result::Error, _>(|conn| {
                async move {
                    let build_number: i32 = diesel::update(ci_projects::table.find(project_id))
                        .set(ci_projects::last_build_number.eq(ci_projects::last_build_number + 1))
                        .returning(ci_projects::last_build_number)
                        .get_result(conn)
                        .await?;

                    diesel::insert_into(ci_builds::table)
                        .values(&NewCiBuild {
                            project_id,
                            build_number,
                            branch,
                            sha,
                            pull_request_id,
                            state: PipelineState::Created.as_str().to_string(),
                        })
                        .returning(CiBuild::as_returning())
                        .get_result(conn)
                        .await
                }
                .scope_boxed()
            })
            .await
            .optional()?;

        build.ok_or(StoreError::NotFound {
            entity: "project",
            id: project_id,
        })
    }

    async fn get_build(&self, build_id: i64) -> StoreResult<Option<CiBuild>> {
        let mut conn = self.conn().await?;
        let build = ci_builds::table
            .find(build_id)
            .select(CiBuild::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(build)
    }

    async fn find_build_by_number(
        &self,
        project_id: i64,
        build_number: i32,
    ) -> StoreResult<Option<CiBuild>> {
        let mut conn = self.conn().await?;
        let build = ci_builds::table
            .filter(ci_builds::project_id.eq(project_id))
            .filter(ci_builds::build_number.eq(build_number))
            .select(CiBuild::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(build)
    }

    async fn latest_build_for_pull_request(
        &self,
        project_id: i64,
        pull_request_id: i32,
    ) -> StoreResult<Option<CiBuild>> {
        let mut conn = self.conn().await?;
        let build = ci_builds::table
            .filter(ci_builds::project_id.eq(project_id))
            .filter(ci_builds::pull_request_id.eq(pull_request_id))
            .order(ci_builds::build_number.desc())
            .select(CiBuild::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(build)
    }

    async fn list_builds(&self, project_id: i64) -> StoreResult<Vec<CiBuild>> {
        let mut conn = self.conn().await?;
        let builds = ci_builds::table
            .filter(ci_builds::project_id.eq(project_id))
            .order(ci_builds::build_number.asc())
            .select(CiBuild::as_select())
            .load(&mut conn)
            .await?;
        Ok(builds)
    }

    async fn update_build_state(&self, build_id: i64, state: PipelineState) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let target = ci_builds::table.find(build_id);
        let updated = if state == PipelineState::Provisioning {
            diesel::update(target)
                .set((
                    ci_builds::state.eq(state.as_str()),
                    ci_builds::started_at.eq(Some(now)),
                    ci_builds::write_date.eq(Some(now)),
                ))
                .execute(&mut conn)
                .await?
        } else {
            diesel::update(target)
                .set((
                    ci_builds::state.eq(state.as_str()),
                    ci_builds::write_date.eq(Some(now)),
                ))
                .execute(&mut conn)
                .await?
        };
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "build",
                id: build_id,
            });
        }
        Ok(())
    }

    async fn finish_build(
        &self,
        build_id: i64,
        state: PipelineState,
        duration_ms: i32,
    ) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let project_id: i64 = diesel::update(ci_builds::table.find(build_id))
            .set((
                ci_builds::state.eq(state.as_str()),
                ci_builds::finished_at.eq(Some(now)),
                ci_builds::duration_ms.eq(Some(duration_ms)),
                ci_builds::write_date.eq(Some(now)),
            ))
            .returning(ci_builds::project_id)
            .get_result(&mut conn)
            .await
            .optional()?
            .ok_or(StoreError::NotFound {
                entity: "build",
                id: build_id,
            })?;

        let recent: Vec<Option<i32>> = ci_builds::table
            .filter(ci_builds::project_id.eq(project_id))
            .filter(ci_builds::duration_ms.is_not_null())
            .order(ci_builds::build_number.desc())
            .limit(AVERAGE_WINDOW as i64)
            .select(ci_builds::duration_ms)
            .load(&mut conn)
            .await?;
        let durations: Vec<i64> = recent.into_iter().flatten().map(i64::from).collect();
        let average = (!durations.is_empty())
            .then(|| (durations.iter().sum::<i64>() / durations.len() as i64) as i32);

        diesel::update(ci_projects::table.find(project_id))
            .set(ci_projects::average_time.eq(average))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn create_result(
        &self,
        build_id: i64,
        outcome: &BuildOutcome,
    ) -> StoreResult<CiBuildResult> {
        let mut conn = self.conn().await?;
        let result = diesel::insert_into(ci_build_results::table)
            .values(&NewCiBuildResult::from_outcome(build_id, outcome))
            .returning(CiBuildResult::as_returning())
            .get_result(&mut conn)
            .await?;
        Ok(result)
    }

    async fn save_result(&self, build_id: i64, outcome: &BuildOutcome) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let updated = diesel::update(
            ci_build_results::table.filter(ci_build_results::build_id.eq(build_id)),
        )
        .set((
            NewCiBuildResult::from_outcome(build_id, outcome),
            ci_build_results::write_date.eq(Some(Utc::now())),
        ))
        .execute(&mut conn)
        .await?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "result",
                id: build_id,
            });
        }
        Ok(())
    }

    async fn get_result(&self, build_id: i64) -> StoreResult<Option<CiBuildResult>> {
        let mut conn = self.conn().await?;
        let result = ci_build_results::table
            .filter(ci_build_results::build_id.eq(build_id))
            .select(CiBuildResult::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        Ok(result)
    }
}
