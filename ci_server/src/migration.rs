//! Schema migration for the PostgreSQL store.

use diesel_async::{AsyncPgConnection, SimpleAsyncConnection};

/// SQL migration for the orchestrator tables.
///
/// `(project_id, build_number)` is unique; `ci_build_results.build_id` is unique
/// so a build owns at most one result.
pub const MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS ci_projects (
    id                BIGSERIAL PRIMARY KEY,
    owner             VARCHAR(100) NOT NULL,
    name              VARCHAR(100) NOT NULL,
    git_repository    VARCHAR(150) NOT NULL,
    private           BOOLEAN NOT NULL DEFAULT TRUE,
    approved          BOOLEAN NOT NULL DEFAULT FALSE,
    average_time      INTEGER,
    last_build_number INTEGER NOT NULL DEFAULT 0,
    active            BOOLEAN NOT NULL DEFAULT TRUE,
    create_date       TIMESTAMPTZ DEFAULT NOW(),
    write_date        TIMESTAMPTZ DEFAULT NOW(),
    UNIQUE (owner, name)
);

CREATE TABLE IF NOT EXISTS ci_builds (
    id              BIGSERIAL PRIMARY KEY,
    project_id      BIGINT NOT NULL REFERENCES ci_projects(id) ON DELETE CASCADE,
    build_number    INTEGER NOT NULL,
    branch          VARCHAR(100) NOT NULL DEFAULT 'master',
    sha             VARCHAR(150) NOT NULL,
    pull_request_id INTEGER NOT NULL DEFAULT 0,
    state           VARCHAR(32) NOT NULL DEFAULT 'created',
    started_at      TIMESTAMPTZ,
    finished_at     TIMESTAMPTZ,
    duration_ms     INTEGER,
    create_date     TIMESTAMPTZ DEFAULT NOW(),
    write_date      TIMESTAMPTZ DEFAULT NOW(),
    UNIQUE (project_id, build_number)
);

CREATE INDEX IF NOT EXISTS idx_ci_builds_project ON ci_builds (project_id);
CREATE INDEX IF NOT EXISTS idx_ci_builds_pull_request ON ci_builds (project_id, pull_request_id);

CREATE TABLE IF NOT EXISTS ci_build_results (
    id           BIGSERIAL PRIMARY KEY,
    build_id     BIGINT NOT NULL UNIQUE REFERENCES ci_builds(id) ON DELETE CASCADE,
    succeeded    BOOLEAN NOT NULL DEFAULT FALSE,
    result_log   TEXT NOT NULL DEFAULT '',
    return_codes TEXT NOT NULL DEFAULT '',
    create_date  TIMESTAMPTZ DEFAULT NOW(),
    write_date   TIMESTAMPTZ DEFAULT NOW()
);
"#;

/// Run the orchestrator migration.
pub async fn run_migration(conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
    conn.batch_execute(MIGRATION_SQL)
        .await
        .map_err(|e| anyhow::anyhow!("CI migration failed: {e}"))?;
    Ok(())
}
