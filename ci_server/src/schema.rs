//! Diesel table definitions for the build orchestrator.
//!
//! Tables: ci_projects, ci_builds, ci_build_results.

diesel::table! {
    ci_projects (id) {
        id -> Int8,
        owner -> Varchar,
        name -> Varchar,
        git_repository -> Varchar,
        private -> Bool,
        approved -> Bool,
        average_time -> Nullable<Int4>,
        last_build_number -> Int4,
        active -> Bool,
        create_date -> Nullable<Timestamptz>,
        write_date -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    ci_builds (id) {
        id -> Int8,
        project_id -> Int8,
        build_number -> Int4,
        branch -> Varchar,
        sha -> Varchar,
        pull_request_id -> Int4,
        state -> Varchar,
        started_at -> Nullable<Timestamptz>,
        finished_at -> Nullable<Timestamptz>,
        duration_ms -> Nullable<Int4>,
        create_date -> Nullable<Timestamptz>,
        write_date -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    ci_build_results (id) {
        id -> Int8,
        build_id -> Int8,
        succeeded -> Bool,
        result_log -> Text,
        return_codes -> Text,
        create_date -> Nullable<Timestamptz>,
        write_date -> Nullable<Timestamptz>,
    }
}

// Foreign key relationships
diesel::joinable!(ci_builds -> ci_projects (project_id));
diesel::joinable!(ci_build_results -> ci_builds (build_id));

diesel::allow_tables_to_appear_in_same_query!(ci_projects, ci_builds, ci_build_results,);
