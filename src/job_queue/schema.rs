//! Database schema for the job queue.
//!
//! Defines the versioned schema of `jobs` and `queue_locks`.

use crate::sqlite_column;
use crate::sqlite_persistence::{SqlType, Table, VersionedSchema};

// =============================================================================
// Jobs Table - Version 0
// =============================================================================

const JOBS_TABLE_V0: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!(
            "id",
            &SqlType::Integer,
            is_primary_key = true,
            is_autoincrement = true
        ),
        sqlite_column!("type", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("payload", &SqlType::Blob, non_null = true),
        sqlite_column!("result", &SqlType::Blob),
        sqlite_column!(
            "priority",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("10")
        ),
        sqlite_column!(
            "attempts",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "max_attempts",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("3")
        ),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("scheduled_at", &SqlType::Integer),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("completed_at", &SqlType::Integer),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[
        ("idx_jobs_type", "type"),
        ("idx_jobs_status", "status"),
        ("idx_jobs_priority", "priority"),
        ("idx_jobs_scheduled_at", "scheduled_at"),
        ("idx_jobs_created_at", "created_at"),
        ("idx_jobs_dequeue", "status, priority, created_at"),
    ],
};

// =============================================================================
// Queue Locks Table - Version 0
// =============================================================================

/// One row per named processing-run lease
const QUEUE_LOCKS_TABLE_V0: Table = Table {
    name: "queue_locks",
    columns: &[
        sqlite_column!("name", &SqlType::Text, is_primary_key = true),
        sqlite_column!("holder", &SqlType::Text, non_null = true),
        sqlite_column!("acquired_at", &SqlType::Integer, non_null = true),
        sqlite_column!("expires_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
};

pub const JOB_QUEUE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[JOBS_TABLE_V0, QUEUE_LOCKS_TABLE_V0],
    migration: None,
}];
