//! Database module - PostgreSQL connection and migrations

use sqlx::{postgres::PgPoolOptions, PgPool};

/// Create database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create tables if not exist
    sqlx::raw_sql(SCHEMA_SQL)
        .execute(pool)
        .await?;

    tracing::info!("Database schema applied successfully");
    Ok(())
}

/// Database schema SQL
///
/// Device rows are created by the asset-management side of the product; this
/// service only mutates the agent/command columns. The CHECK constraint
/// encodes that a pending command and its deadline exist together or not at
/// all, and the partial unique index keeps at most one open command record
/// per device.
const SCHEMA_SQL: &str = r#"
-- Devices (managed resources)
CREATE TABLE IF NOT EXISTS devices (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    org_id UUID NOT NULL,
    hostname VARCHAR(255) NOT NULL,
    device_code VARCHAR(64) NOT NULL UNIQUE,
    agent_id UUID UNIQUE,
    agent_token_hash VARCHAR(255),
    agent_version VARCHAR(50),
    agent_installed_at TIMESTAMPTZ,
    agent_push_url VARCHAR(512),
    last_heartbeat_at TIMESTAMPTZ,
    marked_online BOOLEAN NOT NULL DEFAULT false,
    last_status JSONB,
    pending_command VARCHAR(32),
    pending_command_issued_at TIMESTAMPTZ,
    pending_command_deadline TIMESTAMPTZ,
    status VARCHAR(20) NOT NULL DEFAULT 'active',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    CONSTRAINT pending_command_pair CHECK (
        (pending_command IS NULL) = (pending_command_issued_at IS NULL)
        AND (pending_command IS NULL) = (pending_command_deadline IS NULL)
    )
);

-- Command history (append-only; outcome NULL while open)
CREATE TABLE IF NOT EXISTS command_records (
    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
    device_id UUID NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
    command VARCHAR(32) NOT NULL,
    issued_by UUID NOT NULL,
    issued_at TIMESTAMPTZ NOT NULL,
    outcome VARCHAR(32),
    completed_at TIMESTAMPTZ,
    message TEXT
);

-- Agent heartbeat metrics (for analytics)
CREATE TABLE IF NOT EXISTS heartbeat_history (
    id BIGSERIAL PRIMARY KEY,
    device_id UUID NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
    cpu_usage REAL,
    memory_usage REAL,
    uptime_seconds BIGINT,
    recorded_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

-- Indexes
CREATE UNIQUE INDEX IF NOT EXISTS idx_command_records_open
    ON command_records(device_id) WHERE outcome IS NULL;
CREATE INDEX IF NOT EXISTS idx_devices_org ON devices(org_id);
CREATE INDEX IF NOT EXISTS idx_devices_heartbeat ON devices(last_heartbeat_at);
CREATE INDEX IF NOT EXISTS idx_devices_pending_deadline
    ON devices(pending_command_deadline) WHERE pending_command IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_command_records_device ON command_records(device_id, issued_at);
CREATE INDEX IF NOT EXISTS idx_heartbeat_history_device ON heartbeat_history(device_id, recorded_at);
"#;
