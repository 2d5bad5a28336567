//! Device (managed resource) model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor, PgPool};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Device {
    pub id: Uuid,
    pub org_id: Uuid,
    pub hostname: String,
    pub device_code: String,
    pub agent_id: Option<Uuid>,
    #[serde(skip_serializing)]
    pub agent_token_hash: Option<String>,
    pub agent_version: Option<String>,
    pub agent_installed_at: Option<DateTime<Utc>>,
    pub agent_push_url: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub marked_online: bool,
    pub last_status: Option<serde_json::Value>,
    pub pending_command: Option<String>,
    pub pending_command_issued_at: Option<DateTime<Utc>>,
    pub pending_command_deadline: Option<DateTime<Utc>>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Device as returned to operators, with presence derived at read time.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    #[serde(flatten)]
    pub device: Device,
    pub is_online: bool,
}

/// Presence is a pure function of heartbeat recency. `marked_online` on the
/// row is only an edge-detection latch for the presence sweep.
pub fn is_online(
    last_heartbeat_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: Duration,
) -> bool {
    match last_heartbeat_at {
        Some(seen) => now - seen < window,
        None => false,
    }
}

/// Row returned by the heartbeat update, carrying the pre-update latch so the
/// ingestor can detect an offline-to-online transition.
#[derive(Debug, Clone, FromRow)]
pub struct HeartbeatUpdate {
    pub id: Uuid,
    pub org_id: Uuid,
    pub was_online: bool,
    pub pending_command: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

/// A pending command slot whose deadline has passed, as seen by the sweep.
#[derive(Debug, Clone, FromRow)]
pub struct ExpiredSlot {
    pub id: Uuid,
    pub org_id: Uuid,
    pub hostname: String,
    pub pending_command: String,
}

/// A device the presence sweep just latched offline.
#[derive(Debug, Clone, FromRow)]
pub struct StaleDevice {
    pub id: Uuid,
    pub org_id: Uuid,
    pub hostname: String,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn view(self, now: DateTime<Utc>, window: Duration) -> DeviceView {
        let is_online = is_online(self.last_heartbeat_at, now, window);
        DeviceView {
            device: self,
            is_online,
        }
    }

    pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_token_hash(
        pool: &PgPool,
        token_hash: &str,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE agent_token_hash = $1")
            .bind(token_hash)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_by_org(
        pool: &PgPool,
        org_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, Device>(
            r#"
            SELECT * FROM devices
            WHERE org_id = $1
            ORDER BY last_heartbeat_at DESC NULLS LAST
            LIMIT $2
            "#,
        )
        .bind(org_id)
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    /// Claim the command slot. The WHERE clause is the single-slot guard:
    /// only one of any number of concurrent dispatches can match the empty
    /// slot, and command + deadline are written in the same statement.
    /// Callers run this in one transaction with the record insert so a slot
    /// can never be claimed without an open record.
    pub async fn claim_command(
        executor: impl PgExecutor<'_>,
        id: Uuid,
        command: &str,
        issued_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET pending_command = $2,
                pending_command_issued_at = $3,
                pending_command_deadline = $4,
                updated_at = NOW()
            WHERE id = $1 AND pending_command IS NULL
            "#,
        )
        .bind(id)
        .bind(command)
        .bind(issued_at)
        .bind(deadline)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Guarded clear of the command slot, conditioned on the command still
    /// being the pending one. Execution report, expiry sweep and cancel all
    /// go through this; whichever wins clears the slot, the losers are
    /// no-ops. Command and deadline are cleared in the same statement, and
    /// callers pair the clear with the record close in one transaction.
    pub async fn clear_command_if(
        executor: impl PgExecutor<'_>,
        id: Uuid,
        command: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET pending_command = NULL,
                pending_command_issued_at = NULL,
                pending_command_deadline = NULL,
                updated_at = NOW()
            WHERE id = $1 AND pending_command = $2
            "#,
        )
        .bind(id)
        .bind(command)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Advance the heartbeat timestamp, never backward (out-of-order
    /// delivery), and latch the device online. Returns None for an unknown
    /// agent id so the caller can log and drop the report.
    pub async fn record_heartbeat(
        pool: &PgPool,
        agent_id: Uuid,
        reported_at: DateTime<Utc>,
        status: Option<&serde_json::Value>,
    ) -> Result<Option<HeartbeatUpdate>, sqlx::Error> {
        sqlx::query_as::<_, HeartbeatUpdate>(
            r#"
            UPDATE devices AS d
            SET last_heartbeat_at = GREATEST(COALESCE(d.last_heartbeat_at, $2), $2),
                marked_online = TRUE,
                last_status = COALESCE($3, d.last_status),
                updated_at = NOW()
            FROM (
                SELECT id, marked_online AS was_online
                FROM devices WHERE agent_id = $1
                FOR UPDATE
            ) prev
            WHERE d.id = prev.id
            RETURNING d.id, d.org_id, prev.was_online, d.pending_command, d.last_heartbeat_at
            "#,
        )
        .bind(agent_id)
        .bind(reported_at)
        .bind(status)
        .fetch_optional(pool)
        .await
    }

    /// Command slots whose stored deadline has passed.
    pub async fn expired_commands(
        pool: &PgPool,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExpiredSlot>, sqlx::Error> {
        sqlx::query_as::<_, ExpiredSlot>(
            r#"
            SELECT id, org_id, hostname, pending_command
            FROM devices
            WHERE pending_command IS NOT NULL AND pending_command_deadline <= $1
            "#,
        )
        .bind(now)
        .fetch_all(pool)
        .await
    }

    /// Latch offline every device whose last heartbeat predates the cutoff.
    /// Returns only the rows that actually transitioned, so the sweep emits
    /// one offline event per device.
    pub async fn mark_stale_offline(
        pool: &PgPool,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StaleDevice>, sqlx::Error> {
        sqlx::query_as::<_, StaleDevice>(
            r#"
            UPDATE devices
            SET marked_online = FALSE,
                updated_at = NOW()
            WHERE marked_online = TRUE
              AND (last_heartbeat_at IS NULL OR last_heartbeat_at < $1)
            RETURNING id, org_id, hostname, last_heartbeat_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(pool)
        .await
    }

    /// Attach a newly registered agent to an existing device row. Device
    /// records themselves are created by the asset-management side.
    pub async fn attach_agent(
        pool: &PgPool,
        device_code: &str,
        agent_id: Uuid,
        token_hash: &str,
        agent_version: &str,
        push_url: Option<&str>,
    ) -> Result<Option<Self>, sqlx::Error> {
        sqlx::query_as::<_, Device>(
            r#"
            UPDATE devices
            SET agent_id = $2,
                agent_token_hash = $3,
                agent_version = $4,
                agent_push_url = $5,
                agent_installed_at = NOW(),
                status = 'active',
                updated_at = NOW()
            WHERE device_code = $1
            RETURNING *
            "#,
        )
        .bind(device_code)
        .bind(agent_id)
        .bind(token_hash)
        .bind(agent_version)
        .bind(push_url)
        .fetch_optional(pool)
        .await
    }

    /// Clear agent registration after a successful uninstall.
    pub async fn detach_agent(executor: impl PgExecutor<'_>, id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE devices
            SET agent_id = NULL,
                agent_token_hash = NULL,
                agent_version = NULL,
                agent_push_url = NULL,
                agent_installed_at = NULL,
                last_heartbeat_at = NULL,
                marked_online = FALSE,
                status = 'inactive',
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(executor)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_never_seen_is_offline() {
        assert!(!is_online(None, t0(), Duration::minutes(10)));
    }

    #[test]
    fn test_recent_heartbeat_is_online() {
        let now = t0();
        assert!(is_online(Some(now - Duration::minutes(3)), now, Duration::minutes(10)));
    }

    #[test]
    fn test_stale_heartbeat_is_offline() {
        // Two full liveness windows ago: clearly offline.
        let now = t0();
        assert!(!is_online(Some(now - Duration::minutes(20)), now, Duration::minutes(10)));
    }

    #[test]
    fn test_window_boundary_is_offline() {
        let now = t0();
        assert!(!is_online(Some(now - Duration::minutes(10)), now, Duration::minutes(10)));
        assert!(is_online(
            Some(now - Duration::minutes(10) + Duration::seconds(1)),
            now,
            Duration::minutes(10)
        ));
    }

    #[test]
    fn test_heartbeat_max_rule() {
        // GREATEST() in record_heartbeat keeps the newer timestamp; the same
        // rule as a pure comparison for out-of-order delivery.
        let newer = t0();
        let older = t0() - Duration::seconds(5);
        assert_eq!(newer.max(older), newer);
        assert_eq!(older.max(newer), newer);
    }
}
