//! Remote command model

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgExecutor, PgPool};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Wall-clock timeout for a pending command. Computed once at dispatch time
/// and stored as the deadline; the sweep compares against the stored value.
pub const COMMAND_TIMEOUT_MINUTES: i64 = 60;

/// Deadline for a command issued at the given instant.
pub fn deadline_for(issued_at: DateTime<Utc>) -> DateTime<Utc> {
    issued_at + Duration::minutes(COMMAND_TIMEOUT_MINUTES)
}

/// Commands an agent can execute remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Uninstall,
    Restart,
    Update,
    CollectInfo,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Uninstall => "uninstall",
            CommandKind::Restart => "restart",
            CommandKind::Update => "update",
            CommandKind::CollectInfo => "collect_info",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uninstall" => Ok(CommandKind::Uninstall),
            "restart" => Ok(CommandKind::Restart),
            "update" => Ok(CommandKind::Update),
            "collect_info" => Ok(CommandKind::CollectInfo),
            _ => Err(()),
        }
    }
}

/// Terminal outcome of a command record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    ExecutedSuccess,
    ExecutedFailure,
    Expired,
    Cancelled,
}

impl CommandOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandOutcome::ExecutedSuccess => "executed_success",
            CommandOutcome::ExecutedFailure => "executed_failure",
            CommandOutcome::Expired => "expired",
            CommandOutcome::Cancelled => "cancelled",
        }
    }
}

/// Append-only history of dispatched commands. A record is open while
/// `outcome` is NULL and is closed exactly once by whichever of the execution
/// report, the expiry sweep or an explicit cancel wins the guarded clear.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CommandRecord {
    pub id: Uuid,
    pub device_id: Uuid,
    pub command: String,
    pub issued_by: Uuid,
    pub issued_at: DateTime<Utc>,
    pub outcome: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl CommandRecord {
    /// Insert a new open record for a freshly claimed command slot. Runs in
    /// the same transaction as the slot claim.
    pub async fn open(
        executor: impl PgExecutor<'_>,
        device_id: Uuid,
        command: &str,
        issued_by: Uuid,
        issued_at: DateTime<Utc>,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, CommandRecord>(
            r#"
            INSERT INTO command_records (device_id, command, issued_by, issued_at)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(device_id)
        .bind(command)
        .bind(issued_by)
        .bind(issued_at)
        .fetch_one(executor)
        .await
    }

    /// Write the terminal outcome, but only if the record is still open.
    /// Returns false when another closer got there first. Runs in the same
    /// transaction as the guarded slot clear.
    pub async fn close_if_open(
        executor: impl PgExecutor<'_>,
        device_id: Uuid,
        command: &str,
        outcome: CommandOutcome,
        message: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE command_records
            SET outcome = $3,
                completed_at = NOW(),
                message = $4
            WHERE device_id = $1 AND command = $2 AND outcome IS NULL
            "#,
        )
        .bind(device_id)
        .bind(command)
        .bind(outcome.as_str())
        .bind(message)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_by_device(
        pool: &PgPool,
        device_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Self>, sqlx::Error> {
        sqlx::query_as::<_, CommandRecord>(
            r#"
            SELECT * FROM command_records
            WHERE device_id = $1
            ORDER BY issued_at DESC
            LIMIT $2
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(pool)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_command_kind_round_trip() {
        for kind in [
            CommandKind::Uninstall,
            CommandKind::Restart,
            CommandKind::Update,
            CommandKind::CollectInfo,
        ] {
            assert_eq!(kind.as_str().parse::<CommandKind>(), Ok(kind));
        }
        assert!("reboot".parse::<CommandKind>().is_err());
    }

    #[test]
    fn test_command_kind_serde_names() {
        let json = serde_json::to_string(&CommandKind::CollectInfo).unwrap();
        assert_eq!(json, "\"collect_info\"");
        let kind: CommandKind = serde_json::from_str("\"uninstall\"").unwrap();
        assert_eq!(kind, CommandKind::Uninstall);
    }

    #[test]
    fn test_deadline_is_exactly_sixty_minutes() {
        let issued = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let deadline = deadline_for(issued);
        assert_eq!(deadline - issued, Duration::minutes(60));
    }

    #[test]
    fn test_outcome_names() {
        assert_eq!(CommandOutcome::ExecutedSuccess.as_str(), "executed_success");
        assert_eq!(CommandOutcome::Expired.as_str(), "expired");
        assert_eq!(CommandOutcome::Cancelled.as_str(), "cancelled");
    }
}
