//! Background sweeps: command expiry and presence staleness.
//!
//! Both run on the same cadence but are logically independent; presence can
//! go stale with no command pending, and a pending command can outlive the
//! device's presence. Worst-case expiry detection latency equals the sweep
//! interval.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::time::Duration;
use tokio::time::interval;

use crate::events::DeviceEvent;
use crate::models::{CommandOutcome, CommandRecord, Device};
use crate::AppState;

/// A pending command is expired once its stored deadline has passed. Pure
/// comparison against stored data; the deadline is never recomputed.
pub fn is_expired(deadline: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now >= deadline
}

pub fn spawn_sweepers(state: AppState) {
    let period = Duration::from_secs(state.config.sweep_interval_secs);

    let expiry_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            if let Err(e) = sweep_expired_commands(&expiry_state).await {
                tracing::error!("Command expiry sweep failed: {}", e);
            }
        }
    });

    tokio::spawn(async move {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            if let Err(e) = sweep_stale_presence(&state).await {
                tracing::error!("Presence sweep failed: {}", e);
            }
        }
    });
}

/// Expire command slots whose deadline has passed. Each slot goes through
/// the same guarded clear as execution reports and cancels, so a concurrent
/// report simply wins or loses the race; only the winner closes the record.
pub async fn sweep_expired_commands(state: &AppState) -> Result<(), sqlx::Error> {
    let now = Utc::now();
    let slots = Device::expired_commands(&state.pool, now).await?;
    if slots.is_empty() {
        return Ok(());
    }

    tracing::info!("Expiring {} stale command slot(s)", slots.len());

    for slot in slots {
        // Clear and record close commit together, same discipline as the
        // report and cancel paths.
        let mut tx = state.pool.begin().await?;
        let cleared =
            Device::clear_command_if(&mut *tx, slot.id, &slot.pending_command).await?;
        if !cleared {
            // An execution report or cancel got there first.
            continue;
        }

        CommandRecord::close_if_open(
            &mut *tx,
            slot.id,
            &slot.pending_command,
            CommandOutcome::Expired,
            Some("command timed out"),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            "Command '{}' expired on device {} ({})",
            slot.pending_command,
            slot.hostname,
            slot.id
        );

        state
            .events
            .publish(
                slot.org_id,
                DeviceEvent::command_expired(slot.id, &slot.pending_command),
            )
            .await;
    }

    Ok(())
}

/// Latch devices offline once their last heartbeat falls outside the
/// liveness window, emitting one offline transition event per device.
pub async fn sweep_stale_presence(state: &AppState) -> Result<(), sqlx::Error> {
    let cutoff = Utc::now() - state.config.offline_after();
    let stale = Device::mark_stale_offline(&state.pool, cutoff).await?;
    if stale.is_empty() {
        return Ok(());
    }

    tracing::info!("Marking {} device(s) offline", stale.len());

    for device in stale {
        tracing::info!(
            "Device {} ({}) offline, last heartbeat {:?}",
            device.hostname,
            device.id,
            device.last_heartbeat_at
        );

        state
            .events
            .publish(
                device.org_id,
                DeviceEvent::heartbeat(
                    device.id,
                    json!({
                        "is_online": false,
                        "went_offline": true,
                        "reason": "heartbeat_timeout",
                        "last_heartbeat_at": device.last_heartbeat_at,
                    }),
                ),
            )
            .await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::deadline_for;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_deadline_not_yet_reached() {
        let issued = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let deadline = deadline_for(issued);
        let just_before = issued + Duration::minutes(59) + Duration::seconds(59);
        assert!(!is_expired(deadline, just_before));
    }

    #[test]
    fn test_deadline_passed() {
        let issued = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let deadline = deadline_for(issued);
        let just_after = issued + Duration::minutes(60) + Duration::seconds(1);
        assert!(is_expired(deadline, just_after));
    }

    #[test]
    fn test_deadline_exact_boundary_expires() {
        let issued = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
        let deadline = deadline_for(issued);
        assert!(is_expired(deadline, deadline));
    }
}
