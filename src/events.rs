//! Event broadcaster - per-device and per-org fan-out of presence and
//! command transitions.
//!
//! Delivery is best-effort and at most once per subscriber: a bounded
//! broadcast channel drops events past lagging receivers, and a subscriber
//! that reconnects re-fetches current device state instead of relying on
//! backfilled events.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Heartbeat,
    CommandExecuted,
    CommandExpired,
}

/// Wire shape seen by subscribers: `{type, device_id, payload, timestamp}`.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub device_id: Uuid,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl DeviceEvent {
    pub fn heartbeat(device_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            kind: EventKind::Heartbeat,
            device_id,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn command_executed(
        device_id: Uuid,
        command: &str,
        success: bool,
        message: Option<&str>,
    ) -> Self {
        Self {
            kind: EventKind::CommandExecuted,
            device_id,
            payload: json!({
                "command": command,
                "success": success,
                "message": message,
            }),
            timestamp: Utc::now(),
        }
    }

    pub fn command_expired(device_id: Uuid, command: &str) -> Self {
        Self {
            kind: EventKind::CommandExpired,
            device_id,
            payload: json!({ "command": command }),
            timestamp: Utc::now(),
        }
    }
}

type ChannelMap = Arc<RwLock<HashMap<Uuid, broadcast::Sender<DeviceEvent>>>>;

/// Publish/subscribe surface keyed by device id, with a coarser org-wide
/// scope for sessions watching a whole fleet.
#[derive(Clone, Default)]
pub struct EventBroadcaster {
    devices: ChannelMap,
    orgs: ChannelMap,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe_device(&self, device_id: Uuid) -> broadcast::Receiver<DeviceEvent> {
        subscribe(&self.devices, device_id).await
    }

    pub async fn subscribe_org(&self, org_id: Uuid) -> broadcast::Receiver<DeviceEvent> {
        subscribe(&self.orgs, org_id).await
    }

    /// Fan an event out to the device's subscribers and to the owning org
    /// scope. Channels without subscribers are skipped; nothing here blocks
    /// or fails the caller.
    pub async fn publish(&self, org_id: Uuid, event: DeviceEvent) {
        fan_out(&self.devices, event.device_id, event.clone()).await;
        fan_out(&self.orgs, org_id, event).await;
    }
}

async fn subscribe(map: &ChannelMap, key: Uuid) -> broadcast::Receiver<DeviceEvent> {
    let mut map = map.write().await;
    map.entry(key)
        .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
        .subscribe()
}

/// Send to the channel for `key` if one exists. A send to a channel whose
/// receivers have all dropped fails; that entry is dead weight, so it is
/// removed here rather than accumulating for every device ever watched.
async fn fan_out(map: &ChannelMap, key: Uuid, event: DeviceEvent) {
    let delivered = {
        let guard = map.read().await;
        match guard.get(&key) {
            Some(tx) => tx.send(event).is_ok(),
            None => return,
        }
    };
    if !delivered {
        let mut guard = map.write().await;
        // Re-check under the write lock: a subscriber may have arrived
        // between the failed send and now.
        if guard.get(&key).is_some_and(|tx| tx.receiver_count() == 0) {
            guard.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[tokio::test]
    async fn test_device_subscriber_receives_event() {
        let bus = EventBroadcaster::new();
        let org = Uuid::new_v4();
        let device = Uuid::new_v4();

        let mut rx = bus.subscribe_device(device).await;
        bus.publish(org, DeviceEvent::command_expired(device, "uninstall"))
            .await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::CommandExpired);
        assert_eq!(event.device_id, device);
        assert_eq!(event.payload["command"], "uninstall");
    }

    #[tokio::test]
    async fn test_other_device_subscriber_sees_nothing() {
        let bus = EventBroadcaster::new();
        let org = Uuid::new_v4();
        let device = Uuid::new_v4();
        let other = Uuid::new_v4();

        let mut rx = bus.subscribe_device(other).await;
        bus.publish(org, DeviceEvent::command_expired(device, "restart"))
            .await;

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_org_scope_sees_all_devices() {
        let bus = EventBroadcaster::new();
        let org = Uuid::new_v4();
        let d1 = Uuid::new_v4();
        let d2 = Uuid::new_v4();

        let mut rx = bus.subscribe_org(org).await;
        bus.publish(org, DeviceEvent::heartbeat(d1, json!({"is_online": true})))
            .await;
        bus.publish(org, DeviceEvent::command_executed(d2, "update", true, None))
            .await;

        assert_eq!(rx.recv().await.unwrap().device_id, d1);
        assert_eq!(rx.recv().await.unwrap().device_id, d2);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_a_no_op() {
        let bus = EventBroadcaster::new();
        bus.publish(
            Uuid::new_v4(),
            DeviceEvent::heartbeat(Uuid::new_v4(), json!({})),
        )
        .await;
    }

    #[tokio::test]
    async fn test_each_subscriber_gets_event_once() {
        let bus = EventBroadcaster::new();
        let org = Uuid::new_v4();
        let device = Uuid::new_v4();

        let mut a = bus.subscribe_device(device).await;
        let mut b = bus.subscribe_device(device).await;
        bus.publish(org, DeviceEvent::command_expired(device, "update"))
            .await;

        assert_eq!(a.recv().await.unwrap().device_id, device);
        assert_eq!(b.recv().await.unwrap().device_id, device);
        assert!(matches!(a.try_recv(), Err(TryRecvError::Empty)));
        assert!(matches!(b.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_channel_removed_after_last_subscriber_drops() {
        let bus = EventBroadcaster::new();
        let org = Uuid::new_v4();
        let device = Uuid::new_v4();

        let rx = bus.subscribe_device(device).await;
        let org_rx = bus.subscribe_org(org).await;
        drop(rx);
        drop(org_rx);

        bus.publish(org, DeviceEvent::command_expired(device, "restart"))
            .await;

        assert!(!bus.devices.read().await.contains_key(&device));
        assert!(!bus.orgs.read().await.contains_key(&org));
    }

    #[tokio::test]
    async fn test_live_channel_survives_publish() {
        let bus = EventBroadcaster::new();
        let org = Uuid::new_v4();
        let device = Uuid::new_v4();

        let mut rx = bus.subscribe_device(device).await;
        bus.publish(org, DeviceEvent::command_expired(device, "restart"))
            .await;

        assert!(rx.recv().await.is_ok());
        assert!(bus.devices.read().await.contains_key(&device));
    }

    #[test]
    fn test_wire_shape() {
        let device = Uuid::new_v4();
        let event = DeviceEvent::command_executed(device, "restart", false, Some("exit code 1"));
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "command-executed");
        assert_eq!(value["device_id"], device.to_string());
        assert_eq!(value["payload"]["success"], false);
        assert_eq!(value["payload"]["message"], "exit code 1");
        assert!(value["timestamp"].is_string());
    }
}
