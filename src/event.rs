use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a telemetry event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A transaction was begun.
    TransactionBegin,
    /// A transaction reported progress.
    TransactionUpdate,
    /// A transaction ended, either explicitly or by timing out.
    TransactionEnd,
    /// An instantaneous transaction.
    TransactionBeginAndEnd,
    /// Updated device state.
    DeviceState,
    /// Updated state of the active user.
    UserState,
    /// Updated collection balance for the active entity.
    CollectionUpdate,
    /// A user or device registration that could not be sent directly.
    EntityRegistration,
    /// A tuning refresh request that could not be sent directly.
    TuningRefresh,
}

/// Event payload before it is tagged with entity ids and queued.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EventBody {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: HashMap<String, serde_json::Value>,
}

impl EventBody {
    pub(crate) fn new(kind: EventKind, payload: HashMap<String, serde_json::Value>) -> EventBody {
        EventBody {
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// An immutable record of one telemetry occurrence.
///
/// The sequence number is assigned by the [`EventQueue`](crate::EventQueue) when the event is
/// enqueued. Downstream consumers dedupe by `id` since delivery is at-least-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique id of the event.
    pub id: Uuid,
    /// Position of the event in the queue. Strictly increasing.
    pub sequence: u64,
    /// What the event reports.
    pub kind: EventKind,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Device the event was recorded on.
    pub device_id: String,
    /// Active user when the event was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Event-specific data.
    pub payload: HashMap<String, serde_json::Value>,
}

impl Event {
    pub(crate) fn tagged(body: EventBody, device_id: &str, user_id: Option<&str>) -> Event {
        Event {
            id: Uuid::new_v4(),
            sequence: 0,
            kind: body.kind,
            timestamp: body.timestamp,
            device_id: device_id.to_owned(),
            user_id: user_id.map(str::to_owned),
            payload: body.payload,
        }
    }
}


#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{Event, EventBody, EventKind};

    #[test]
    fn serializes_in_camel_case_without_missing_user() {
        let event = Event::tagged(
            EventBody::new(EventKind::TransactionBegin, HashMap::new()),
            "device-1",
            None,
        );
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["deviceId"], "device-1");
        assert_eq!(json["kind"], "transaction_begin");
        assert!(json.get("userId").is_none());
    }

    #[test]
    fn deserializes_what_it_serializes() {
        let event = Event::tagged(
            EventBody::new(EventKind::UserState, HashMap::new()),
            "device-1",
            Some("u1"),
        );
        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
