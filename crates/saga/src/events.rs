//! Events exchanged with the downstream services over the bus.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{EventId, SagaId};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Topic carrying saga lifecycle events and, by default, step results.
pub const SAGA_TOPIC: &str = "user-deletion-saga";

/// A downstream service taking part in user deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    Auth,
    Team,
    Board,
    Task,
}

impl Service {
    pub const ALL: [Service; 4] = [Service::Auth, Service::Team, Service::Board, Service::Task];

    /// Lowercase service name, as used in topic names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Auth => "auth",
            Service::Team => "team",
            Service::Board => "board",
            Service::Task => "task",
        }
    }

    /// Capitalised prefix of the service's event type names.
    fn type_prefix(&self) -> &'static str {
        match self {
            Service::Auth => "Auth",
            Service::Team => "Team",
            Service::Board => "Board",
            Service::Task => "Task",
        }
    }

    /// Topic the service consumes commands from.
    pub fn command_topic(&self) -> String {
        format!("{}-service-commands", self.as_str())
    }

    /// Topic the service may publish its results on.
    pub fn result_topic(&self) -> String {
        format!("{}-service-events", self.as_str())
    }
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The enumerated `type` tag of an [`Event`].
///
/// Unrecognised tags deserialize into [`EventType::Unknown`] so that newer
/// producers never make a message undecodable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    UserDeletionRequested,
    UserDeletionCompleted,
    UserDeletionRollback,
    /// Command: delete the user in a service.
    UserDeleteRequested(Service),
    /// Result: the service deleted the user.
    UserDeleted(Service),
    /// Result: the service could not delete the user.
    UserDeleteFailed(Service),
    /// Compensation: restore the user in a service.
    UserDeleteRollback(Service),
    Unknown(String),
}

impl EventType {
    /// Returns the wire name of this event type.
    pub fn name(&self) -> String {
        match self {
            EventType::UserDeletionRequested => "UserDeletionRequested".to_string(),
            EventType::UserDeletionCompleted => "UserDeletionCompleted".to_string(),
            EventType::UserDeletionRollback => "UserDeletionRollback".to_string(),
            EventType::UserDeleteRequested(s) => format!("{}UserDeleteRequested", s.type_prefix()),
            EventType::UserDeleted(s) => format!("{}UserDeleted", s.type_prefix()),
            EventType::UserDeleteFailed(s) => format!("{}UserDeleteFailed", s.type_prefix()),
            EventType::UserDeleteRollback(s) => format!("{}UserDeleteRollback", s.type_prefix()),
            EventType::Unknown(name) => name.clone(),
        }
    }

    fn parse(name: &str) -> Self {
        match name {
            "UserDeletionRequested" => return EventType::UserDeletionRequested,
            "UserDeletionCompleted" => return EventType::UserDeletionCompleted,
            "UserDeletionRollback" => return EventType::UserDeletionRollback,
            _ => {}
        }

        for service in Service::ALL {
            let Some(rest) = name.strip_prefix(service.type_prefix()) else {
                continue;
            };
            match rest {
                "UserDeleteRequested" => return EventType::UserDeleteRequested(service),
                "UserDeleted" => return EventType::UserDeleted(service),
                "UserDeleteFailed" => return EventType::UserDeleteFailed(service),
                "UserDeleteRollback" => return EventType::UserDeleteRollback(service),
                _ => {}
            }
        }
        EventType::Unknown(name.to_string())
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        EventType::parse(&name)
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        EventType::parse(name)
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        event_type.name()
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An immutable message exchanged over the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default)]
    pub user_id: String,
    /// Empty on the request that starts a saga.
    #[serde(default)]
    pub saga_id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Map::is_empty"
    )]
    pub data: Map<String, Value>,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub headers: HashMap<String, String>,
}

/// Reads an explicit `null` the same way as a missing field.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Event {
    /// Creates an event with a fresh ID and the current timestamp.
    pub fn new(event_type: EventType, user_id: impl Into<String>, saga_id: Option<SagaId>) -> Self {
        Self {
            id: EventId::new().to_string(),
            event_type,
            user_id: user_id.into(),
            saga_id: saga_id.map(|id| id.to_string()).unwrap_or_default(),
            timestamp: Utc::now(),
            data: Map::new(),
            headers: HashMap::new(),
        }
    }

    /// Convenience constructor for the request that starts a saga.
    pub fn deletion_requested(user_id: impl Into<String>) -> Self {
        Self::new(EventType::UserDeletionRequested, user_id, None)
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Parses the correlation ID, if present and well formed.
    pub fn saga_id(&self) -> Option<SagaId> {
        self.saga_id.parse().ok()
    }

    /// Failure reason reported by a service in `data.error`.
    pub fn error_message(&self) -> Option<&str> {
        self.data.get("error").and_then(Value::as_str)
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}
