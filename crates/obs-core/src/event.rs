//! Events published by the script controllers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Context;

/// Trait for typed event payloads
pub trait EventData: Clone + Send + Sync + 'static {
    /// The event type string for this payload
    fn event_type() -> &'static str;
}

/// Event type identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventType(String);

impl EventType {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self(event_type.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Event type of a typed payload
    pub fn of<T: EventData>() -> Self {
        Self::new(T::event_type())
    }
}

impl From<&str> for EventType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A published event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event<T = serde_json::Value> {
    pub event_type: EventType,
    pub data: T,
    pub time_fired: DateTime<Utc>,
    pub context: Context,
}

impl<T> Event<T> {
    /// Create a new event stamped with the current time
    pub fn new(event_type: impl Into<EventType>, data: T, context: Context) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            time_fired: Utc::now(),
            context,
        }
    }

    /// Replace the payload, keeping type, time and context
    pub fn map_data<U>(self, f: impl FnOnce(T) -> U) -> Event<U> {
        Event {
            event_type: self.event_type,
            data: f(self.data),
            time_fired: self.time_fired,
            context: self.context,
        }
    }
}

impl<T: EventData> Event<T> {
    /// Create a typed event
    pub fn typed(data: T, context: Context) -> Self {
        Self::new(EventType::of::<T>(), data, context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ScriptEndedData, SCRIPT_ENDED};

    #[test]
    fn test_typed_event_type() {
        let data = ScriptEndedData {
            device: "C0".to_string(),
            target_id: Some(10),
            executed: 3,
        };
        let event = Event::typed(data, Context::for_device("C0"));
        assert_eq!(event.event_type.as_str(), SCRIPT_ENDED);
        assert_eq!(event.data.executed, 3);
    }

    #[test]
    fn test_map_data() {
        let event = Event::new("x", 2, Context::new());
        let mapped = event.map_data(|v| v * 10);
        assert_eq!(mapped.data, 20);
        assert_eq!(mapped.event_type.as_str(), "x");
    }
}
