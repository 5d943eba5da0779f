//! Notification bus for the script controllers
//!
//! Controllers publish what happened to their scripts (started, ended,
//! acquisition results, telescope requests) and observers such as the
//! executor loop or a logger subscribe to the notifications they care about.
//! Publishing never blocks and never fails: a notification nobody listens to
//! is dropped.

use dashmap::DashMap;
use obs_core::{Context, Event, EventData, EventType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Default channel capacity for subscriptions
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

type RawEvent = Event<serde_json::Value>;

/// Publish/subscribe hub for controller notifications
pub struct NotificationBus {
    /// Senders keyed by event type
    channels: DashMap<EventType, broadcast::Sender<RawEvent>>,
    /// Sender for subscribers of every notification
    all: broadcast::Sender<RawEvent>,
    /// Number of notifications published so far
    published: AtomicU64,
    capacity: usize,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (all, _) = broadcast::channel(capacity);
        Self {
            channels: DashMap::new(),
            all,
            published: AtomicU64::new(0),
            capacity,
        }
    }

    fn sender(&self, event_type: EventType) -> broadcast::Sender<RawEvent> {
        self.channels
            .entry(event_type)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Subscribe to one notification type, receiving typed payloads
    pub fn subscribe<T: EventData + serde::de::DeserializeOwned>(&self) -> Subscription<T> {
        let event_type = EventType::of::<T>();
        trace!(event_type = %event_type, "Subscribing to notification");
        Subscription::new(self.sender(event_type).subscribe())
    }

    /// Subscribe to every notification
    pub fn subscribe_all(&self) -> broadcast::Receiver<RawEvent> {
        self.all.subscribe()
    }

    /// Publish a notification
    pub fn publish<T: EventData + serde::Serialize>(&self, data: T, context: Context) {
        let event = Event::typed(data, context)
            .map_data(|data| serde_json::to_value(data).unwrap_or_default());
        debug!(
            event_type = %event.event_type,
            device = event.context.device.as_deref().unwrap_or("-"),
            "Publishing notification"
        );
        self.published.fetch_add(1, Ordering::Relaxed);

        if let Some(sender) = self.channels.get(&event.event_type) {
            // No receivers is not an error
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event);
    }

    /// Number of notifications published since creation
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Number of notification types with a channel
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed receiving end of a subscription
pub struct Subscription<T> {
    rx: broadcast::Receiver<RawEvent>,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: EventData + serde::de::DeserializeOwned> Subscription<T> {
    fn new(rx: broadcast::Receiver<RawEvent>) -> Self {
        Self {
            rx,
            _phantom: std::marker::PhantomData,
        }
    }

    fn decode(event: RawEvent) -> Option<Event<T>> {
        let data = serde_json::from_value::<T>(event.data.clone()).ok()?;
        Some(event.map_data(|_| data))
    }

    /// Wait for the next notification
    pub async fn recv(&mut self) -> Result<Event<T>, broadcast::error::RecvError> {
        loop {
            if let Some(event) = Self::decode(self.rx.recv().await?) {
                return Ok(event);
            }
        }
    }

    /// Take the next notification if one is already queued
    ///
    /// Lagged receivers skip ahead to the oldest retained notification.
    pub fn try_recv(&mut self) -> Option<Event<T>> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if let Some(event) = Self::decode(event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Drain every queued notification
    pub fn drain(&mut self) -> Vec<Event<T>> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// Shared handle to the notification bus
pub type SharedNotificationBus = Arc<NotificationBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use obs_core::events::{ScriptEndedData, ScriptStartedData, SCRIPT_STARTED};

    fn started(device: &str) -> ScriptStartedData {
        ScriptStartedData {
            device: device.to_string(),
            target_id: 7,
            obs_id: 70,
            loop_count: 0,
            script: "E 1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_publish_and_recv() {
        let bus = NotificationBus::new();
        let mut sub = bus.subscribe::<ScriptStartedData>();

        bus.publish(started("C0"), Context::for_device("C0"));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type.as_str(), SCRIPT_STARTED);
        assert_eq!(event.data.device, "C0");
        assert_eq!(event.context.device.as_deref(), Some("C0"));
    }

    #[test]
    fn test_try_recv_filters_by_type() {
        let bus = NotificationBus::new();
        let mut started_sub = bus.subscribe::<ScriptStartedData>();
        let mut ended_sub = bus.subscribe::<ScriptEndedData>();

        bus.publish(started("C0"), Context::new());
        bus.publish(started("C1"), Context::new());

        let events = started_sub.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data.device, "C1");
        assert!(ended_sub.try_recv().is_none());
    }

    #[test]
    fn test_subscribe_all_and_count() {
        let bus = NotificationBus::new();
        let mut all = bus.subscribe_all();

        bus.publish(started("C0"), Context::new());
        bus.publish(
            ScriptEndedData {
                device: "C0".to_string(),
                target_id: Some(7),
                executed: 1,
            },
            Context::new(),
        );

        assert_eq!(bus.published_count(), 2);
        assert!(all.try_recv().is_ok());
        assert!(all.try_recv().is_ok());
        assert!(all.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = NotificationBus::new();
        bus.publish(started("C0"), Context::new());
        assert_eq!(bus.published_count(), 1);
        assert_eq!(bus.channel_count(), 0);
    }
}
