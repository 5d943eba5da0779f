//! Device value storage for the observation sequencer
//!
//! This crate provides the ValueStore, the process-wide table of named values
//! published by devices (`C0.exposure`, `T0.ra`, `W0.temperature`). Script
//! operands read it on every evaluation, exposure elements consult the camera
//! values before exposing, and every change fires a VALUE_CHANGED
//! notification.

use dashmap::DashMap;
use obs_core::events::ValueChangedData;
use obs_core::{Context, DeviceValue, ValueOp, ValueSource};
use obs_event_bus::NotificationBus;
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

/// Concurrent table of device values
pub struct ValueStore {
    /// Values keyed by `(device, name)`
    values: DashMap<(String, String), DeviceValue>,
    /// Value names per device, in insertion order
    device_index: DashMap<String, Vec<String>>,
    notifications: Arc<NotificationBus>,
}

impl ValueStore {
    pub fn new(notifications: Arc<NotificationBus>) -> Self {
        Self {
            values: DashMap::new(),
            device_index: DashMap::new(),
            notifications,
        }
    }

    /// Set a value, notifying subscribers when it changed
    #[instrument(skip(self, value, context))]
    pub fn set(
        &self,
        device: &str,
        name: &str,
        value: impl Into<DeviceValue>,
        context: Context,
    ) -> Option<DeviceValue> {
        let value = value.into();
        let key = (device.to_string(), name.to_string());
        let old_value = self.values.insert(key, value.clone());

        match &old_value {
            None => {
                self.device_index
                    .entry(device.to_string())
                    .or_default()
                    .push(name.to_string());
            }
            Some(old) if *old == value => {
                trace!("Value unchanged");
                return old_value;
            }
            Some(_) => {}
        }

        debug!(value = %value, "Setting device value");
        self.notifications.publish(
            ValueChangedData {
                device: device.to_string(),
                name: name.to_string(),
                old_value: old_value.clone(),
                new_value: value,
            },
            context,
        );
        old_value
    }

    /// Apply a script value change (`=`, `+=`, `-=`) to a stored value
    ///
    /// Add and subtract need a numeric operand and a numeric current value
    /// (missing counts as zero); anything else is stored verbatim.
    pub fn apply(&self, device: &str, name: &str, op: ValueOp, operand: &str, context: Context) {
        let parsed = operand.trim().parse::<f64>().ok();
        let new_value = match (op, parsed) {
            (ValueOp::Set, Some(n)) => DeviceValue::Number(n),
            (ValueOp::Set, None) => DeviceValue::Text(operand.to_string()),
            (op, Some(n)) => {
                let current = self.get_f64(device, name).unwrap_or(0.0);
                DeviceValue::Number(op.apply(current, n))
            }
            (op, None) => {
                warn!(device, name, operand, op = %op, "Cannot apply non-numeric operand");
                return;
            }
        };
        self.set(device, name, new_value, context);
    }

    pub fn get(&self, device: &str, name: &str) -> Option<DeviceValue> {
        self.values
            .get(&(device.to_string(), name.to_string()))
            .map(|v| v.clone())
    }

    pub fn get_f64(&self, device: &str, name: &str) -> Option<f64> {
        self.get(device, name).and_then(|v| v.as_f64())
    }

    /// All values of one device, in the order they were first set
    pub fn device_values(&self, device: &str) -> Vec<(String, DeviceValue)> {
        let Some(names) = self.device_index.get(device) else {
            return Vec::new();
        };
        names
            .iter()
            .filter_map(|name| self.get(device, name).map(|v| (name.clone(), v)))
            .collect()
    }

    /// Forget every value of a device
    pub fn remove_device(&self, device: &str) -> usize {
        let Some((_, names)) = self.device_index.remove(device) else {
            return 0;
        };
        for name in &names {
            self.values.remove(&(device.to_string(), name.clone()));
        }
        names.len()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl ValueSource for ValueStore {
    fn value(&self, device: &str, name: &str) -> Option<DeviceValue> {
        self.get(device, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obs_core::events::ValueChangedData;

    fn store() -> (Arc<NotificationBus>, ValueStore) {
        let bus = Arc::new(NotificationBus::new());
        let store = ValueStore::new(bus.clone());
        (bus, store)
    }

    #[test]
    fn test_set_and_get() {
        let (_, store) = store();
        assert!(store.set("C0", "exposure", 10.0, Context::new()).is_none());
        assert_eq!(store.get_f64("C0", "exposure"), Some(10.0));
        assert_eq!(store.value_f64("C0", "exposure"), Some(10.0));
        assert!(store.get("C1", "exposure").is_none());
    }

    #[test]
    fn test_change_notifications() {
        let (bus, store) = store();
        let mut sub = bus.subscribe::<ValueChangedData>();

        store.set("C0", "SHUTTER", 1.0, Context::new());
        store.set("C0", "SHUTTER", 1.0, Context::new());
        store.set("C0", "SHUTTER", 0.0, Context::new());

        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data.old_value, Some(DeviceValue::Number(1.0)));
        assert_eq!(events[1].data.new_value, DeviceValue::Number(0.0));
    }

    #[test]
    fn test_change_seen_by_async_subscriber() {
        let (bus, store) = store();
        let mut sub = bus.subscribe::<ValueChangedData>();
        store.set("T0", "ra", 10.5, Context::new());

        let event = tokio_test::block_on(sub.recv()).unwrap();
        assert_eq!(event.data.device, "T0");
        assert_eq!(event.data.new_value, DeviceValue::Number(10.5));
    }

    #[test]
    fn test_apply_ops() {
        let (_, store) = store();
        store.apply("W0", "focus", ValueOp::Set, "100", Context::new());
        store.apply("W0", "focus", ValueOp::Add, "5", Context::new());
        store.apply("W0", "focus", ValueOp::Subtract, "2.5", Context::new());
        assert_eq!(store.get_f64("W0", "focus"), Some(102.5));

        store.apply("W0", "filter", ValueOp::Set, "R", Context::new());
        assert_eq!(store.get("W0", "filter"), Some(DeviceValue::from("R")));

        store.apply("W0", "filter", ValueOp::Add, "B", Context::new());
        assert_eq!(store.get("W0", "filter"), Some(DeviceValue::from("R")));
    }

    #[test]
    fn test_device_values_and_remove() {
        let (_, store) = store();
        store.set("C0", "b", 2.0, Context::new());
        store.set("C0", "a", 1.0, Context::new());
        store.set("C1", "a", 1.0, Context::new());

        let names: Vec<_> = store.device_values("C0").into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["b", "a"]);

        assert_eq!(store.remove_device("C0"), 2);
        assert_eq!(store.len(), 1);
        assert!(store.device_values("C0").is_empty());
    }
}
