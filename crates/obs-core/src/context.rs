//! Context type for tracing which controller caused a notification

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Context carried by every published event
///
/// The `device` names the connection whose controller produced the event;
/// `parent_id` links follow-up events (an acquisition end caused by a script
/// teardown, for example) to the event that triggered them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    /// Unique identifier for this context (ULID)
    pub id: String,

    /// Connection that originated the event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Parent context ID for causality chains
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Context {
    /// Create a new context with a fresh ULID
    pub fn new() -> Self {
        Self {
            id: Ulid::new().to_string(),
            device: None,
            parent_id: None,
        }
    }

    /// Create a context originating from a device connection
    pub fn for_device(device: impl Into<String>) -> Self {
        Self {
            device: Some(device.into()),
            ..Self::new()
        }
    }

    /// Create a child context from the same device
    pub fn child(&self) -> Self {
        Self {
            id: Ulid::new().to_string(),
            device: self.device.clone(),
            parent_id: Some(self.id.clone()),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_keeps_device() {
        let ctx = Context::for_device("C0");
        let child = ctx.child();
        assert_eq!(child.device.as_deref(), Some("C0"));
        assert_eq!(child.parent_id.as_deref(), Some(ctx.id.as_str()));
        assert_ne!(child.id, ctx.id);
    }
}
