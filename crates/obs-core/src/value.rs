use serde::{Deserialize, Serialize};
use std::fmt;

/// A named value published by a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceValue {
    Number(f64),
    Text(String),
}

impl DeviceValue {
    /// Numeric view; text values that parse as numbers count as numbers
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DeviceValue::Number(n) => Some(*n),
            DeviceValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_f64().map(|v| v as i64)
    }
}

impl From<f64> for DeviceValue {
    fn from(v: f64) -> Self {
        DeviceValue::Number(v)
    }
}

impl From<&str> for DeviceValue {
    fn from(v: &str) -> Self {
        DeviceValue::Text(v.to_string())
    }
}

impl fmt::Display for DeviceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceValue::Number(n) => write!(f, "{}", n),
            DeviceValue::Text(s) => f.write_str(s),
        }
    }
}

/// Read access to device values by `(device, name)`
pub trait ValueSource {
    fn value(&self, device: &str, name: &str) -> Option<DeviceValue>;

    fn value_f64(&self, device: &str, name: &str) -> Option<f64> {
        self.value(device, name).and_then(|v| v.as_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_views() {
        assert_eq!(DeviceValue::Number(2.5).as_f64(), Some(2.5));
        assert_eq!(DeviceValue::from(" 3 ").as_i64(), Some(3));
        assert_eq!(DeviceValue::from("R").as_f64(), None);
    }

    #[test]
    fn test_untagged_serde() {
        let v: DeviceValue = serde_json::from_str("1.5").unwrap();
        assert_eq!(v, DeviceValue::Number(1.5));
        let v: DeviceValue = serde_json::from_str("\"open\"").unwrap();
        assert_eq!(v, DeviceValue::Text("open".to_string()));
    }
}
