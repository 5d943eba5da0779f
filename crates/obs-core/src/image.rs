//! Handles exchanged with the image and process collaborators

use serde::{Deserialize, Serialize};
use std::fmt;

/// An image written by a camera connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub obs_id: i32,
    pub img_id: i32,
    pub path: String,
}

/// Result of an astrometric solution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AstrometryResult {
    /// Distance between the solved and requested position, in degrees
    Solved { precision: f64 },
    /// The image could not be solved
    Failed,
}

/// Identifier of an external helper process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc#{}", self.0)
    }
}
