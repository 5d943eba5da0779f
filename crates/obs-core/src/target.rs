//! Observation targets as seen by the script engine
//!
//! Targets belong to the scheduling layer. The engine only reads their
//! identifiers and scripts, and flips a few flags (acquisition state,
//! enabled, next observable time, priority boost) that the scheduler
//! picks up later.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

use crate::EquPosition;

/// Target lookup errors
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("target {target_id} has no script for device {device}")]
    NoScript { target_id: i32, device: String },
}

/// Result type for target operations
pub type TargetResult<T> = Result<T, TargetError>;

/// Acquisition state of a target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionState {
    #[default]
    NotAcquired,
    Acquiring,
    Acquired,
    Failed,
}

#[derive(Debug, Default)]
struct TargetFlags {
    acquisition: AcquisitionState,
    disabled: bool,
    next_observable: Option<DateTime<Utc>>,
    boost: Option<(DateTime<Utc>, i32)>,
    moved: bool,
}

/// A target assigned to device connections
#[derive(Debug)]
pub struct Target {
    pub target_id: i32,
    pub obs_id: i32,
    /// Identifier shared by all connections observing the same target;
    /// acquisition queries match on it
    pub obs_target_id: i32,
    pub name: String,
    pub position: Option<EquPosition>,
    scripts: HashMap<String, Vec<String>>,
    flags: RwLock<TargetFlags>,
}

impl Target {
    pub fn new(target_id: i32, obs_id: i32, name: impl Into<String>) -> Self {
        Self {
            target_id,
            obs_id,
            obs_target_id: target_id,
            name: name.into(),
            position: None,
            scripts: HashMap::new(),
            flags: RwLock::new(TargetFlags::default()),
        }
    }

    pub fn with_position(mut self, position: EquPosition) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_obs_target_id(mut self, obs_target_id: i32) -> Self {
        self.obs_target_id = obs_target_id;
        self
    }

    /// Append a script fragment for a device
    pub fn with_script(mut self, device: impl Into<String>, fragment: impl Into<String>) -> Self {
        self.scripts
            .entry(device.into())
            .or_default()
            .push(fragment.into());
        self
    }

    /// Script fragments for a device, in order
    pub fn script_fragments(&self, device: &str) -> TargetResult<&[String]> {
        self.scripts
            .get(device)
            .map(Vec::as_slice)
            .ok_or_else(|| TargetError::NoScript {
                target_id: self.target_id,
                device: device.to_string(),
            })
    }

    fn read(&self) -> RwLockReadGuard<'_, TargetFlags> {
        self.flags.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TargetFlags> {
        self.flags.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn acquisition_state(&self) -> AcquisitionState {
        self.read().acquisition
    }

    pub fn is_acquired(&self) -> bool {
        self.acquisition_state() == AcquisitionState::Acquired
    }

    pub fn acquisition_start(&self) {
        self.write().acquisition = AcquisitionState::Acquiring;
    }

    pub fn acquisition_ok(&self) {
        self.write().acquisition = AcquisitionState::Acquired;
    }

    pub fn acquisition_failed(&self) {
        self.write().acquisition = AcquisitionState::Failed;
    }

    pub fn is_enabled(&self) -> bool {
        !self.read().disabled
    }

    /// Disable the target for automatic scheduling
    pub fn disable(&self) {
        self.write().disabled = true;
    }

    /// Keep the scheduler away from the target until `when`
    pub fn set_next_observable(&self, when: DateTime<Utc>) {
        self.write().next_observable = Some(when);
    }

    pub fn next_observable(&self) -> Option<DateTime<Utc>> {
        self.read().next_observable
    }

    /// Raise the target priority by `bonus` until `until`
    pub fn boost(&self, until: DateTime<Utc>, bonus: i32) {
        self.write().boost = Some((until, bonus));
    }

    /// Priority bonus in effect at `now`
    pub fn boost_bonus(&self, now: DateTime<Utc>) -> i32 {
        match self.read().boost {
            Some((until, bonus)) if now < until => bonus,
            _ => 0,
        }
    }

    pub fn set_moved(&self) {
        self.write().moved = true;
    }

    pub fn was_moved(&self) -> bool {
        self.read().moved
    }
}

/// Seconds from `now`, saturating on overflow
pub(crate) fn after_seconds(now: DateTime<Utc>, seconds: f64) -> DateTime<Utc> {
    let millis = (seconds * 1000.0) as i64;
    now.checked_add_signed(Duration::milliseconds(millis))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl Target {
    /// Disable the target for `seconds` from `now`
    pub fn temp_disable(&self, now: DateTime<Utc>, seconds: f64) {
        self.set_next_observable(after_seconds(now, seconds));
    }

    /// Boost the target for `seconds` from `now`
    pub fn boost_for(&self, now: DateTime<Utc>, seconds: f64, bonus: i32) {
        self.boost(after_seconds(now, seconds), bonus);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_fragments() {
        let target = Target::new(5, 100, "M31")
            .with_script("C0", "E 10")
            .with_script("C0", "E 20");
        assert_eq!(target.script_fragments("C0").unwrap().len(), 2);
        assert!(matches!(
            target.script_fragments("C1"),
            Err(TargetError::NoScript { target_id: 5, .. })
        ));
    }

    #[test]
    fn test_acquisition_flags() {
        let target = Target::new(1, 1, "t");
        assert!(!target.is_acquired());
        target.acquisition_start();
        assert_eq!(target.acquisition_state(), AcquisitionState::Acquiring);
        target.acquisition_ok();
        assert!(target.is_acquired());
    }

    #[test]
    fn test_boost_expires() {
        let target = Target::new(1, 1, "t");
        let now = Utc::now();
        target.boost_for(now, 60.0, 5);
        assert_eq!(target.boost_bonus(now), 5);
        assert_eq!(target.boost_bonus(now + Duration::seconds(61)), 0);
    }

    #[test]
    fn test_temp_disable() {
        let target = Target::new(1, 1, "t");
        let now = Utc::now();
        target.temp_disable(now, 3600.0);
        assert_eq!(target.next_observable(), Some(now + Duration::seconds(3600)));
        assert!(target.is_enabled());
        target.disable();
        assert!(!target.is_enabled());
    }
}
