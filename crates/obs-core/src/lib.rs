//! Core types for the observation sequencer
//!
//! This crate provides the fundamental types shared by the script engine and
//! the executor: device commands with their blocking tags, targets, sky
//! positions, device values, and the events the controllers publish.

mod command;
mod context;
mod device;
mod event;
mod image;
mod position;
mod target;
mod value;

pub use command::{BopMask, Command, CommandKind, ValueOp};
pub use context::Context;
pub use device::DeviceKind;
pub use event::{Event, EventData, EventType};
pub use image::{AstrometryResult, ImageInfo, ProcessId};
pub use position::EquPosition;
pub use target::{AcquisitionState, Target, TargetError, TargetResult};
pub use value::{DeviceValue, ValueSource};

/// Pseudo-device name addressing the telescope of the current target.
///
/// Commands sent to it are never queued to a connection; the controller turns
/// them into a telescope change request instead.
pub const TELESCOPE_PSEUDO_DEVICE: &str = "TX";

/// Standard notifications published by the script controllers
pub mod events {
    use super::*;
    use serde::{Deserialize, Serialize};

    /// A script was built and started for a target
    pub const SCRIPT_STARTED: &str = "script_started";

    /// A script finished, was deleted, or was killed
    pub const SCRIPT_ENDED: &str = "script_ended";

    /// A connection started an acquisition exposure
    pub const ACQUISITION_START: &str = "acquisition_start";

    /// The acquisition master reported its result
    pub const ACQUISITION_END: &str = "acquisition_end";

    /// The telescope must be re-pointed at the target
    pub const TELESCOPE_RESYNC: &str = "telescope_resync";

    /// The telescope must be offset from the target
    pub const TELESCOPE_CHANGE: &str = "telescope_change";

    /// A target was put on a connection's blacklist
    pub const TARGET_DISABLED: &str = "target_disabled";

    /// A device value changed in the value store
    pub const VALUE_CHANGED: &str = "value_changed";

    /// Data for SCRIPT_STARTED events
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ScriptStartedData {
        pub device: String,
        pub target_id: i32,
        pub obs_id: i32,
        pub loop_count: u32,
        pub script: String,
    }

    impl EventData for ScriptStartedData {
        fn event_type() -> &'static str {
            SCRIPT_STARTED
        }
    }

    /// Data for SCRIPT_ENDED events
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ScriptEndedData {
        pub device: String,
        pub target_id: Option<i32>,
        pub executed: i64,
    }

    impl EventData for ScriptEndedData {
        fn event_type() -> &'static str {
            SCRIPT_ENDED
        }
    }

    /// Data for ACQUISITION_START events
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AcquisitionStartData {
        pub device: String,
        pub target_id: i32,
    }

    impl EventData for AcquisitionStartData {
        fn event_type() -> &'static str {
            ACQUISITION_START
        }
    }

    /// How an acquisition ended
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum AcquisitionOutcome {
        /// Pointing precision reached
        PrecisionOk,
        /// Acquisition gave up
        PrecisionFailed,
        /// The acquiring script was deleted before it finished
        Aborted,
    }

    /// Data for ACQUISITION_END events
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct AcquisitionEndData {
        pub device: String,
        pub outcome: AcquisitionOutcome,
    }

    impl EventData for AcquisitionEndData {
        fn event_type() -> &'static str {
            ACQUISITION_END
        }
    }

    /// Data for TELESCOPE_RESYNC events
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TelescopeResyncData {
        pub device: String,
        pub target_id: Option<i32>,
    }

    impl EventData for TelescopeResyncData {
        fn event_type() -> &'static str {
            TELESCOPE_RESYNC
        }
    }

    /// Data for TELESCOPE_CHANGE events; offsets are in degrees
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TelescopeChangeData {
        pub device: String,
        pub ra: f64,
        pub dec: f64,
    }

    impl EventData for TelescopeChangeData {
        fn event_type() -> &'static str {
            TELESCOPE_CHANGE
        }
    }

    /// Data for TARGET_DISABLED events
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TargetDisabledData {
        pub device: String,
        pub target_id: i32,
        pub obs_id: i32,
        pub reason: String,
    }

    impl EventData for TargetDisabledData {
        fn event_type() -> &'static str {
            TARGET_DISABLED
        }
    }

    /// Data for VALUE_CHANGED events
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ValueChangedData {
        pub device: String,
        pub name: String,
        pub old_value: Option<DeviceValue>,
        pub new_value: DeviceValue,
    }

    impl EventData for ValueChangedData {
        fn event_type() -> &'static str {
            VALUE_CHANGED
        }
    }
}
