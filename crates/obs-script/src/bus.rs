//! Seams between a running script and the rest of the system
//!
//! Elements never reach other connections directly. Everything they need
//! from outside (signals, acquisition queries, astrometry, helper
//! processes) goes through a [`ScriptBus`] handed to them for the duration
//! of one call. The dispatcher implements it over all connections; a
//! [`LocalBus`] stands alone for a single script.

use crate::error::LaunchError;
use chrono::{DateTime, Utc};
use obs_core::events::AcquisitionOutcome;
use obs_core::{Command, DeviceKind, ImageInfo, ProcessId, Target, ValueSource};
use std::collections::{HashMap, HashSet};

/// The device connection a script runs against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConnection {
    pub name: String,
    pub kind: DeviceKind,
    /// An exposure is in progress
    pub exposing: bool,
    /// The last image is being read out
    pub reading_out: bool,
    /// Exposures queued to the device but not yet started
    pub queued_exposures: u32,
}

impl DeviceConnection {
    pub fn new(name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            exposing: false,
            reading_out: false,
            queued_exposures: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.exposing && !self.reading_out
    }
}

/// Services provided by the executor
pub trait Services {
    /// Ask for an astrometric solution of `image`; false if it cannot be done
    fn request_astrometry(&mut self, device: &str, image: &ImageInfo) -> bool;

    /// Start an external helper program
    fn launch(&mut self, device: &str, path: &str) -> Result<ProcessId, LaunchError>;

    /// Send one line to a helper's standard input
    fn write_to_process(&mut self, pid: ProcessId, line: &str);

    fn terminate(&mut self, pid: ProcessId);
}

/// Everything a script may ask of the world outside its own connection
pub trait ScriptBus: Services {
    /// Offer a signal to the other connections
    fn send_signal(&mut self, signal: i32);

    /// Whether some other connection is going to send `signal`
    fn will_send(&mut self, signal: i32) -> bool;

    /// Number of pending acquisitions for `obs_target_id` on other connections
    fn acquire_query(&mut self, obs_target_id: i32) -> i32;

    /// The acquisition master finished
    fn acquisition_ended(&mut self, outcome: AcquisitionOutcome);
}

/// Everything an element sees during one step
pub struct StepContext<'a> {
    pub connection: &'a DeviceConnection,
    pub values: &'a dyn ValueSource,
    pub bus: &'a mut dyn ScriptBus,
    pub target: Option<&'a Target>,
    /// Number of times the script already ran for the same target
    pub script_loop_count: u32,
    pub now: DateTime<Utc>,
    /// Commands to send before the one returned by the step
    pub queued: Vec<Command>,
}

impl<'a> StepContext<'a> {
    pub fn new(
        connection: &'a DeviceConnection,
        values: &'a dyn ValueSource,
        bus: &'a mut dyn ScriptBus,
        target: Option<&'a Target>,
    ) -> Self {
        Self {
            connection,
            values,
            bus,
            target,
            script_loop_count: 0,
            now: Utc::now(),
            queued: Vec::new(),
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Device an element addresses when it names none
    pub fn device_for<'d>(&'d self, device: &'d Option<String>) -> &'d str {
        device.as_deref().unwrap_or(&self.connection.name)
    }
}

/// A bus with no peer connections
///
/// Records everything it is asked to do, which makes it the bus of choice
/// for running a lone script and for tests.
#[derive(Debug, Default)]
pub struct LocalBus {
    pub sent_signals: Vec<i32>,
    /// Signals some other party promises to send
    pub promised_signals: HashSet<i32>,
    /// Answers to acquisition queries by `obs_target_id`
    pub pending_acquisitions: HashMap<i32, i32>,
    pub acquisition_ends: Vec<AcquisitionOutcome>,
    pub astrometry_requests: Vec<ImageInfo>,
    /// Reject astrometry requests
    pub refuse_astrometry: bool,
    pub launched: Vec<(String, String)>,
    pub written: Vec<(ProcessId, String)>,
    pub terminated: Vec<ProcessId>,
    /// Fail process launches
    pub refuse_launch: bool,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Services for LocalBus {
    fn request_astrometry(&mut self, _device: &str, image: &ImageInfo) -> bool {
        self.astrometry_requests.push(image.clone());
        !self.refuse_astrometry
    }

    fn launch(&mut self, device: &str, path: &str) -> Result<ProcessId, LaunchError> {
        if self.refuse_launch {
            return Err(LaunchError {
                path: path.to_string(),
                reason: "launching disabled".to_string(),
            });
        }
        self.launched.push((device.to_string(), path.to_string()));
        Ok(ProcessId(self.launched.len() as u32))
    }

    fn write_to_process(&mut self, pid: ProcessId, line: &str) {
        self.written.push((pid, line.to_string()));
    }

    fn terminate(&mut self, pid: ProcessId) {
        self.terminated.push(pid);
    }
}

impl ScriptBus for LocalBus {
    fn send_signal(&mut self, signal: i32) {
        self.sent_signals.push(signal);
    }

    fn will_send(&mut self, signal: i32) -> bool {
        self.promised_signals.contains(&signal)
    }

    fn acquire_query(&mut self, obs_target_id: i32) -> i32 {
        self.pending_acquisitions
            .get(&obs_target_id)
            .copied()
            .unwrap_or(0)
    }

    fn acquisition_ended(&mut self, outcome: AcquisitionOutcome) {
        self.acquisition_ends.push(outcome);
    }
}
