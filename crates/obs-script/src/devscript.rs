//! Per-connection script controller
//!
//! A [`DevScript`] owns the script running on one device connection. It
//! builds the script when a target is assigned, polls it whenever the
//! device could accept a command, interprets the returned statuses and
//! reacts to exposure, move and image events. Commands leave through an
//! outbox drained by the executor; every command is acknowledged by id.

use crate::bus::{DeviceConnection, ScriptBus, StepContext};
use crate::exe::ExeControl;
use crate::script::{DeviceTiming, Script};
use crate::status::Status;
use chrono::{DateTime, Utc};
use obs_core::events::{
    AcquisitionEndData, AcquisitionOutcome, AcquisitionStartData, ScriptEndedData,
    ScriptStartedData, TargetDisabledData, TelescopeChangeData, TelescopeResyncData,
};
use obs_core::{
    AstrometryResult, BopMask, Command, CommandKind, Context, ImageInfo, ProcessId, Target,
    ValueOp, TELESCOPE_PSEUDO_DEVICE,
};
use obs_event_bus::NotificationBus;
use obs_value_store::ValueStore;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// What the script waits for before it may continue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WaitState {
    #[default]
    NoWait,
    /// Waiting for another connection to finish acquiring
    WaitSlave,
    /// This connection is acquiring for the others
    WaitMaster,
    WaitSignal,
    WaitMirror,
    WaitSearch,
}

/// Controller settings taken from the configuration
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DevScriptSettings {
    /// Ask the device to report the end of each script
    pub call_script_ends: bool,
    pub timing: DeviceTiming,
}

/// A command handed to the executor
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    /// Acknowledge with [`DevScript::command_ok`] or [`DevScript::command_failed`]
    pub id: u64,
    pub command: Command,
}

#[derive(Debug, Clone, Copy)]
struct Unacked {
    id: u64,
    exposure: bool,
}

/// Script controller of one device connection
pub struct DevScript {
    connection: DeviceConnection,
    settings: DevScriptSettings,
    values: Arc<ValueStore>,
    notifications: Arc<NotificationBus>,

    current: Option<Arc<Target>>,
    next: Option<Arc<Target>>,
    /// Target to start once the kill command is acknowledged
    kill_target: Option<Arc<Target>>,
    kill_command: Option<u64>,
    /// `(target_id, obs_id)` this connection refuses to run
    blacklist: Option<(i32, i32)>,

    script: Option<Script>,
    loop_count: u32,
    last_obs_target_id: Option<i32>,
    failed_count: u32,

    wait: WaitState,
    /// Waiting for the telescope or for the other connections
    wait_move: bool,
    /// The move wait came from a `W` barrier
    at_barrier: bool,

    held: Option<Command>,
    outbox: Vec<Outgoing>,
    unacked: Vec<Unacked>,
    next_id: u64,
}

impl DevScript {
    pub fn new(
        connection: DeviceConnection,
        settings: DevScriptSettings,
        values: Arc<ValueStore>,
        notifications: Arc<NotificationBus>,
    ) -> Self {
        Self {
            connection,
            settings,
            values,
            notifications,
            current: None,
            next: None,
            kill_target: None,
            kill_command: None,
            blacklist: None,
            script: None,
            loop_count: 0,
            last_obs_target_id: None,
            failed_count: 0,
            wait: WaitState::NoWait,
            wait_move: false,
            at_barrier: false,
            held: None,
            outbox: Vec::new(),
            unacked: Vec::new(),
            next_id: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.connection.name
    }

    pub fn connection(&self) -> &DeviceConnection {
        &self.connection
    }

    pub fn script(&self) -> Option<&Script> {
        self.script.as_ref()
    }

    pub fn has_script(&self) -> bool {
        self.script.is_some()
    }

    pub fn current_target(&self) -> Option<&Arc<Target>> {
        self.current.as_ref()
    }

    pub fn next_target(&self) -> Option<&Arc<Target>> {
        self.next.as_ref()
    }

    pub fn wait_state(&self) -> WaitState {
        self.wait
    }

    pub fn is_waiting_move(&self) -> bool {
        self.wait_move
    }

    /// Waiting at a `W` barrier
    pub fn at_barrier(&self) -> bool {
        self.at_barrier
    }

    pub fn blacklist(&self) -> Option<(i32, i32)> {
        self.blacklist
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub fn failed_count(&self) -> u32 {
        self.failed_count
    }

    /// The command waiting for the device to become ready
    pub fn held_command(&self) -> Option<&Command> {
        self.held.as_ref()
    }

    /// Commands to send, in order
    pub fn take_commands(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    fn context(&self) -> Context {
        Context::for_device(self.connection.name.clone())
    }

    fn queue(&mut self, command: Command) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let exposure = command.is_exposure();
        if exposure {
            self.connection.queued_exposures += 1;
        }
        debug!(device = %self.connection.name, id, command = %command, "Queueing command");
        self.unacked.push(Unacked { id, exposure });
        self.outbox.push(Outgoing { id, command });
        id
    }

    fn ack(&mut self, id: u64) -> Option<Unacked> {
        let pos = self.unacked.iter().position(|u| u.id == id)?;
        Some(self.unacked.remove(pos))
    }

    fn set_wait_move(&mut self) {
        self.wait_move = true;
    }

    fn publish_disabled(&self, target: &Target, reason: &str) {
        self.notifications.publish(
            TargetDisabledData {
                device: self.connection.name.clone(),
                target_id: target.target_id,
                obs_id: target.obs_id,
                reason: reason.to_string(),
            },
            self.context(),
        );
    }

    fn add_to_blacklist(&mut self, target: &Target, reason: &str) {
        warn!(
            device = %self.connection.name,
            target_id = target.target_id,
            obs_id = target.obs_id,
            reason,
            "Disabling target on this device"
        );
        self.blacklist = Some((target.target_id, target.obs_id));
        self.publish_disabled(target, reason);
    }

    /// Queue `target` as the next one; false if it is blacklisted
    pub fn set_next_target(&mut self, target: Arc<Target>) -> bool {
        if self.blacklist == Some((target.target_id, target.obs_id)) {
            warn!(
                device = %self.connection.name,
                target_id = target.target_id,
                obs_id = target.obs_id,
                "Ignoring blacklisted target"
            );
            self.next = None;
            return false;
        }
        self.next = Some(target);
        self.blacklist = None;
        true
    }

    /// Assign a target; starts it at once when nothing runs
    #[instrument(skip(self, target, bus), fields(device = %self.connection.name, target_id = target.target_id))]
    pub fn set_target(&mut self, target: Arc<Target>, bus: &mut dyn ScriptBus) {
        self.set_next_target(target);
        if self.current.is_some() {
            return;
        }
        self.start_target(bus);
        self.poll(bus);
    }

    /// Make the next target current and build its script
    #[instrument(skip(self, _bus), fields(device = %self.connection.name))]
    pub fn start_target(&mut self, _bus: &mut dyn ScriptBus) {
        if self.current.is_none() {
            let Some(next) = self.next.take() else {
                return;
            };
            self.current = Some(next);
        }
        let Some(target) = self.current.clone() else {
            return;
        };

        if self.last_obs_target_id == Some(target.obs_target_id) {
            self.loop_count += 1;
        } else {
            self.loop_count = 0;
        }

        let script = match Script::build(
            &target,
            &self.connection.name,
            self.loop_count,
            self.settings.timing,
        ) {
            Ok(script) => script,
            Err(e) => {
                error!(
                    device = %self.connection.name,
                    target_id = target.target_id,
                    error = %e,
                    "Cannot build script"
                );
                Script::empty(self.connection.name.clone())
            }
        };
        self.failed_count = 0;
        self.held = None;

        if self.settings.call_script_ends {
            self.queue(Command::new(self.connection.name.clone(), CommandKind::ScriptEnds));
        }
        self.queue(Command::change_value(
            self.connection.name.clone(),
            "SCRIPREP",
            ValueOp::Set,
            self.loop_count.to_string(),
        ));
        self.queue(
            Command::change_value(
                self.connection.name.clone(),
                "SCRIPT",
                ValueOp::Set,
                script.whole_script(),
            )
            .with_raw_value(),
        );

        info!(
            device = %self.connection.name,
            target_id = target.target_id,
            obs_id = target.obs_id,
            loop_count = self.loop_count,
            "Script started"
        );
        self.notifications.publish(
            ScriptStartedData {
                device: self.connection.name.clone(),
                target_id: target.target_id,
                obs_id: target.obs_id,
                loop_count: self.loop_count,
                script: script.whole_script().to_string(),
            },
            self.context(),
        );
        self.script = Some(script);
    }

    /// Tear the running script down
    #[instrument(skip(self, bus), fields(device = %self.connection.name))]
    pub fn delete_script(&mut self, bus: &mut dyn ScriptBus) {
        self.wait_move = false;
        self.at_barrier = false;
        if self.wait == WaitState::WaitMaster {
            debug!(device = %self.connection.name, "Acquiring script deleted");
            bus.acquisition_ended(AcquisitionOutcome::Aborted);
            self.notifications.publish(
                AcquisitionEndData {
                    device: self.connection.name.clone(),
                    outcome: AcquisitionOutcome::Aborted,
                },
                self.context(),
            );
        }
        self.wait = WaitState::NoWait;
        self.held = None;

        let Some(mut script) = self.script.take() else {
            return;
        };
        let executed = script.executed_count();
        let target = self.current.take();
        if let Some(target) = &target {
            self.last_obs_target_id = Some(target.obs_target_id);
            if executed == 0 {
                if target.target_id >= 0 {
                    self.add_to_blacklist(target, "script executed nothing");
                    if self
                        .next
                        .as_ref()
                        .is_some_and(|next| next.target_id == target.target_id)
                    {
                        self.next = None;
                    }
                } else {
                    error!(device = %self.connection.name, "Script of a virtual target failed");
                }
            } else if self.failed_count > 0 {
                self.add_to_blacklist(target, "previous execution failed");
            }
        }
        script.teardown(bus);
        info!(device = %self.connection.name, executed, "Script ended");
        self.notifications.publish(
            ScriptEndedData {
                device: self.connection.name.clone(),
                target_id: target.map(|t| t.target_id),
                executed,
            },
            self.context(),
        );
    }

    /// Delete the script and carry on with the next target
    fn end_script(&mut self, bus: &mut dyn ScriptBus) {
        self.delete_script(bus);
        self.start_target(bus);
        self.poll(bus);
    }

    fn step_script(&mut self, bus: &mut dyn ScriptBus) -> Option<Status> {
        let script = self.script.as_mut()?;
        let mut ctx = StepContext::new(
            &self.connection,
            self.values.as_ref(),
            bus,
            self.current.as_deref(),
        );
        let step = script.next_command(&mut ctx);
        let queued = std::mem::take(&mut ctx.queued);
        for command in queued {
            self.queue(command);
        }
        self.held = step.command;
        Some(step.status)
    }

    fn end_acquisition(&mut self, outcome: AcquisitionOutcome, bus: &mut dyn ScriptBus) {
        self.wait_move = false;
        self.at_barrier = false;
        self.wait = WaitState::NoWait;
        if let Some(target) = &self.current {
            match outcome {
                AcquisitionOutcome::PrecisionOk => target.acquisition_ok(),
                _ => target.acquisition_failed(),
            }
        }
        info!(device = %self.connection.name, outcome = ?outcome, "Acquisition ended");
        bus.acquisition_ended(outcome);
        self.notifications.publish(
            AcquisitionEndData {
                device: self.connection.name.clone(),
                outcome,
            },
            self.context(),
        );
    }

    /// Step the script unless a command is already waiting
    fn prepare_next(&mut self, bus: &mut dyn ScriptBus) -> Status {
        loop {
            if self.held.is_some() {
                return Status::Complete;
            }
            if matches!(
                self.wait,
                WaitState::WaitSignal | WaitState::WaitMirror | WaitState::WaitSearch
            ) {
                self.wait = WaitState::NoWait;
            }
            let Some(status) = self.step_script(bus) else {
                return Status::EndScript;
            };
            match status {
                Status::Waiting => self.set_wait_move(),
                Status::CheckWait => {
                    self.at_barrier = true;
                    self.set_wait_move();
                }
                Status::Resync => {
                    self.notifications.publish(
                        TelescopeResyncData {
                            device: self.connection.name.clone(),
                            target_id: self.current.as_ref().map(|t| t.target_id),
                        },
                        self.context(),
                    );
                    self.set_wait_move();
                }
                Status::PrecisionOk => {
                    self.end_acquisition(AcquisitionOutcome::PrecisionOk, bus);
                    continue;
                }
                Status::PrecisionFailed => {
                    self.end_acquisition(AcquisitionOutcome::PrecisionFailed, bus);
                    return Status::EndScript;
                }
                Status::WaitAcquisition => self.wait = WaitState::WaitSlave,
                Status::AcquisitionImage => {
                    if let Some(target) = &self.current {
                        target.acquisition_start();
                        self.notifications.publish(
                            AcquisitionStartData {
                                device: self.connection.name.clone(),
                                target_id: target.target_id,
                            },
                            self.context(),
                        );
                    }
                    self.wait = WaitState::WaitMaster;
                }
                Status::WaitSignal => self.wait = WaitState::WaitSignal,
                Status::WaitMirror => self.wait = WaitState::WaitMirror,
                Status::WaitSearch => self.wait = WaitState::WaitSearch,
                _ => {}
            }
            return status;
        }
    }

    fn can_end_script(&self) -> bool {
        self.outbox.is_empty()
            && self.unacked.is_empty()
            && !self.connection.exposing
            && self.connection.queued_exposures == 0
    }

    /// Whether the device state lets `command` leave now
    fn gate_open(&self, command: &Command) -> bool {
        if command.bop.contains(BopMask::EXPOSURE)
            && (self.connection.exposing || self.connection.queued_exposures > 0)
        {
            return false;
        }
        if command.bop.contains(BopMask::TEL_MOVE) && self.wait_move {
            return false;
        }
        if command.bop.contains(BopMask::WHILE_STATE) && !self.connection.is_idle() {
            return false;
        }
        true
    }

    /// Give the script a chance to issue its next command
    #[instrument(skip(self, bus), fields(device = %self.connection.name))]
    pub fn poll(&mut self, bus: &mut dyn ScriptBus) {
        if self.script.is_none() || self.wait == WaitState::WaitSlave {
            return;
        }
        if !self.unacked.is_empty() {
            return;
        }
        let status = self.prepare_next(bus);
        if status.is_end() {
            if !self.can_end_script() {
                return;
            }
            if status == Status::StopTarget {
                if let Some(target) = self.current.clone() {
                    self.add_to_blacklist(&target, "script stopped the target");
                }
            }
            debug!(device = %self.connection.name, "Ending script");
            self.delete_script(bus);
            self.start_target(bus);
            if self.script.is_none() {
                return;
            }
            if self.prepare_next(bus).is_end() {
                self.delete_script(bus);
                return;
            }
        }
        if self.wait_move
            || matches!(
                self.wait,
                WaitState::WaitSlave
                    | WaitState::WaitSignal
                    | WaitState::WaitMirror
                    | WaitState::WaitSearch
            )
        {
            return;
        }
        let Some(command) = self.held.take() else {
            return;
        };
        if command.device == TELESCOPE_PSEUDO_DEVICE {
            match command.kind {
                CommandKind::Offset { ra, dec } => {
                    debug!(device = %self.connection.name, ra, dec, "Telescope offset requested");
                    self.notifications.publish(
                        TelescopeChangeData {
                            device: self.connection.name.clone(),
                            ra,
                            dec,
                        },
                        self.context(),
                    );
                }
                _ => warn!(
                    device = %self.connection.name,
                    command = %command,
                    "Dropping telescope command"
                ),
            }
            self.set_wait_move();
            return;
        }
        if !self.gate_open(&command) {
            self.held = Some(command);
            return;
        }
        self.queue(command);
    }

    fn kill(&mut self, bus: &mut dyn ScriptBus) {
        self.current = None;
        self.next = None;
        self.wait_move = false;
        self.at_barrier = false;
        self.wait = WaitState::NoWait;
        if let Some(mut script) = self.script.take() {
            script.teardown(bus);
        }
        self.held = None;
    }

    fn queue_kill(&mut self, target: Option<Arc<Target>>) {
        self.kill_target = target;
        let id = self.queue(Command::new(self.connection.name.clone(), CommandKind::KillAll));
        self.kill_command = Some(id);
    }

    /// Abort everything on this connection
    #[instrument(skip(self, bus), fields(device = %self.connection.name))]
    pub fn kill_all(&mut self, bus: &mut dyn ScriptBus) {
        info!(device = %self.connection.name, "Killing script");
        self.kill(bus);
        self.blacklist = None;
    }

    /// Abort the current target and refuse to run it again
    #[instrument(skip(self, bus), fields(device = %self.connection.name))]
    pub fn stop_target(&mut self, bus: &mut dyn ScriptBus) {
        if let Some(target) = self.current.clone() {
            self.add_to_blacklist(&target, "target stopped");
        }
        self.kill(bus);
        self.queue_kill(None);
    }

    /// Abort everything, then start `target` once the device is killed
    #[instrument(skip(self, target, bus), fields(device = %self.connection.name, target_id = target.target_id))]
    pub fn set_target_kill(&mut self, target: Arc<Target>, bus: &mut dyn ScriptBus) {
        self.kill(bus);
        self.blacklist = None;
        self.queue_kill(Some(target));
    }

    /// End the observation without killing the device
    pub fn stop_observation(&mut self, bus: &mut dyn ScriptBus) {
        self.delete_script(bus);
    }

    /// The telescope or the other connections released the move wait
    pub fn clear_wait(&mut self, bus: &mut dyn ScriptBus) {
        self.wait_move = false;
        self.at_barrier = false;
        self.poll(bus);
    }

    fn command_done(&mut self, id: u64, bus: &mut dyn ScriptBus) {
        if self.kill_command == Some(id) {
            self.kill_command = None;
            if let Some(target) = self.kill_target.take() {
                if self.current.is_none() {
                    self.set_target(target, bus);
                    return;
                }
            }
        }
        self.poll(bus);
    }

    pub fn command_ok(&mut self, id: u64, bus: &mut dyn ScriptBus) {
        if self.ack(id).is_none() {
            debug!(device = %self.connection.name, id, "Acknowledgement of unknown command");
        }
        self.command_done(id, bus);
    }

    pub fn command_failed(&mut self, id: u64, bus: &mut dyn ScriptBus) {
        if let Some(unacked) = self.ack(id) {
            if unacked.exposure {
                self.connection.queued_exposures = self.connection.queued_exposures.saturating_sub(1);
            }
        }
        self.failed_count += 1;
        warn!(
            device = %self.connection.name,
            id,
            failed = self.failed_count,
            "Command failed"
        );
        self.command_done(id, bus);
    }

    pub fn exposure_started(&mut self, bus: &mut dyn ScriptBus) {
        self.connection.queued_exposures = self.connection.queued_exposures.saturating_sub(1);
        self.connection.exposing = true;
        self.poll(bus);
    }

    pub fn exposure_end(&mut self, expect_image: bool, bus: &mut dyn ScriptBus) {
        self.connection.exposing = false;
        self.connection.reading_out = expect_image;
        if let Some(script) = &mut self.script {
            script.exposure_end(bus);
        }
        self.poll(bus);
    }

    pub fn exposure_failed(&mut self, bus: &mut dyn ScriptBus) {
        warn!(device = %self.connection.name, "Exposure failed");
        self.connection.exposing = false;
        self.connection.reading_out = false;
        if let Some(script) = &mut self.script {
            script.exposure_failed(bus);
        }
        self.poll(bus);
    }

    pub fn readout_end(&mut self, bus: &mut dyn ScriptBus) {
        self.connection.reading_out = false;
        self.poll(bus);
    }

    /// The telescope reached its position
    pub fn move_ok(&mut self, bus: &mut dyn ScriptBus) {
        if let Some(target) = &self.current {
            target.set_moved();
        }
        if !self.at_barrier {
            self.wait_move = false;
        }
        self.poll(bus);
    }

    /// The telescope could not move; the script cannot continue
    pub fn move_failed(&mut self, bus: &mut dyn ScriptBus) {
        if self.script.is_none() {
            return;
        }
        warn!(device = %self.connection.name, "Telescope move failed, ending script");
        self.end_script(bus);
    }

    /// A new image from this connection
    pub fn image_ready(&mut self, image: &ImageInfo, bus: &mut dyn ScriptBus) {
        self.connection.reading_out = false;
        let taken = self
            .script
            .as_mut()
            .is_some_and(|script| script.process_image(image, bus));
        debug!(
            device = %self.connection.name,
            obs_id = image.obs_id,
            img_id = image.img_id,
            taken,
            "Image ready"
        );
        self.poll(bus);
    }

    /// An astrometric solution arrived; true if this script requested it
    pub fn astrometry_result(
        &mut self,
        obs_id: i32,
        img_id: i32,
        result: AstrometryResult,
        bus: &mut dyn ScriptBus,
    ) -> bool {
        let Some(script) = &mut self.script else {
            return false;
        };
        if !script.astrometry_result(obs_id, img_id, result) {
            return false;
        }
        if self.wait_move {
            self.poll(bus);
        }
        true
    }

    /// The acquisition master finished
    pub fn acquisition_end(&mut self, outcome: AcquisitionOutcome, bus: &mut dyn ScriptBus) {
        if self.wait != WaitState::WaitSlave {
            return;
        }
        self.wait = WaitState::NoWait;
        match outcome {
            AcquisitionOutcome::PrecisionOk => self.poll(bus),
            AcquisitionOutcome::PrecisionFailed | AcquisitionOutcome::Aborted => {
                info!(device = %self.connection.name, outcome = ?outcome, "Acquisition failed elsewhere");
                self.end_script(bus);
            }
        }
    }

    /// Offer a signal to the script; true if consumed
    pub fn deliver_signal(&mut self, signal: i32, bus: &mut dyn ScriptBus) -> bool {
        let consumed = self
            .script
            .as_mut()
            .is_some_and(|script| script.deliver_signal(signal));
        if consumed {
            if self.wait == WaitState::WaitSignal {
                self.wait = WaitState::NoWait;
            }
            self.poll(bus);
        }
        consumed
    }

    /// Whether the script is going to send `signal`
    pub fn will_send(&mut self, signal: i32) -> bool {
        self.script
            .as_mut()
            .is_some_and(|script| script.will_send(signal))
    }

    /// Acquisitions this connection still has to do for `obs_target_id`
    pub fn acquire_query(&self, obs_target_id: i32) -> i32 {
        if let Some(current) = &self.current {
            if current.obs_target_id == obs_target_id {
                if current.is_acquired() {
                    return 0;
                }
                let mut count = 0;
                if let Some(script) = &self.script {
                    script.acquire_query(&mut count);
                }
                return count;
            }
        }
        match &self.next {
            Some(next) if next.obs_target_id == obs_target_id => i32::from(!next.is_acquired()),
            _ => 0,
        }
    }

    /// A line from a helper process; true if this script owns the helper
    pub fn process_line(&mut self, pid: ProcessId, line: &str, bus: &mut dyn ScriptBus) -> bool {
        let Some(script) = self.script.as_mut() else {
            return false;
        };
        let mut ctx = StepContext::new(
            &self.connection,
            self.values.as_ref(),
            bus,
            self.current.as_deref(),
        );
        let control = script.process_line(pid, line, &mut ctx);
        let queued = std::mem::take(&mut ctx.queued);
        for command in queued {
            self.queue(command);
        }
        let Some(control) = control else {
            return false;
        };
        if control == ExeControl::EndTarget {
            debug!(device = %self.connection.name, "Helper dropped the queued target");
            self.next = None;
        }
        self.poll(bus);
        true
    }

    pub fn process_exited(&mut self, pid: ProcessId, bus: &mut dyn ScriptBus) -> bool {
        let exited = self
            .script
            .as_mut()
            .is_some_and(|script| script.process_exited(pid));
        if exited {
            self.poll(bus);
        }
        exited
    }

    /// Periodic tick
    pub fn idle(&mut self, now: DateTime<Utc>, bus: &mut dyn ScriptBus) {
        let Some(script) = &self.script else {
            return;
        };
        if script.idle(now) || script.executed_count() == 0 {
            self.poll(bus);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use obs_core::events::SCRIPT_STARTED;
    use obs_core::DeviceKind;

    struct Fixture {
        dev: DevScript,
        bus: LocalBus,
        notifications: Arc<NotificationBus>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_kind(DeviceKind::Camera)
        }

        fn with_kind(kind: DeviceKind) -> Self {
            let notifications = Arc::new(NotificationBus::new());
            let values = Arc::new(ValueStore::new(notifications.clone()));
            let dev = DevScript::new(
                DeviceConnection::new("C0", kind),
                DevScriptSettings::default(),
                values,
                notifications.clone(),
            );
            Self {
                dev,
                bus: LocalBus::new(),
                notifications,
            }
        }

        /// Acknowledge everything sent so far, returning the commands
        fn ack_all(&mut self) -> Vec<Command> {
            let mut sent = Vec::new();
            loop {
                let batch = self.dev.take_commands();
                if batch.is_empty() {
                    return sent;
                }
                for out in batch {
                    self.dev.command_ok(out.id, &mut self.bus);
                    sent.push(out.command);
                }
            }
        }

        /// Run one exposure through its device events
        fn expose(&mut self) {
            self.dev.exposure_started(&mut self.bus);
            self.dev.exposure_end(false, &mut self.bus);
        }
    }

    fn target(script: &str) -> Arc<Target> {
        Arc::new(Target::new(5, 50, "t").with_script("C0", script))
    }

    #[test]
    fn test_single_exposure_lifecycle() {
        let mut fx = Fixture::new();
        let mut started = fx.notifications.subscribe::<ScriptStartedData>();
        fx.dev.set_target(target("E 10"), &mut fx.bus);

        let sent = fx.ack_all();
        let names: Vec<String> = sent.iter().map(ToString::to_string).collect();
        assert_eq!(names, vec!["C0.SCRIPREP=0", "C0.SCRIPT=\"E 10\"", "C0.expose 10"]);
        assert!(fx.dev.has_script());

        fx.expose();
        assert!(!fx.dev.has_script());
        assert_eq!(fx.dev.blacklist(), None);
        let events = started.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_str(), SCRIPT_STARTED);
    }

    #[test]
    fn test_parse_error_blacklists() {
        let mut fx = Fixture::new();
        let mut disabled = fx.notifications.subscribe::<TargetDisabledData>();
        fx.dev.set_target(target("E"), &mut fx.bus);
        fx.ack_all();
        assert!(!fx.dev.has_script());
        assert_eq!(fx.dev.blacklist(), Some((5, 50)));
        assert_eq!(disabled.drain().len(), 1);

        assert!(!fx.dev.set_next_target(target("E 1")));
        assert!(fx.dev.next_target().is_none());
    }

    #[test]
    fn test_different_target_clears_blacklist() {
        let mut fx = Fixture::new();
        fx.dev.set_target(target("E"), &mut fx.bus);
        fx.ack_all();
        let other = Arc::new(Target::new(6, 60, "u").with_script("C0", "E 1"));
        assert!(fx.dev.set_next_target(other));
        assert_eq!(fx.dev.blacklist(), None);
    }

    #[test]
    fn test_loop_count_on_repeat() {
        let mut fx = Fixture::new();
        let t = target("E 1");
        fx.dev.set_target(t.clone(), &mut fx.bus);
        fx.ack_all();
        fx.dev.set_next_target(t);
        fx.expose();
        assert!(fx.dev.has_script());
        assert_eq!(fx.dev.loop_count(), 1);
    }

    #[test]
    fn test_exposure_gate() {
        let mut fx = Fixture::new();
        fx.dev.set_target(target("E 1 E 2"), &mut fx.bus);
        let sent = fx.ack_all();
        assert_eq!(sent.last().map(ToString::to_string), Some("C0.expose 1".to_string()));

        fx.dev.exposure_started(&mut fx.bus);
        assert!(fx.dev.take_commands().is_empty());
        assert!(fx.dev.held_command().is_some());

        fx.dev.exposure_end(true, &mut fx.bus);
        let sent = fx.ack_all();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to_string(), "C0.expose 2");
    }

    #[test]
    fn test_telescope_offset_waits_for_move() {
        let mut fx = Fixture::new();
        let mut changes = fx.notifications.subscribe::<TelescopeChangeData>();
        fx.dev.set_target(target("C 0.5 -0.5 E 1"), &mut fx.bus);
        fx.ack_all();
        assert!(fx.dev.is_waiting_move());
        let events = changes.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data.ra, 0.5);

        fx.dev.move_ok(&mut fx.bus);
        let sent = fx.ack_all();
        assert_eq!(sent[0].to_string(), "C0.expose 1");
    }

    #[test]
    fn test_stop_target_kills_and_blacklists() {
        let mut fx = Fixture::new();
        fx.dev.set_target(target("E 1 E 2"), &mut fx.bus);
        fx.ack_all();
        fx.dev.stop_target(&mut fx.bus);
        assert!(!fx.dev.has_script());
        assert!(fx.dev.current_target().is_none());
        assert_eq!(fx.dev.blacklist(), Some((5, 50)));
        let sent = fx.ack_all();
        assert!(matches!(sent[0].kind, CommandKind::KillAll));
    }

    #[test]
    fn test_set_target_kill_starts_after_ack() {
        let mut fx = Fixture::new();
        fx.dev.set_target(target("E 1"), &mut fx.bus);
        fx.ack_all();
        let other = Arc::new(Target::new(6, 60, "u").with_script("C0", "D 2"));
        fx.dev.set_target_kill(other, &mut fx.bus);
        assert!(!fx.dev.has_script());

        let sent = fx.ack_all();
        assert!(matches!(sent[0].kind, CommandKind::KillAll));
        assert_eq!(fx.dev.current_target().map(|t| t.target_id), Some(6));
    }

    #[test]
    fn test_slave_waits_for_acquisition() {
        let mut fx = Fixture::new();
        fx.bus.pending_acquisitions.insert(5, 1);
        fx.dev.set_target(target("Aw E 1"), &mut fx.bus);
        fx.ack_all();
        assert_eq!(fx.dev.wait_state(), WaitState::WaitSlave);

        fx.dev.acquisition_end(AcquisitionOutcome::PrecisionOk, &mut fx.bus);
        let sent = fx.ack_all();
        assert_eq!(sent[0].to_string(), "C0.expose 1");
    }

    #[test]
    fn test_failed_acquisition_elsewhere_ends_script() {
        let mut fx = Fixture::new();
        fx.bus.pending_acquisitions.insert(5, 1);
        fx.dev.set_target(target("Aw E 1"), &mut fx.bus);
        fx.ack_all();
        fx.dev.acquisition_end(AcquisitionOutcome::PrecisionFailed, &mut fx.bus);
        assert!(!fx.dev.has_script());
    }

    #[test]
    fn test_acquisition_master() {
        let mut fx = Fixture::new();
        let t = target("A 0.1 5 E 10");
        fx.dev.set_target(t.clone(), &mut fx.bus);
        let sent = fx.ack_all();
        assert_eq!(sent.last().map(ToString::to_string), Some("C0.expose 5".to_string()));
        assert_eq!(fx.dev.wait_state(), WaitState::WaitMaster);
        assert_eq!(fx.dev.acquire_query(5), 1);

        fx.expose();
        let image = ImageInfo {
            obs_id: 50,
            img_id: 1,
            path: "a.fits".to_string(),
        };
        fx.dev.image_ready(&image, &mut fx.bus);
        assert_eq!(fx.bus.astrometry_requests.len(), 1);

        let solved = AstrometryResult::Solved { precision: 0.05 };
        assert!(!fx.dev.astrometry_result(50, 2, solved, &mut fx.bus));
        assert!(fx.dev.astrometry_result(50, 1, solved, &mut fx.bus));
        assert_eq!(fx.bus.acquisition_ends, vec![AcquisitionOutcome::PrecisionOk]);
        assert!(t.is_acquired());
        assert_eq!(fx.dev.acquire_query(5), 0);
        let sent = fx.ack_all();
        assert_eq!(sent.last().map(ToString::to_string), Some("C0.expose 10".to_string()));
    }

    #[test]
    fn test_deleting_master_aborts_acquisition() {
        let mut fx = Fixture::new();
        fx.dev.set_target(target("A 0.1 5"), &mut fx.bus);
        fx.ack_all();
        fx.dev.stop_observation(&mut fx.bus);
        assert_eq!(fx.bus.acquisition_ends, vec![AcquisitionOutcome::Aborted]);
    }

    #[test]
    fn test_signal_wait() {
        let mut fx = Fixture::new();
        fx.bus.promised_signals.insert(3);
        fx.dev.set_target(target("SW 3 E 1"), &mut fx.bus);
        fx.ack_all();
        assert_eq!(fx.dev.wait_state(), WaitState::WaitSignal);
        assert!(!fx.dev.will_send(3));

        assert!(fx.dev.deliver_signal(3, &mut fx.bus));
        let sent = fx.ack_all();
        assert_eq!(sent[0].to_string(), "C0.expose 1");
    }

    #[test]
    fn test_failed_command_blacklists_at_end() {
        let mut fx = Fixture::new();
        fx.dev.set_target(target("filter=1 E 1"), &mut fx.bus);
        let batch = fx.dev.take_commands();
        for out in batch {
            fx.dev.command_ok(out.id, &mut fx.bus);
        }
        let batch = fx.dev.take_commands();
        assert_eq!(batch[0].command.to_string(), "C0.filter=1");
        fx.dev.command_failed(batch[0].id, &mut fx.bus);
        assert_eq!(fx.dev.failed_count(), 1);
        fx.ack_all();
        fx.expose();
        assert!(!fx.dev.has_script());
        assert_eq!(fx.dev.blacklist(), Some((5, 50)));
    }
}
