//! Script elements
//!
//! Every command of the script language parses into one [`Element`]. An
//! element is polled with [`Element::next_command`] until it reports that it
//! is done; in between it reacts to device and bus events delivered by the
//! owning script.

use crate::acquire::Acquisition;
use crate::block::Block;
use crate::bus::{ScriptBus, StepContext};
use crate::exe::{ExeBridge, ExeControl};
use crate::operand::Operand;
use crate::script::DeviceTiming;
use crate::status::{Reply, Status};
use chrono::{DateTime, Duration, Utc};
use obs_core::{
    AstrometryResult, BopMask, Command, CommandKind, DeviceKind, ImageInfo, ProcessId, ValueOp,
    TELESCOPE_PSEUDO_DEVICE,
};
use serde_json::{json, Value};
use std::fmt::Write;
use tracing::{debug, info, trace};

/// Location of an element in the whole-script text
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub len: usize,
}

/// Progress of an exposure element
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExposePhase {
    #[default]
    First,
    Shutter,
    Exposure,
}

/// The element variants
#[derive(Debug, Clone)]
pub enum ElementKind {
    /// `E` and `D`
    Expose {
        length: f64,
        light: bool,
        phase: ExposePhase,
    },
    Box {
        x: i32,
        y: i32,
        w: i32,
        h: i32,
    },
    Center {
        w: i32,
        h: i32,
    },
    /// Pointing offset in degrees
    Offset {
        ra: f64,
        dec: f64,
    },
    WaitMove,
    WaitAcquire {
        obs_target_id: i32,
    },
    Photometer {
        filter: i32,
        exposure: f64,
        count: i32,
    },
    SendSignal {
        signal: i32,
        /// Some other script waits for this signal
        asked_for: bool,
    },
    WaitSignal {
        signal: i32,
        received: bool,
    },
    ChangeValue {
        name: String,
        op: ValueOp,
        operands: Vec<Operand>,
        /// Blocks while any device state is active
        while_state: bool,
    },
    Acquire(Acquisition),
    Exe(ExeBridge),
    Command(String),
    Comment {
        text: String,
        number: u32,
    },
    Sleep {
        seconds: f64,
        deadline: Option<DateTime<Utc>>,
    },
    WaitFor {
        name: String,
        target: f64,
        range: f64,
    },
    WaitIdle,
    TargetDisable,
    /// Time operand in seconds
    TempDisable(Operand),
    TarBoost {
        seconds: i32,
        bonus: i32,
    },
    Nop,
    Block(Block),
}

/// One parsed script command
#[derive(Debug, Clone)]
pub struct Element {
    pub span: Span,
    /// Explicit device; `None` means the script's default device
    pub device: Option<String>,
    pub kind: ElementKind,
}

impl Element {
    pub fn new(kind: ElementKind) -> Self {
        Self {
            span: Span::default(),
            device: None,
            kind,
        }
    }

    pub fn with_device(mut self, device: Option<String>) -> Self {
        self.device = device;
        self
    }

    pub fn with_span(mut self, start: usize, len: usize) -> Self {
        self.span = Span { start, len };
        self
    }

    pub fn is_comment(&self) -> bool {
        matches!(self.kind, ElementKind::Comment { .. })
    }

    pub fn as_block(&self) -> Option<&Block> {
        match &self.kind {
            ElementKind::Block(block) => Some(block),
            _ => None,
        }
    }

    /// One poll of the element
    pub fn next_command(&mut self, ctx: &mut StepContext<'_>) -> Reply {
        let device = ctx.device_for(&self.device).to_string();
        let kind = ctx.connection.kind;
        match &mut self.kind {
            ElementKind::Expose { .. }
            | ElementKind::Box { .. }
            | ElementKind::Center { .. }
            | ElementKind::Acquire(_)
                if kind != DeviceKind::Camera =>
            {
                Reply::next()
            }
            ElementKind::Photometer { .. } if kind != DeviceKind::Photometer => Reply::next(),
            ElementKind::Expose {
                length,
                light,
                phase,
            } => expose_step(&device, *length, *light, phase, ctx),
            ElementKind::Box { x, y, w, h } => Reply::command(
                Status::Complete,
                Command::new(
                    &device,
                    CommandKind::Box {
                        x: *x,
                        y: *y,
                        w: *w,
                        h: *h,
                    },
                ),
            ),
            ElementKind::Center { w, h } => Reply::command(
                Status::Complete,
                Command::new(&device, CommandKind::Center { w: *w, h: *h }),
            ),
            ElementKind::Offset { ra, dec } => {
                let device = self.device.as_deref().unwrap_or(TELESCOPE_PSEUDO_DEVICE);
                Reply::command(
                    Status::Complete,
                    Command::new(device, CommandKind::Offset { ra: *ra, dec: *dec }),
                )
            }
            ElementKind::WaitMove => Reply::status(Status::CheckWait),
            ElementKind::WaitAcquire { obs_target_id } => {
                let pending = ctx.bus.acquire_query(*obs_target_id);
                trace!(device = %device, obs_target_id = *obs_target_id, pending, "Acquisition query");
                if pending > 0 {
                    Reply::status(Status::WaitAcquisition)
                } else {
                    Reply::next()
                }
            }
            ElementKind::Photometer {
                filter,
                exposure,
                count,
            } => Reply::command(
                Status::Complete,
                Command::new(
                    &device,
                    CommandKind::Integrate {
                        filter: *filter,
                        exposure: *exposure,
                        count: *count,
                    },
                ),
            ),
            ElementKind::SendSignal { signal, asked_for } => {
                debug!(device = %device, signal = *signal, "Sending signal");
                ctx.bus.send_signal(*signal);
                *asked_for = false;
                Reply::next()
            }
            ElementKind::WaitSignal { signal, received } => {
                if *received {
                    Reply::next()
                } else if ctx.bus.will_send(*signal) {
                    Reply::status(Status::WaitSignal)
                } else {
                    debug!(device = %device, signal = *signal, "Nobody will send signal, skipping wait");
                    Reply::next()
                }
            }
            ElementKind::ChangeValue {
                name,
                op,
                operands,
                while_state,
            } => {
                let rendered: Vec<String> = operands
                    .iter()
                    .map(|o| o.render(ctx.values, &device))
                    .collect();
                let mut command = Command::change_value(&device, name.as_str(), *op, rendered.join(" "));
                if operands.len() > 1 {
                    command = command.with_raw_value();
                }
                let bop = if *while_state {
                    BopMask::TEL_MOVE | BopMask::WHILE_STATE
                } else {
                    BopMask::TEL_MOVE
                };
                Reply::command(Status::Complete, command.with_bop(bop))
            }
            ElementKind::Acquire(acquisition) => acquisition.next_command(&device, &mut ctx.queued),
            ElementKind::Exe(exe) => exe.next_command(&device, ctx),
            ElementKind::Command(text) => {
                Reply::command(Status::Complete, Command::raw(&device, text.as_str()))
            }
            ElementKind::Comment { text, number } => {
                ctx.queued.push(Command::change_value(
                    &device,
                    "COMM_NUM",
                    ValueOp::Set,
                    number.to_string(),
                ));
                Reply::command(
                    Status::Complete,
                    Command::change_value(&device, "SCR_COMM", ValueOp::Set, text.as_str())
                        .with_raw_value(),
                )
            }
            ElementKind::Sleep { seconds, deadline } => match deadline {
                None => {
                    *deadline = Some(ctx.now + seconds_duration(*seconds));
                    Reply::status(Status::Keep)
                }
                Some(until) if ctx.now >= *until => {
                    *deadline = None;
                    Reply::next()
                }
                Some(_) => Reply::status(Status::Keep),
            },
            ElementKind::WaitFor {
                name,
                target,
                range,
            } => match ctx.values.value_f64(&device, name) {
                Some(value) if (value - *target).abs() <= *range => Reply::next(),
                _ => Reply::status(Status::Keep),
            },
            ElementKind::WaitIdle => {
                if ctx.connection.is_idle() {
                    Reply::next()
                } else {
                    Reply::status(Status::Keep)
                }
            }
            ElementKind::TargetDisable => {
                if let Some(target) = ctx.target {
                    info!(device = %device, target_id = target.target_id, "Disabling target");
                    target.disable();
                }
                Reply::next()
            }
            ElementKind::TempDisable(time) => {
                let seconds = time.eval(ctx.values, &device);
                if let Some(target) = ctx.target {
                    info!(device = %device, target_id = target.target_id, seconds, "Disabling target for a while");
                    target.temp_disable(ctx.now, seconds);
                }
                Reply::next()
            }
            ElementKind::TarBoost { seconds, bonus } => {
                if let Some(target) = ctx.target {
                    target.boost_for(ctx.now, f64::from(*seconds), *bonus);
                }
                Reply::next()
            }
            ElementKind::Nop => Reply::next(),
            ElementKind::Block(block) => block.next_command(ctx),
        }
    }

    /// Whether an idle tick should poll the element again
    pub fn idle_call(&self, now: DateTime<Utc>) -> bool {
        match &self.kind {
            ElementKind::Sleep {
                deadline: Some(until),
                ..
            } => now >= *until,
            ElementKind::WaitFor { .. } | ElementKind::WaitIdle => true,
            ElementKind::Block(block) => block.idle_call(now),
            _ => false,
        }
    }

    /// Consume `signal` if this element waits for it
    pub fn wait_for_signal(&mut self, signal: i32) -> bool {
        match &mut self.kind {
            ElementKind::WaitSignal {
                signal: own,
                received,
            } if *own == signal && !*received => {
                *received = true;
                true
            }
            ElementKind::Block(block) => block.wait_for_signal(signal),
            _ => false,
        }
    }

    /// Mark a send of `signal` as awaited; true if this element will send it
    pub fn will_send(&mut self, signal: i32) -> bool {
        match &mut self.kind {
            ElementKind::SendSignal {
                signal: own,
                asked_for,
            } if *own == signal => {
                *asked_for = true;
                true
            }
            ElementKind::Block(block) => block.will_send(signal),
            _ => false,
        }
    }

    /// Count pending acquisitions
    pub fn acquire_query(&self, count: &mut i32) {
        match &self.kind {
            ElementKind::Acquire(_) => *count += 1,
            ElementKind::Block(block) => block.acquire_query(count),
            _ => {}
        }
    }

    pub fn exposure_end(&mut self, bus: &mut dyn ScriptBus) {
        match &mut self.kind {
            ElementKind::Exe(exe) => exe.notify(bus, "exposure_end"),
            ElementKind::Block(block) => block.exposure_end(bus),
            _ => {}
        }
    }

    pub fn exposure_failed(&mut self, bus: &mut dyn ScriptBus) {
        match &mut self.kind {
            ElementKind::Acquire(acquisition) => acquisition.fail(),
            ElementKind::Exe(exe) => exe.notify(bus, "exposure_failed"),
            ElementKind::Block(block) => block.exposure_failed(bus),
            _ => {}
        }
    }

    /// Offer an image; true if an acquisition took it
    pub fn process_image(&mut self, device: &str, image: &ImageInfo, bus: &mut dyn ScriptBus) -> bool {
        match &mut self.kind {
            ElementKind::Acquire(acquisition) => {
                if !acquisition.image_ready(image) {
                    return false;
                }
                let accepted = bus.request_astrometry(device, image);
                acquisition.astrometry_requested(accepted);
                true
            }
            ElementKind::Block(block) => block.process_image(device, image, bus),
            _ => false,
        }
    }

    pub fn astrometry_result(&mut self, obs_id: i32, img_id: i32, result: AstrometryResult) -> bool {
        match &mut self.kind {
            ElementKind::Acquire(acquisition) => acquisition.astrometry_result(obs_id, img_id, result),
            ElementKind::Block(block) => block.astrometry_result(obs_id, img_id, result),
            _ => false,
        }
    }

    pub fn process_line(
        &mut self,
        pid: ProcessId,
        line: &str,
        ctx: &mut StepContext<'_>,
    ) -> Option<ExeControl> {
        match &mut self.kind {
            ElementKind::Exe(exe) => {
                let device = ctx.device_for(&self.device).to_string();
                exe.process_line(pid, line, &device, ctx)
            }
            ElementKind::Block(block) => block.process_line(pid, line, ctx),
            _ => None,
        }
    }

    pub fn process_exited(&mut self, pid: ProcessId) -> bool {
        match &mut self.kind {
            ElementKind::Exe(exe) => exe.process_exited(pid),
            ElementKind::Block(block) => block.process_exited(pid),
            _ => false,
        }
    }

    /// The running operation was cancelled
    pub fn cancel(&mut self, bus: &mut dyn ScriptBus) {
        match &mut self.kind {
            ElementKind::Acquire(acquisition) => acquisition.fail(),
            ElementKind::Exe(exe) => exe.terminate(bus),
            ElementKind::Block(block) => block.cancel(bus),
            _ => {}
        }
    }

    /// The script is being torn down
    pub fn not_active(&mut self, bus: &mut dyn ScriptBus) {
        match &mut self.kind {
            ElementKind::SendSignal { signal, asked_for } if *asked_for => {
                debug!(signal = *signal, "Sending awaited signal at teardown");
                bus.send_signal(*signal);
                *asked_for = false;
            }
            ElementKind::Exe(exe) => exe.terminate(bus),
            ElementKind::Block(block) => block.not_active(bus),
            _ => {}
        }
    }

    /// Span of the innermost active element
    pub fn current_span(&self) -> Span {
        match &self.kind {
            ElementKind::Block(block) => block.current_span().unwrap_or(self.span),
            _ => self.span,
        }
    }

    /// Script keyword of the element
    pub fn keyword(&self) -> &'static str {
        match &self.kind {
            ElementKind::Expose { light: true, .. } => "E",
            ElementKind::Expose { light: false, .. } => "D",
            ElementKind::Box { .. } => "BOX",
            ElementKind::Center { .. } => "center",
            ElementKind::Offset { .. } => "C",
            ElementKind::WaitMove => "W",
            ElementKind::WaitAcquire { .. } => "Aw",
            ElementKind::Photometer { .. } => "P",
            ElementKind::SendSignal { .. } => "SS",
            ElementKind::WaitSignal { .. } => "SW",
            ElementKind::ChangeValue { .. } => "change",
            ElementKind::Acquire(_) => "A",
            ElementKind::Exe(_) => "exe",
            ElementKind::Command(_) => "command",
            ElementKind::Comment { .. } => "comment",
            ElementKind::Sleep { .. } => "sleep",
            ElementKind::WaitFor { .. } => "waitfor",
            ElementKind::WaitIdle => "waitidle",
            ElementKind::TargetDisable => "tardisable",
            ElementKind::TempDisable(_) => "tempdisable",
            ElementKind::TarBoost { .. } => "tarboost",
            ElementKind::Nop => "nop",
            ElementKind::Block(block) => block.keyword(),
        }
    }

    /// Append the re-parseable script form; comments and no-ops print nothing
    pub fn print_script(&self, out: &mut String) {
        if matches!(self.kind, ElementKind::Comment { .. } | ElementKind::Nop) {
            return;
        }
        if let Some(device) = &self.device {
            let _ = write!(out, "{}.", device);
        }
        let _ = match &self.kind {
            ElementKind::Expose { length, .. } => write!(out, "{} {}", self.keyword(), length),
            ElementKind::Box { x, y, w, h } => write!(out, "BOX {} {} {} {}", x, y, w, h),
            ElementKind::Center { w, h } => write!(out, "center {} {}", w, h),
            ElementKind::Offset { ra, dec } => write!(out, "C {} {}", ra, dec),
            ElementKind::WaitAcquire { .. } | ElementKind::WaitMove => {
                write!(out, "{}", self.keyword())
            }
            ElementKind::Photometer {
                filter,
                exposure,
                count,
            } => write!(out, "P {} {} {}", filter, exposure, count),
            ElementKind::SendSignal { signal, .. } => write!(out, "SS {}", signal),
            ElementKind::WaitSignal { signal, .. } => write!(out, "SW {}", signal),
            ElementKind::ChangeValue {
                name,
                op,
                operands,
                while_state,
            } => write!(
                out,
                "{}{}{}{}",
                if *while_state { "!" } else { "" },
                name,
                op,
                join_operands(operands)
            ),
            ElementKind::Acquire(acq) => write!(out, "A {} {}", acq.precision, acq.exposure),
            ElementKind::Exe(exe) => write!(out, "exe {}", exe.path),
            ElementKind::Command(text) => write!(out, "command {}", text),
            ElementKind::Sleep { seconds, .. } => write!(out, "sleep {}", seconds),
            ElementKind::WaitFor {
                name,
                target,
                range,
            } => write!(out, "waitfor {} {} {}", name, target, range),
            ElementKind::WaitIdle | ElementKind::TargetDisable => {
                write!(out, "{}", self.keyword())
            }
            ElementKind::TempDisable(time) => write!(out, "tempdisable {}", time),
            ElementKind::TarBoost { seconds, bonus } => {
                write!(out, "tarboost {} {}", seconds, bonus)
            }
            ElementKind::Block(block) => {
                block.print_script(out);
                Ok(())
            }
            ElementKind::Comment { .. } | ElementKind::Nop => Ok(()),
        };
    }

    /// Like [`Element::print_script`], but a block stops at its opening brace
    pub fn print_head(&self, out: &mut String) {
        match &self.kind {
            ElementKind::Block(block) => {
                if let Some(device) = &self.device {
                    let _ = write!(out, "{}.", device);
                }
                block.print_header(out);
            }
            _ => self.print_script(out),
        }
    }

    /// JSON description of the element
    pub fn to_json(&self) -> Value {
        let mut object = match &self.kind {
            ElementKind::Expose { length, .. } => json!({ "duration": length }),
            ElementKind::Box { x, y, w, h } => json!({ "x": x, "y": y, "w": w, "h": h }),
            ElementKind::Center { w, h } => json!({ "w": w, "h": h }),
            ElementKind::Offset { ra, dec } => json!({ "ra": ra, "dec": dec }),
            ElementKind::WaitAcquire { obs_target_id } => json!({ "target": obs_target_id }),
            ElementKind::Photometer {
                filter,
                exposure,
                count,
            } => json!({ "filter": filter, "duration": exposure, "count": count }),
            ElementKind::SendSignal { signal, .. } | ElementKind::WaitSignal { signal, .. } => {
                json!({ "signal": signal })
            }
            ElementKind::ChangeValue {
                name,
                op,
                operands,
                while_state,
            } => json!({
                "name": name,
                "op": op.as_str(),
                "operands": join_operands(operands),
                "while_state": while_state,
            }),
            ElementKind::Acquire(acq) => json!({
                "precision": acq.precision,
                "duration": acq.exposure,
                "state": acq.state(),
            }),
            ElementKind::Exe(exe) => json!({ "path": exe.path }),
            ElementKind::Command(text) => json!({ "command": text }),
            ElementKind::Comment { text, number } => json!({ "comment": text, "number": number }),
            ElementKind::Sleep { seconds, .. } => json!({ "duration": seconds }),
            ElementKind::WaitFor {
                name,
                target,
                range,
            } => json!({ "name": name, "value": target, "range": range }),
            ElementKind::TempDisable(time) => json!({ "time": time.to_string() }),
            ElementKind::TarBoost { seconds, bonus } => json!({ "seconds": seconds, "bonus": bonus }),
            ElementKind::Block(block) => block.to_json(),
            ElementKind::WaitMove
            | ElementKind::WaitIdle
            | ElementKind::TargetDisable
            | ElementKind::Nop => json!({}),
        };
        if let Value::Object(map) = &mut object {
            map.insert("cmd".to_string(), json!(self.keyword()));
            if let Some(device) = &self.device {
                map.insert("device".to_string(), json!(device));
            }
        }
        object
    }

    /// Indented human readable description
    pub fn pretty(&self, indent: usize, out: &mut String) {
        let pad = "  ".repeat(indent);
        match &self.kind {
            ElementKind::Block(block) => block.pretty(indent, out),
            ElementKind::Comment { text, number } => {
                let _ = writeln!(out, "{}# {} ({})", pad, text, number);
            }
            _ => {
                let mut line = String::new();
                self.print_script(&mut line);
                let _ = writeln!(out, "{}{}", pad, line);
            }
        }
    }

    /// Expected duration in seconds
    pub fn expected_duration(&self, timing: &DeviceTiming) -> f64 {
        match &self.kind {
            ElementKind::Expose { length, .. } => length + timing.readout_time,
            ElementKind::Photometer {
                exposure, count, ..
            } => exposure * f64::from(*count),
            ElementKind::ChangeValue { name, .. } if name == "filter" => timing.filter_movement,
            ElementKind::Acquire(acq) => acq.expected_duration(timing.readout_time),
            ElementKind::Sleep { seconds, .. } => *seconds,
            ElementKind::Block(block) => block.expected_duration(timing),
            _ => 0.0,
        }
    }

    /// Expected open-shutter time in seconds
    pub fn expected_light_time(&self) -> f64 {
        match &self.kind {
            ElementKind::Expose {
                length,
                light: true,
                ..
            } => *length,
            ElementKind::Block(block) => block.expected_light_time(),
            _ => 0.0,
        }
    }

    pub fn expected_images(&self) -> u32 {
        match &self.kind {
            ElementKind::Expose { .. } => 1,
            ElementKind::Block(block) => block.expected_images(),
            _ => 0,
        }
    }
}

fn join_operands(operands: &[Operand]) -> String {
    operands
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub(crate) fn seconds_duration(seconds: f64) -> Duration {
    Duration::milliseconds((seconds * 1000.0) as i64)
}

/// Shutter, then exposure time, then the exposure itself
fn expose_step(
    device: &str,
    length: f64,
    light: bool,
    phase: &mut ExposePhase,
    ctx: &mut StepContext<'_>,
) -> Reply {
    if *phase == ExposePhase::First {
        if ctx.connection.queued_exposures > 0 {
            return Reply::status(Status::Keep);
        }
        *phase = ExposePhase::Shutter;
        let shutter = if light { 0.0 } else { 1.0 };
        if ctx
            .values
            .value_f64(device, "SHUTTER")
            .is_some_and(|v| v != shutter)
        {
            return Reply::command(
                Status::Keep,
                Command::change_value(device, "SHUTTER", ValueOp::Set, shutter.to_string())
                    .with_bop(BopMask::TEL_MOVE),
            );
        }
    }
    if *phase == ExposePhase::Shutter {
        *phase = ExposePhase::Exposure;
        if ctx
            .values
            .value_f64(device, "exposure")
            .is_some_and(|v| v != length)
        {
            return Reply::command(
                Status::Keep,
                Command::change_value(device, "exposure", ValueOp::Set, length.to_string())
                    .with_bop(BopMask::TEL_MOVE),
            );
        }
    }
    *phase = ExposePhase::First;
    let bop = if light { BopMask::EXPOSURE } else { BopMask::NONE };
    Reply::command(Status::Complete, Command::exposure(device, length, light).with_bop(bop))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DeviceConnection, LocalBus};
    use obs_core::{Context, Target};
    use obs_event_bus::NotificationBus;
    use obs_value_store::ValueStore;
    use std::sync::Arc;

    struct Fixture {
        connection: DeviceConnection,
        values: ValueStore,
        bus: LocalBus,
        target: Target,
    }

    impl Fixture {
        fn new(kind: DeviceKind) -> Self {
            Self {
                connection: DeviceConnection::new("C0", kind),
                values: ValueStore::new(Arc::new(NotificationBus::new())),
                bus: LocalBus::new(),
                target: Target::new(7, 70, "t"),
            }
        }

        fn step(&mut self, element: &mut Element) -> (Reply, Vec<Command>) {
            let mut ctx =
                StepContext::new(&self.connection, &self.values, &mut self.bus, Some(&self.target));
            let reply = element.next_command(&mut ctx);
            (reply, ctx.queued)
        }
    }

    fn expose(length: f64) -> Element {
        Element::new(ElementKind::Expose {
            length,
            light: true,
            phase: ExposePhase::First,
        })
    }

    #[test]
    fn test_expose_sets_values_first() {
        let mut fx = Fixture::new(DeviceKind::Camera);
        fx.values.set("C0", "SHUTTER", 1.0, Context::new());
        fx.values.set("C0", "exposure", 5.0, Context::new());
        let mut element = expose(10.0);

        let (reply, _) = fx.step(&mut element);
        assert_eq!(reply.status, Status::Keep);
        assert_eq!(reply.command.unwrap().to_string(), "C0.SHUTTER=0");

        let (reply, _) = fx.step(&mut element);
        assert_eq!(reply.status, Status::Keep);
        assert_eq!(reply.command.unwrap().to_string(), "C0.exposure=10");

        let (reply, _) = fx.step(&mut element);
        assert_eq!(reply.status, Status::Complete);
        assert_eq!(
            reply.command,
            Some(Command::exposure("C0", 10.0, true).with_bop(BopMask::EXPOSURE))
        );
    }

    #[test]
    fn test_expose_skipped_on_photometer() {
        let mut fx = Fixture::new(DeviceKind::Photometer);
        let (reply, _) = fx.step(&mut expose(1.0));
        assert!(reply.is_next());
    }

    #[test]
    fn test_dark_without_values() {
        let mut fx = Fixture::new(DeviceKind::Camera);
        let mut dark = Element::new(ElementKind::Expose {
            length: 3.0,
            light: false,
            phase: ExposePhase::First,
        });
        let (reply, _) = fx.step(&mut dark);
        assert_eq!(reply.status, Status::Complete);
        assert_eq!(reply.command.unwrap().bop, BopMask::NONE);
    }

    #[test]
    fn test_offset_goes_to_telescope() {
        let mut fx = Fixture::new(DeviceKind::Camera);
        let mut offset = Element::new(ElementKind::Offset { ra: 0.5, dec: -0.5 });
        let (reply, _) = fx.step(&mut offset);
        assert_eq!(reply.command.unwrap().device, TELESCOPE_PSEUDO_DEVICE);
    }

    #[test]
    fn test_change_value_operands() {
        let mut fx = Fixture::new(DeviceKind::Camera);
        fx.values.set("C1", "exposure", 12.0, Context::new());
        let mut change = Element::new(ElementKind::ChangeValue {
            name: "exposure".to_string(),
            op: ValueOp::Set,
            operands: vec![Operand::Value {
                device: Some("C1".to_string()),
                name: "exposure".to_string(),
            }],
            while_state: true,
        });
        let (reply, _) = fx.step(&mut change);
        let command = reply.command.unwrap();
        assert_eq!(command.to_string(), "C0.exposure=12");
        assert!(command.bop.contains(BopMask::WHILE_STATE));
    }

    #[test]
    fn test_comment_queues_number() {
        let mut fx = Fixture::new(DeviceKind::Camera);
        let mut comment = Element::new(ElementKind::Comment {
            text: "flat field".to_string(),
            number: 2,
        });
        let (reply, queued) = fx.step(&mut comment);
        assert_eq!(reply.status, Status::Complete);
        assert_eq!(queued[0].to_string(), "C0.COMM_NUM=2");
        assert_eq!(reply.command.unwrap().to_string(), "C0.SCR_COMM=\"flat field\"");
    }

    #[test]
    fn test_wait_signal_without_sender() {
        let mut fx = Fixture::new(DeviceKind::Camera);
        let mut wait = Element::new(ElementKind::WaitSignal {
            signal: 4,
            received: false,
        });
        assert!(fx.step(&mut wait).0.is_next());

        fx.bus.promised_signals.insert(4);
        assert_eq!(fx.step(&mut wait).0.status, Status::WaitSignal);
        assert!(wait.wait_for_signal(4));
        assert!(!wait.wait_for_signal(4));
        assert!(fx.step(&mut wait).0.is_next());
    }

    #[test]
    fn test_awaited_send_fires_at_teardown() {
        let mut fx = Fixture::new(DeviceKind::Camera);
        let mut send = Element::new(ElementKind::SendSignal {
            signal: 9,
            asked_for: false,
        });
        assert!(send.will_send(9));
        send.not_active(&mut fx.bus);
        send.not_active(&mut fx.bus);
        assert_eq!(fx.bus.sent_signals, vec![9]);
    }

    #[test]
    fn test_sleep_and_idle() {
        let mut fx = Fixture::new(DeviceKind::Camera);
        let mut sleep = Element::new(ElementKind::Sleep {
            seconds: 5.0,
            deadline: None,
        });
        let start = Utc::now();
        let mut ctx = StepContext::new(&fx.connection, &fx.values, &mut fx.bus, None).at(start);
        assert_eq!(sleep.next_command(&mut ctx).status, Status::Keep);
        assert!(!sleep.idle_call(start));
        let later = start + Duration::seconds(6);
        assert!(sleep.idle_call(later));
        let mut ctx = StepContext::new(&fx.connection, &fx.values, &mut fx.bus, None).at(later);
        assert!(sleep.next_command(&mut ctx).is_next());
    }

    #[test]
    fn test_target_elements() {
        let mut fx = Fixture::new(DeviceKind::Camera);
        let mut boost = Element::new(ElementKind::TarBoost {
            seconds: 600,
            bonus: 20,
        });
        fx.step(&mut boost);
        assert_eq!(fx.target.boost_bonus(Utc::now()), 20);

        let mut disable = Element::new(ElementKind::TargetDisable);
        assert!(fx.step(&mut disable).0.is_next());
        assert!(!fx.target.is_enabled());
    }

    #[test]
    fn test_wait_for_value() {
        let mut fx = Fixture::new(DeviceKind::Camera);
        let mut wait = Element::new(ElementKind::WaitFor {
            name: "CCD_TEMP".to_string(),
            target: -20.0,
            range: 0.5,
        });
        fx.values.set("C0", "CCD_TEMP", -10.0, Context::new());
        assert_eq!(fx.step(&mut wait).0.status, Status::Keep);
        fx.values.set("C0", "CCD_TEMP", -19.8, Context::new());
        assert!(fx.step(&mut wait).0.is_next());
    }

    #[test]
    fn test_print_and_json() {
        let change = Element::new(ElementKind::ChangeValue {
            name: "filter".to_string(),
            op: ValueOp::Add,
            operands: vec![Operand::Text("1".to_string())],
            while_state: false,
        })
        .with_device(Some("C1".to_string()));
        let mut out = String::new();
        change.print_script(&mut out);
        assert_eq!(out, "C1.filter+=1");
        let json = change.to_json();
        assert_eq!(json["cmd"], "change");
        assert_eq!(json["device"], "C1");
        assert_eq!(json["op"], "+=");
    }
}
