//! Bridge to an external helper program driving the script
//!
//! The helper talks a line protocol on its standard output and receives
//! replies and device notifications on its standard input:
//!
//! | line | effect |
//! |---|---|
//! | `exposure` / `dark` | expose for the device's current `exposure` value |
//! | `command <text>` | send a raw device command |
//! | `value <name> <op> <operand>` | change a device value |
//! | `? <name>` | reply with the device value, or `nan` |
//! | `loopcount` | reply with the script loop count |
//! | `end_script` | end the script |
//! | `end_target` | end the script and drop the queued target |
//! | `stop_target` | end the script and blacklist the target |
//! | `target_disable` | disable the target |
//! | `target_tempdisable <secs>` | keep the target away for a while |
//! | `log <text>` | log a message |
//!
//! The helper receives `exposure_end` and `exposure_failed` lines.

use crate::bus::{ScriptBus, StepContext};
use crate::operand::{Multiplier, Operand};
use crate::status::{Reply, Status};
use obs_core::{BopMask, Command, ProcessId, ValueOp};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// What the controller must do after a helper line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExeControl {
    Continue,
    /// Drop the queued target as well
    EndTarget,
    /// Blacklist the current target
    StopTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExeState {
    Idle,
    Running(ProcessId),
    Exited,
}

/// State of one `exe` element
#[derive(Debug, Clone)]
pub struct ExeBridge {
    pub path: String,
    state: ExeState,
    pending: VecDeque<Command>,
    end_script: bool,
    stop_target: bool,
}

impl ExeBridge {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            state: ExeState::Idle,
            pending: VecDeque::new(),
            end_script: false,
            stop_target: false,
        }
    }

    pub fn pid(&self) -> Option<ProcessId> {
        match self.state {
            ExeState::Running(pid) => Some(pid),
            _ => None,
        }
    }

    pub fn next_command(&mut self, device: &str, ctx: &mut StepContext<'_>) -> Reply {
        if self.state == ExeState::Idle {
            match ctx.bus.launch(device, &self.path) {
                Ok(pid) => {
                    debug!(device, path = %self.path, %pid, "Launched script helper");
                    self.state = ExeState::Running(pid);
                }
                Err(e) => {
                    warn!(device, error = %e, "Script helper failed to start");
                    self.state = ExeState::Exited;
                    self.stop_target = true;
                }
            }
        }
        if self.stop_target {
            return Reply::status(Status::StopTarget);
        }
        if self.end_script {
            return Reply::status(Status::EndScript);
        }
        if let Some(command) = self.pending.pop_front() {
            return Reply::command(Status::Keep, command);
        }
        match self.state {
            ExeState::Exited => Reply::next(),
            _ => Reply::status(Status::Keep),
        }
    }

    /// Handle one line from the helper; `None` when `pid` is not this helper
    pub fn process_line(
        &mut self,
        pid: ProcessId,
        line: &str,
        device: &str,
        ctx: &mut StepContext<'_>,
    ) -> Option<ExeControl> {
        if self.pid() != Some(pid) {
            return None;
        }
        let line = line.trim();
        let (cmd, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let mut control = ExeControl::Continue;
        match cmd {
            "exposure" | "dark" => match ctx.values.value_f64(device, "exposure") {
                Some(length) => self.pending.push_back(
                    Command::exposure(device, length, cmd == "exposure").with_bop(BopMask::EXPOSURE),
                ),
                None => {
                    warn!(device, "Helper asked for an exposure without exposure time");
                    ctx.bus.write_to_process(pid, "ERR");
                }
            },
            "command" if !rest.is_empty() => self.pending.push_back(Command::raw(device, rest)),
            "value" => match parse_value_change(rest) {
                Some((name, op, operand)) => {
                    let value = operand.render(ctx.values, device);
                    self.pending.push_back(
                        Command::change_value(device, name, op, value).with_bop(BopMask::TEL_MOVE),
                    );
                }
                None => {
                    warn!(device, line, "Invalid value line from helper");
                    ctx.bus.write_to_process(pid, "ERR");
                }
            },
            "?" if !rest.is_empty() => {
                let reply = ctx
                    .values
                    .value(device, rest)
                    .map_or_else(|| "nan".to_string(), |v| v.to_string());
                ctx.bus.write_to_process(pid, &reply);
            }
            "loopcount" => {
                let reply = ctx.script_loop_count.to_string();
                ctx.bus.write_to_process(pid, &reply);
            }
            "end_script" => self.end_script = true,
            "end_target" => {
                self.end_script = true;
                control = ExeControl::EndTarget;
            }
            "stop_target" => {
                self.stop_target = true;
                control = ExeControl::StopTarget;
            }
            "target_disable" => {
                if let Some(target) = ctx.target {
                    info!(device, target_id = target.target_id, "Helper disabled target");
                    target.disable();
                }
            }
            "target_tempdisable" => match Operand::parse_value(rest, Multiplier::Time) {
                Ok(Operand::Number { value, .. }) => {
                    if let Some(target) = ctx.target {
                        target.temp_disable(ctx.now, value);
                    }
                }
                _ => {
                    warn!(device, line, "Invalid disable time from helper");
                    ctx.bus.write_to_process(pid, "ERR");
                }
            },
            "log" => info!(device, helper = %self.path, "{}", rest),
            _ => {
                warn!(device, line, "Unknown line from script helper");
                ctx.bus.write_to_process(pid, "ERR");
            }
        }
        Some(control)
    }

    pub fn process_exited(&mut self, pid: ProcessId) -> bool {
        if self.pid() != Some(pid) {
            return false;
        }
        debug!(%pid, path = %self.path, "Script helper exited");
        self.state = ExeState::Exited;
        true
    }

    pub fn notify(&mut self, bus: &mut dyn ScriptBus, line: &str) {
        if let Some(pid) = self.pid() {
            bus.write_to_process(pid, line);
        }
    }

    /// Stop the helper if it still runs
    pub fn terminate(&mut self, bus: &mut dyn ScriptBus) {
        if let Some(pid) = self.pid() {
            bus.terminate(pid);
        }
        self.state = ExeState::Exited;
        self.pending.clear();
    }
}

fn parse_value_change(text: &str) -> Option<(&str, ValueOp, Operand)> {
    let mut parts = text.split_whitespace();
    let name = parts.next()?;
    let op = ValueOp::from_symbol(parts.next()?)?;
    let operand = parts.collect::<Vec<_>>().join(" ");
    if operand.is_empty() {
        return None;
    }
    let operand = Operand::parse_value(&operand, Multiplier::Angle).ok()?;
    Some((name, op, operand))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{DeviceConnection, LocalBus};
    use obs_core::{Context, DeviceKind, Target};
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
        fn new() -> Self {
            let values = ValueStore::new(Arc::new(NotificationBus::new()));
            values.set("C0", "exposure", 15.0, Context::new());
            Self {
                connection: DeviceConnection::new("C0", DeviceKind::Camera),
                values,
                bus: LocalBus::new(),
                target: Target::new(1, 1, "t"),
            }
        }

        fn ctx(&mut self) -> StepContext<'_> {
            let mut ctx =
                StepContext::new(&self.connection, &self.values, &mut self.bus, Some(&self.target));
            ctx.script_loop_count = 2;
            ctx
        }
    }

    #[test]
    fn test_launch_and_exposure() {
        let mut fx = Fixture::new();
        let mut exe = ExeBridge::new("/usr/bin/helper");
        let reply = exe.next_command("C0", &mut fx.ctx());
        assert_eq!(reply.status, Status::Keep);
        let pid = exe.pid().unwrap();

        assert_eq!(
            exe.process_line(pid, "exposure", "C0", &mut fx.ctx()),
            Some(ExeControl::Continue)
        );
        let reply = exe.next_command("C0", &mut fx.ctx());
        assert_eq!(
            reply.command,
            Some(Command::exposure("C0", 15.0, true).with_bop(BopMask::EXPOSURE))
        );

        exe.process_exited(pid);
        assert!(exe.next_command("C0", &mut fx.ctx()).is_next());
    }

    #[test]
    fn test_queries_are_answered() {
        let mut fx = Fixture::new();
        let mut exe = ExeBridge::new("helper");
        exe.next_command("C0", &mut fx.ctx());
        let pid = exe.pid().unwrap();
        exe.process_line(pid, "? exposure", "C0", &mut fx.ctx());
        exe.process_line(pid, "? missing", "C0", &mut fx.ctx());
        exe.process_line(pid, "loopcount", "C0", &mut fx.ctx());
        exe.process_line(pid, "frobnicate", "C0", &mut fx.ctx());
        let replies: Vec<_> = fx.bus.written.iter().map(|(_, l)| l.as_str()).collect();
        assert_eq!(replies, vec!["15", "nan", "2", "ERR"]);
    }

    #[test]
    fn test_value_and_target_lines() {
        let mut fx = Fixture::new();
        let mut exe = ExeBridge::new("helper");
        exe.next_command("C0", &mut fx.ctx());
        let pid = exe.pid().unwrap();
        exe.process_line(pid, "value filter += 1", "C0", &mut fx.ctx());
        exe.process_line(pid, "target_disable", "C0", &mut fx.ctx());
        let reply = exe.next_command("C0", &mut fx.ctx());
        assert_eq!(
            reply.command.map(|c| c.to_string()),
            Some("C0.filter+=1".to_string())
        );
        assert!(!fx.target.is_enabled());

        assert_eq!(
            exe.process_line(pid, "stop_target", "C0", &mut fx.ctx()),
            Some(ExeControl::StopTarget)
        );
        assert_eq!(exe.next_command("C0", &mut fx.ctx()).status, Status::StopTarget);
    }

    #[test]
    fn test_foreign_pid_ignored() {
        let mut fx = Fixture::new();
        let mut exe = ExeBridge::new("helper");
        exe.next_command("C0", &mut fx.ctx());
        assert_eq!(exe.process_line(ProcessId(99), "end_script", "C0", &mut fx.ctx()), None);
        assert!(!exe.process_exited(ProcessId(99)));
    }

    #[test]
    fn test_launch_failure_stops_target() {
        let mut fx = Fixture::new();
        fx.bus.refuse_launch = true;
        let mut exe = ExeBridge::new("missing");
        assert_eq!(exe.next_command("C0", &mut fx.ctx()).status, Status::StopTarget);
    }
}
