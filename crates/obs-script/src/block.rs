//! Blocks: elements owning a list of child elements
//!
//! A block walks its children like the script walks its elements, then asks
//! its loop predicate whether to run them again. Replies from a block that
//! has not finished are held, so the parent stays on the block.

use crate::bus::{ScriptBus, StepContext};
use crate::element::{Element, Span};
use crate::exe::ExeControl;
use crate::operand::Operand;
use crate::pattern::Pattern;
use crate::script::DeviceTiming;
use crate::status::{Reply, Status};
use chrono::{DateTime, Timelike, Utc};
use obs_core::{AstrometryResult, Command, CommandKind, ImageInfo, ProcessId};
use serde_json::{json, Value};
use std::fmt::Write;
use tracing::{debug, warn};

/// Passes without any command after which a block yields to the caller
const MAX_EMPTY_PASSES: u32 = 1000;

/// Loop flavour of a block
#[derive(Debug, Clone)]
pub enum BlockKind {
    /// `for N { }`
    For { max: i32 },
    /// `while (cond) N { }`
    While { condition: Operand, max: i32 },
    /// `do N { } while (cond)`
    Do { condition: Operand, max: i32 },
    /// `once { }`: only on the first run of the script for a target
    Once,
    /// `BS N { }`: repeat until signal N arrives
    SignalEnd { signal: i32, received: bool },
    /// `ifacq { } else { }`
    Acquired {
        /// Decided acquisition state for the current pass
        check: Option<bool>,
        else_block: Option<Box<Block>>,
    },
    /// The `else` part of `ifacq`
    Else,
    /// `waitsod N { }`: repeat until UT second of day N
    WhileSod { end_sod: i32 },
    /// `hex`/`fxf`: one pass per pattern position
    Pattern {
        pattern: Pattern,
        /// Device receiving the offsets
        device: String,
        /// Offset for the current pass was issued
        moved: bool,
    },
}

/// A block element
#[derive(Debug, Clone)]
pub struct Block {
    pub kind: BlockKind,
    pub children: Vec<Element>,
    cursor: usize,
    loop_count: u32,
    spinning: bool,
}

fn second_of_day(now: DateTime<Utc>) -> i32 {
    now.num_seconds_from_midnight() as i32
}

impl Block {
    pub fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            children: Vec::new(),
            cursor: 0,
            loop_count: 0,
            spinning: false,
        }
    }

    pub fn with_children(mut self, children: Vec<Element>) -> Self {
        self.children = children;
        self
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Loop predicate: true when the block must not run another pass
    fn loop_ended(&self, ctx: &StepContext<'_>) -> bool {
        let count = self.loop_count as i64;
        let device = ctx.connection.name.as_str();
        match &self.kind {
            BlockKind::For { max } => count >= i64::from(*max),
            BlockKind::While { condition, max } => {
                count >= i64::from(*max) || condition.eval(ctx.values, device) == 0.0
            }
            BlockKind::Do { condition, max } => {
                count > 0
                    && (count >= i64::from(*max) || condition.eval(ctx.values, device) == 0.0)
            }
            BlockKind::Once => !(ctx.script_loop_count == 0 && count == 0),
            BlockKind::SignalEnd { received, .. } => *received,
            BlockKind::Acquired { .. } | BlockKind::Else => count != 0,
            BlockKind::WhileSod { end_sod } => *end_sod <= second_of_day(ctx.now),
            BlockKind::Pattern { pattern, .. } => count >= pattern.len() as i64,
        }
    }

    /// Leave the block ready for a fresh entry
    fn reset(&mut self) {
        self.loop_count = 0;
        self.cursor = 0;
        match &mut self.kind {
            BlockKind::Acquired { check, .. } => *check = None,
            BlockKind::Pattern { moved, .. } => *moved = false,
            _ => {}
        }
    }

    /// End of one pass; true if the block is finished
    fn pass_done(&mut self, ctx: &StepContext<'_>) -> bool {
        self.loop_count += 1;
        self.cursor = 0;
        if let BlockKind::Pattern { moved, .. } = &mut self.kind {
            *moved = false;
        }
        if self.loop_ended(ctx) {
            self.reset();
            true
        } else {
            false
        }
    }

    pub fn next_command(&mut self, ctx: &mut StepContext<'_>) -> Reply {
        self.spinning = false;
        if let BlockKind::Acquired { check, else_block } = &mut self.kind {
            let acquired =
                *check.get_or_insert_with(|| ctx.target.is_some_and(|t| t.is_acquired()));
            if !acquired {
                let reply = match else_block {
                    Some(block) => block.next_command(ctx),
                    None => Reply::next(),
                };
                if !reply.held {
                    *check = None;
                }
                return reply;
            }
        }

        if self.children.is_empty() || self.loop_ended(ctx) {
            self.reset();
            return Reply::next();
        }

        let mut empty_passes = 0;
        loop {
            if self.cursor == 0 {
                if let Some(offset) = self.pattern_offset() {
                    return Reply::command(Status::Keep, offset).hold();
                }
            }
            let reply = self.children[self.cursor].next_command(ctx);
            if !reply.is_next() {
                return self.child_reply(reply, ctx);
            }
            self.cursor += 1;
            if self.cursor == self.children.len() {
                if self.pass_done(ctx) {
                    return Reply::next();
                }
                empty_passes += 1;
                if empty_passes >= MAX_EMPTY_PASSES {
                    warn!(
                        device = %ctx.connection.name,
                        passes = empty_passes,
                        "Block produced no command, yielding"
                    );
                    self.spinning = true;
                    return Reply::status(Status::Keep).hold();
                }
            }
        }
    }

    /// Offset command starting a pattern pass, issued once per pass
    fn pattern_offset(&mut self) -> Option<Command> {
        let pass = self.loop_count as usize;
        let BlockKind::Pattern {
            pattern,
            device,
            moved,
        } = &mut self.kind
        else {
            return None;
        };
        if *moved {
            return None;
        }
        *moved = true;
        let (ra, dec) = pattern.offset_for_pass(pass)?;
        debug!(device = %device, pass, ra, dec, "Moving to next pattern position");
        Some(Command::new(device.as_str(), CommandKind::Offset { ra, dec }))
    }

    fn child_reply(&mut self, reply: Reply, ctx: &StepContext<'_>) -> Reply {
        // do not pile up exposures that may end past the deadline
        if matches!(self.kind, BlockKind::WhileSod { .. })
            && self.cursor == 0
            && reply.status == Status::Complete
            && ctx.connection.queued_exposures > 1
        {
            return Reply::status(Status::Keep).hold();
        }
        if reply.held || !reply.status.advances() {
            return reply.hold();
        }
        self.cursor += 1;
        if self.cursor == self.children.len() && self.pass_done(ctx) {
            return reply;
        }
        reply.hold()
    }

    pub fn idle_call(&self, now: DateTime<Utc>) -> bool {
        self.spinning || self.active().is_some_and(|child| child.idle_call(now))
    }

    /// The child currently running, looking into a taken else branch
    fn active(&self) -> Option<&Element> {
        if let BlockKind::Acquired {
            check: Some(false),
            else_block: Some(block),
        } = &self.kind
        {
            return block.active();
        }
        self.children.get(self.cursor)
    }

    fn active_mut(&mut self) -> Option<&mut Element> {
        if let BlockKind::Acquired {
            check: Some(false),
            else_block: Some(block),
        } = &mut self.kind
        {
            return block.active_mut();
        }
        self.children.get_mut(self.cursor)
    }

    /// Every child including the else branch
    fn all_children_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        let else_children = match &mut self.kind {
            BlockKind::Acquired {
                else_block: Some(block),
                ..
            } => Some(block.children.iter_mut()),
            _ => None,
        };
        self.children
            .iter_mut()
            .chain(else_children.into_iter().flatten())
    }

    pub fn wait_for_signal(&mut self, signal: i32) -> bool {
        if let BlockKind::SignalEnd {
            signal: own,
            received,
        } = &mut self.kind
        {
            if *own == signal && !*received {
                *received = true;
                return true;
            }
        }
        let cursor = self.cursor;
        self.children
            .iter_mut()
            .skip(cursor)
            .any(|child| child.wait_for_signal(signal))
    }

    pub fn will_send(&mut self, signal: i32) -> bool {
        self.all_children_mut().any(|child| child.will_send(signal))
    }

    pub fn acquire_query(&self, count: &mut i32) {
        for child in &self.children {
            child.acquire_query(count);
        }
        if let BlockKind::Acquired {
            else_block: Some(block),
            ..
        } = &self.kind
        {
            block.acquire_query(count);
        }
    }

    pub fn exposure_end(&mut self, bus: &mut dyn ScriptBus) {
        if let Some(child) = self.active_mut() {
            child.exposure_end(bus);
        }
    }

    pub fn exposure_failed(&mut self, bus: &mut dyn ScriptBus) {
        if let Some(child) = self.active_mut() {
            child.exposure_failed(bus);
        }
    }

    pub fn process_image(&mut self, device: &str, image: &ImageInfo, bus: &mut dyn ScriptBus) -> bool {
        self.active_mut()
            .is_some_and(|child| child.process_image(device, image, bus))
    }

    pub fn astrometry_result(&mut self, obs_id: i32, img_id: i32, result: AstrometryResult) -> bool {
        self.all_children_mut()
            .any(|child| child.astrometry_result(obs_id, img_id, result))
    }

    pub fn process_line(
        &mut self,
        pid: ProcessId,
        line: &str,
        ctx: &mut StepContext<'_>,
    ) -> Option<ExeControl> {
        self.all_children_mut()
            .find_map(|child| child.process_line(pid, line, ctx))
    }

    pub fn process_exited(&mut self, pid: ProcessId) -> bool {
        self.all_children_mut().any(|child| child.process_exited(pid))
    }

    pub fn cancel(&mut self, bus: &mut dyn ScriptBus) {
        if let Some(child) = self.active_mut() {
            child.cancel(bus);
        }
    }

    pub fn not_active(&mut self, bus: &mut dyn ScriptBus) {
        for child in self.all_children_mut() {
            child.not_active(bus);
        }
    }

    pub fn current_span(&self) -> Option<Span> {
        self.active().map(Element::current_span)
    }

    pub fn keyword(&self) -> &'static str {
        match &self.kind {
            BlockKind::For { .. } => "for",
            BlockKind::While { .. } => "while",
            BlockKind::Do { .. } => "do",
            BlockKind::Once => "once",
            BlockKind::SignalEnd { .. } => "BS",
            BlockKind::Acquired { .. } => "ifacq",
            BlockKind::Else => "else",
            BlockKind::WhileSod { .. } => "waitsod",
            BlockKind::Pattern { pattern, .. } => pattern.kind.keyword(),
        }
    }

    fn print_body(&self, out: &mut String) {
        out.push('{');
        for child in self.children.iter().filter(|c| !c.is_comment()) {
            let mut text = String::new();
            child.print_script(&mut text);
            if !text.is_empty() {
                out.push(' ');
                out.push_str(&text);
            }
        }
        out.push_str(" }");
    }

    pub fn print_script(&self, out: &mut String) {
        self.print_header(out);
        self.print_body(out);
        match &self.kind {
            BlockKind::Do { condition, .. } => {
                let _ = write!(out, " while ({})", condition);
            }
            BlockKind::Acquired {
                else_block: Some(block),
                ..
            } => {
                out.push(' ');
                block.print_script(out);
            }
            _ => {}
        }
    }

    /// Keyword and parameters, up to the opening brace
    pub fn print_header(&self, out: &mut String) {
        let _ = match &self.kind {
            BlockKind::For { max } => write!(out, "for {} ", max),
            BlockKind::While { condition, max } => write!(out, "while ({}) {} ", condition, max),
            BlockKind::Do { max, .. } => write!(out, "do {} ", max),
            BlockKind::SignalEnd { signal, .. } => write!(out, "BS {} ", signal),
            BlockKind::WhileSod { end_sod } => write!(out, "waitsod {} ", end_sod),
            BlockKind::Pattern { pattern, .. } => write!(
                out,
                "{} {} {} ",
                pattern.kind.keyword(),
                pattern.ra_size,
                pattern.dec_size
            ),
            BlockKind::Once | BlockKind::Acquired { .. } | BlockKind::Else => {
                write!(out, "{} ", self.keyword())
            }
        };
    }

    pub fn to_json(&self) -> Value {
        let children: Vec<Value> = self.children.iter().map(Element::to_json).collect();
        let mut object = json!({ "block": children });
        let extra = match &self.kind {
            BlockKind::For { max } => json!({ "count": max }),
            BlockKind::While { condition, max } | BlockKind::Do { condition, max } => {
                json!({ "count": max, "condition": condition.to_string() })
            }
            BlockKind::SignalEnd { signal, .. } => json!({ "signal": signal }),
            BlockKind::WhileSod { end_sod } => json!({ "sod": end_sod }),
            BlockKind::Pattern { pattern, .. } => {
                json!({ "ra_size": pattern.ra_size, "dec_size": pattern.dec_size })
            }
            BlockKind::Acquired {
                else_block: Some(block),
                ..
            } => json!({ "else": block.to_json() }),
            _ => json!({}),
        };
        if let (Value::Object(map), Value::Object(extra)) = (&mut object, extra) {
            map.extend(extra);
        }
        object
    }

    pub fn pretty(&self, indent: usize, out: &mut String) {
        let pad = "  ".repeat(indent);
        let mut head = String::new();
        let _ = match &self.kind {
            BlockKind::For { max } => write!(head, "for {}", max),
            BlockKind::While { condition, max } => write!(head, "while ({}) {}", condition, max),
            BlockKind::Do { max, .. } => write!(head, "do {}", max),
            BlockKind::SignalEnd { signal, .. } => write!(head, "until signal {}", signal),
            BlockKind::WhileSod { end_sod } => write!(head, "until second of day {}", end_sod),
            BlockKind::Pattern { pattern, .. } => write!(
                head,
                "{} pattern {}x{}",
                pattern.kind.keyword(),
                pattern.ra_size,
                pattern.dec_size
            ),
            _ => write!(head, "{}", self.keyword()),
        };
        let _ = writeln!(out, "{}{} {{", pad, head);
        for child in &self.children {
            child.pretty(indent + 1, out);
        }
        match &self.kind {
            BlockKind::Do { condition, .. } => {
                let _ = writeln!(out, "{}}} while ({})", pad, condition);
            }
            BlockKind::Acquired {
                else_block: Some(block),
                ..
            } => {
                let _ = writeln!(out, "{}}}", pad);
                block.pretty(indent, out);
            }
            _ => {
                let _ = writeln!(out, "{}}}", pad);
            }
        }
    }

    fn body_duration(&self, timing: &DeviceTiming) -> f64 {
        self.children
            .iter()
            .map(|child| child.expected_duration(timing))
            .sum()
    }

    /// Passes assumed when estimating
    fn expected_passes(&self) -> f64 {
        match &self.kind {
            BlockKind::For { max } | BlockKind::While { max, .. } | BlockKind::Do { max, .. } => {
                f64::from((*max).max(0))
            }
            BlockKind::Pattern { pattern, .. } => pattern.len() as f64,
            _ => 1.0,
        }
    }

    pub fn expected_duration(&self, timing: &DeviceTiming) -> f64 {
        self.body_duration(timing) * self.expected_passes()
    }

    pub fn expected_light_time(&self) -> f64 {
        let body: f64 = self.children.iter().map(Element::expected_light_time).sum();
        body * self.expected_passes()
    }

    pub fn expected_images(&self) -> u32 {
        let body: u32 = self.children.iter().map(Element::expected_images).sum();
        body * self.expected_passes() as u32
    }
}
