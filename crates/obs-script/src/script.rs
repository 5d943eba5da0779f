//! The script interpreter
//!
//! A [`Script`] owns the elements parsed for one target and device and
//! walks them one step at a time. Each call to [`Script::next_command`]
//! polls the current element and decides, from the returned status,
//! whether the cursor moves on.

use crate::bus::{ScriptBus, StepContext};
use crate::element::{Element, Span};
use crate::error::{ParseResult, ScriptResult};
use crate::exe::ExeControl;
use crate::parser::{parse_fragments, parse_script, ParseContext, Parsed};
use crate::status::{Reply, Status, Step};
use chrono::{DateTime, Utc};
use obs_core::{AstrometryResult, EquPosition, ImageInfo, ProcessId, Target};
use serde_json::Value;
use tracing::{debug, trace};

/// Device parameters used for duration estimates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceTiming {
    /// Seconds to read out one image
    pub readout_time: f64,
    /// Seconds to change a filter
    pub filter_movement: f64,
    /// Seconds per degree of telescope slew
    pub telescope_speed: f64,
}

impl DeviceTiming {
    pub fn new() -> Self {
        Self {
            readout_time: 0.0,
            filter_movement: 0.0,
            telescope_speed: 1.0,
        }
    }
}

impl Default for DeviceTiming {
    fn default() -> Self {
        Self::new()
    }
}

/// A parsed script bound to one device
#[derive(Debug, Clone)]
pub struct Script {
    elements: Vec<Element>,
    cursor: usize,
    /// Steps that produced something; `-1` once torn down
    executed_count: i64,
    whole_script: String,
    default_device: String,
    loop_count: u32,
    timing: DeviceTiming,
    target_position: Option<EquPosition>,
}

impl Script {
    /// A script without elements
    pub fn empty(default_device: impl Into<String>) -> Self {
        Self::from_parsed(Parsed::default(), default_device.into())
    }

    fn from_parsed(parsed: Parsed, default_device: String) -> Self {
        Self {
            elements: parsed.elements,
            cursor: 0,
            executed_count: 0,
            whole_script: parsed.whole_script,
            default_device,
            loop_count: 0,
            timing: DeviceTiming::default(),
            target_position: None,
        }
    }

    /// Parse a script that is not bound to any target
    pub fn parse(text: &str, default_device: impl Into<String>) -> ParseResult<Self> {
        let parsed = parse_script(text, &ParseContext::default())?;
        Ok(Self::from_parsed(parsed, default_device.into()))
    }

    /// Build the script `target` holds for `device`
    pub fn build(
        target: &Target,
        device: &str,
        loop_count: u32,
        timing: DeviceTiming,
    ) -> ScriptResult<Self> {
        let fragments = target.script_fragments(device)?;
        let parsed = parse_fragments(fragments, &ParseContext { target: Some(target) })?;
        debug!(
            device = %device,
            target_id = target.target_id,
            elements = parsed.elements.len(),
            "Built script"
        );
        let mut script = Self::from_parsed(parsed, device.to_string());
        script.loop_count = loop_count;
        script.timing = timing;
        script.target_position = target.position;
        Ok(script)
    }

    pub fn with_timing(mut self, timing: DeviceTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_loop_count(mut self, loop_count: u32) -> Self {
        self.loop_count = loop_count;
        self
    }

    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn executed_count(&self) -> i64 {
        self.executed_count
    }

    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    pub fn whole_script(&self) -> &str {
        &self.whole_script
    }

    pub fn default_device(&self) -> &str {
        &self.default_device
    }

    pub fn is_torn_down(&self) -> bool {
        self.executed_count < 0
    }

    /// No element left to run
    pub fn at_end(&self) -> bool {
        self.is_torn_down() || self.cursor >= self.elements.len()
    }

    /// Poll the script for its next step
    pub fn next_command(&mut self, ctx: &mut StepContext<'_>) -> Step {
        if self.is_torn_down() {
            return Step {
                status: Status::EndScript,
                command: None,
            };
        }
        ctx.script_loop_count = self.loop_count;
        while let Some(element) = self.elements.get_mut(self.cursor) {
            let Reply {
                status,
                command,
                held,
            } = element.next_command(ctx);
            if status == Status::Next {
                self.cursor += 1;
                continue;
            }
            self.executed_count += 1;
            if !held && status.advances() {
                self.cursor += 1;
            }
            let command = if status == Status::Waiting { None } else { command };
            trace!(
                device = %self.default_device,
                status = ?status,
                cursor = self.cursor,
                "Script step"
            );
            return Step { status, command };
        }
        Step {
            status: Status::EndScript,
            command: None,
        }
    }

    fn current_mut(&mut self) -> Option<&mut Element> {
        if self.is_torn_down() {
            return None;
        }
        self.elements.get_mut(self.cursor)
    }

    /// Offer a signal to the waits from the cursor on
    ///
    /// The consuming element becomes the current one.
    pub fn deliver_signal(&mut self, signal: i32) -> bool {
        if self.is_torn_down() {
            return false;
        }
        let start = self.cursor;
        let consumer = self
            .elements
            .iter_mut()
            .enumerate()
            .skip(start)
            .find_map(|(i, element)| element.wait_for_signal(signal).then_some(i));
        match consumer {
            Some(i) => {
                debug!(device = %self.default_device, signal, element = i, "Signal consumed");
                self.cursor = i;
                true
            }
            None => false,
        }
    }

    /// Whether an element from the cursor on is going to send `signal`
    pub fn will_send(&mut self, signal: i32) -> bool {
        if self.is_torn_down() {
            return false;
        }
        let start = self.cursor;
        self.elements
            .iter_mut()
            .skip(start)
            .any(|element| element.will_send(signal))
    }

    /// Count acquisitions still ahead of the cursor
    pub fn acquire_query(&self, count: &mut i32) {
        if self.is_torn_down() {
            return;
        }
        for element in self.elements.iter().skip(self.cursor) {
            element.acquire_query(count);
        }
    }

    pub fn exposure_end(&mut self, bus: &mut dyn ScriptBus) {
        if let Some(element) = self.current_mut() {
            element.exposure_end(bus);
        }
    }

    pub fn exposure_failed(&mut self, bus: &mut dyn ScriptBus) {
        if let Some(element) = self.current_mut() {
            element.exposure_failed(bus);
        }
    }

    /// Offer a finished image to the current element
    pub fn process_image(&mut self, image: &ImageInfo, bus: &mut dyn ScriptBus) -> bool {
        let device = self.default_device.clone();
        self.current_mut()
            .is_some_and(|element| element.process_image(&device, image, bus))
    }

    pub fn astrometry_result(&mut self, obs_id: i32, img_id: i32, result: AstrometryResult) -> bool {
        if self.is_torn_down() {
            return false;
        }
        let start = self.cursor;
        self.elements
            .iter_mut()
            .skip(start)
            .any(|element| element.astrometry_result(obs_id, img_id, result))
    }

    /// Route a line from a helper process to the element that started it
    pub fn process_line(
        &mut self,
        pid: ProcessId,
        line: &str,
        ctx: &mut StepContext<'_>,
    ) -> Option<ExeControl> {
        if self.is_torn_down() {
            return None;
        }
        self.elements
            .iter_mut()
            .find_map(|element| element.process_line(pid, line, ctx))
    }

    pub fn process_exited(&mut self, pid: ProcessId) -> bool {
        if self.is_torn_down() {
            return false;
        }
        self.elements
            .iter_mut()
            .any(|element| element.process_exited(pid))
    }

    pub fn cancel(&mut self, bus: &mut dyn ScriptBus) {
        if let Some(element) = self.current_mut() {
            element.cancel(bus);
        }
    }

    /// Whether an idle tick should poll the script
    pub fn idle(&self, now: DateTime<Utc>) -> bool {
        !self.is_torn_down()
            && self
                .elements
                .get(self.cursor)
                .is_some_and(|element| element.idle_call(now))
    }

    /// Tear the script down; no element is touched afterwards
    pub fn teardown(&mut self, bus: &mut dyn ScriptBus) {
        if self.is_torn_down() {
            return;
        }
        for element in &mut self.elements {
            element.not_active(bus);
        }
        self.executed_count = -1;
    }

    /// Location of the running element in [`Script::whole_script`]
    pub fn current_span(&self) -> Option<Span> {
        if self.is_torn_down() {
            return None;
        }
        self.elements.get(self.cursor).map(Element::current_span)
    }

    /// First top-level element whose script form starts with `prefix`
    pub fn find_element(&self, prefix: &str) -> Option<&Element> {
        self.elements.iter().find(|element| {
            let mut head = String::new();
            element.print_head(&mut head);
            if head.is_empty() {
                return false;
            }
            if element.as_block().is_none() || head.len() >= prefix.len() {
                return head.starts_with(prefix);
            }
            if !prefix.starts_with(head.as_str()) {
                return false;
            }
            let mut text = String::new();
            element.print_script(&mut text);
            text.starts_with(prefix)
        })
    }

    /// Re-parseable script text
    pub fn print_script(&self) -> String {
        self.elements
            .iter()
            .filter_map(|element| {
                let mut text = String::new();
                element.print_script(&mut text);
                (!text.is_empty()).then_some(text)
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn print_json(&self) -> Value {
        Value::Array(self.elements.iter().map(Element::to_json).collect())
    }

    pub fn pretty_print(&self) -> String {
        let mut out = String::new();
        for element in &self.elements {
            element.pretty(0, &mut out);
        }
        out
    }

    /// Seconds the script is expected to take, including the slew from
    /// `telescope` to the target
    pub fn expected_duration(&self, telescope: Option<&EquPosition>) -> f64 {
        let slew = match (telescope, self.target_position.as_ref()) {
            (Some(from), Some(to)) => from.angular_separation(to) * self.timing.telescope_speed,
            _ => 0.0,
        };
        slew + self
            .elements
            .iter()
            .map(|element| element.expected_duration(&self.timing))
            .sum::<f64>()
    }

    pub fn expected_light_time(&self) -> f64 {
        self.elements.iter().map(Element::expected_light_time).sum()
    }

    pub fn expected_images(&self) -> u32 {
        self.elements.iter().map(Element::expected_images).sum()
    }
}
