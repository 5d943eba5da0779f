//! Device commands issued by script elements

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;

/// Blocking-operation tags of a command
///
/// The tags tell the controller which device activity must be over before
/// the command may leave the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BopMask(u32);

impl BopMask {
    pub const NONE: BopMask = BopMask(0);
    /// Wait until the telescope finished moving
    pub const TEL_MOVE: BopMask = BopMask(0x01);
    /// Wait until the running exposure finished
    pub const EXPOSURE: BopMask = BopMask(0x02);
    /// Wait while any blocking device state is active
    pub const WHILE_STATE: BopMask = BopMask(0x04);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set
    pub fn contains(self, other: BopMask) -> bool {
        !other.is_empty() && self.0 & other.0 == other.0
    }
}

impl BitOr for BopMask {
    type Output = BopMask;

    fn bitor(self, rhs: BopMask) -> BopMask {
        BopMask(self.0 | rhs.0)
    }
}

/// Operator of a value change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueOp {
    Set,
    Add,
    Subtract,
}

impl ValueOp {
    /// Operator as written in script text
    pub fn as_str(self) -> &'static str {
        match self {
            ValueOp::Set => "=",
            ValueOp::Add => "+=",
            ValueOp::Subtract => "-=",
        }
    }

    /// Operator from its script text form
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "=" => Some(ValueOp::Set),
            "+=" => Some(ValueOp::Add),
            "-=" => Some(ValueOp::Subtract),
            _ => None,
        }
    }

    /// Apply the operator to a numeric value
    pub fn apply(self, current: f64, operand: f64) -> f64 {
        match self {
            ValueOp::Set => operand,
            ValueOp::Add => current + operand,
            ValueOp::Subtract => current - operand,
        }
    }
}

impl fmt::Display for ValueOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a command asks the device to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandKind {
    /// Start an exposure; `light` is false for darks
    Exposure { length: f64, light: bool },
    /// Change a named device value; `raw` values are sent as unparsed text
    ChangeValue {
        name: String,
        op: ValueOp,
        value: String,
        raw: bool,
    },
    /// Readout window
    Box { x: i32, y: i32, w: i32, h: i32 },
    /// Centered readout window
    Center { w: i32, h: i32 },
    /// Pointing offset in degrees
    Offset { ra: f64, dec: f64 },
    /// Photometer integration
    Integrate { filter: i32, exposure: f64, count: i32 },
    /// Free-form command text
    Raw { text: String },
    /// Ask the device to report when the script ends
    ScriptEnds,
    /// Abort everything the device is doing
    KillAll,
}

/// A command addressed to a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Device the command is for
    pub device: String,
    pub kind: CommandKind,
    /// Blocking tags
    #[serde(default)]
    pub bop: BopMask,
}

impl Command {
    pub fn new(device: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            device: device.into(),
            kind,
            bop: BopMask::NONE,
        }
    }

    pub fn exposure(device: impl Into<String>, length: f64, light: bool) -> Self {
        Self::new(device, CommandKind::Exposure { length, light })
    }

    pub fn change_value(
        device: impl Into<String>,
        name: impl Into<String>,
        op: ValueOp,
        value: impl Into<String>,
    ) -> Self {
        Self::new(
            device,
            CommandKind::ChangeValue {
                name: name.into(),
                op,
                value: value.into(),
                raw: false,
            },
        )
    }

    pub fn raw(device: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(device, CommandKind::Raw { text: text.into() })
    }

    /// Set the blocking tags
    pub fn with_bop(mut self, bop: BopMask) -> Self {
        self.bop = bop;
        self
    }

    /// Mark a value change as raw text
    pub fn with_raw_value(mut self) -> Self {
        if let CommandKind::ChangeValue { raw, .. } = &mut self.kind {
            *raw = true;
        }
        self
    }

    pub fn is_exposure(&self) -> bool {
        matches!(self.kind, CommandKind::Exposure { .. })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.", self.device)?;
        match &self.kind {
            CommandKind::Exposure { length, light: true } => write!(f, "expose {}", length),
            CommandKind::Exposure { length, light: false } => write!(f, "dark {}", length),
            CommandKind::ChangeValue {
                name,
                op,
                value,
                raw,
            } => {
                if *raw {
                    write!(f, "{}{}\"{}\"", name, op, value)
                } else {
                    write!(f, "{}{}{}", name, op, value)
                }
            }
            CommandKind::Box { x, y, w, h } => write!(f, "box {} {} {} {}", x, y, w, h),
            CommandKind::Center { w, h } => write!(f, "center {} {}", w, h),
            CommandKind::Offset { ra, dec } => write!(f, "offset {} {}", ra, dec),
            CommandKind::Integrate {
                filter,
                exposure,
                count,
            } => write!(f, "intfl {} {} {}", filter, exposure, count),
            CommandKind::Raw { text } => f.write_str(text),
            CommandKind::ScriptEnds => f.write_str("script_ends"),
            CommandKind::KillAll => f.write_str("killall"),
        }
    }
}
