//! Observation Script Engine
//!
//! This crate parses observation scripts, steps them one command at a time
//! and runs one script controller per device connection.
//!
//! # Script Language
//!
//! - Exposures and dark frames (`E 10`, `D 5`)
//! - Value changes (`filter=R`, `C0.gain+=2`)
//! - Waits, sleeps and idle sleeps
//! - Telescope offsets and patterns
//! - Signals between connections (`SS 3`, `SW 3`)
//! - Acquisition (`A 0.05 10`, `Aw`)
//! - Blocks (`{ ... }`, `for`, `while`, `do`, `once`, `ifacq`, `else`)
//! - External helper programs (`exe /path`)
//!
//! # Key Types
//!
//! - [`Script`] - A parsed script and its cursor
//! - [`DevScript`] - Script controller of one device connection
//! - [`Dispatcher`] - Owner of all controllers, routes signals between them

pub mod acquire;
pub mod block;
pub mod bus;
pub mod devscript;
pub mod dispatcher;
pub mod element;
pub mod error;
pub mod exe;
pub mod operand;
pub mod parser;
pub mod pattern;
pub mod script;
pub mod status;

pub use bus::{DeviceConnection, LocalBus, ScriptBus, Services, StepContext};
pub use devscript::{DevScript, DevScriptSettings, Outgoing, WaitState};
pub use dispatcher::{DispatchError, DispatchResult, Dispatcher};
pub use element::{Element, ElementKind, Span};
pub use error::{LaunchError, ParseError, ParseResult, ScriptError, ScriptResult};
pub use parser::{parse_script, ParseContext};
pub use script::{DeviceTiming, Script};
pub use status::{Reply, Status, Step};
