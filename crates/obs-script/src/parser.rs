//! Script text parser
//!
//! A target carries one or more script fragments per device. Each fragment
//! may end with a `#` comment. Fragments are parsed in order into one flat
//! element list, and a whole-script text is assembled so every element can
//! point back at the source it came from.

use crate::acquire::Acquisition;
use crate::block::{Block, BlockKind};
use crate::element::{Element, ElementKind, ExposePhase};
use crate::error::{ParseError, ParseResult};
use crate::exe::ExeBridge;
use crate::operand::{Multiplier, Operand};
use crate::pattern::{Pattern, PatternKind};
use obs_core::{Target, ValueOp, TELESCOPE_PSEUDO_DEVICE};
use std::str::FromStr;
use tracing::trace;

/// What the parser knows about the script's target
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseContext<'a> {
    pub target: Option<&'a Target>,
}

/// Parser output
#[derive(Debug, Clone, Default)]
pub struct Parsed {
    pub elements: Vec<Element>,
    /// All fragments joined, comments replaced by `#N` markers
    pub whole_script: String,
}

/// Parse a single script text
pub fn parse_script(text: &str, ctx: &ParseContext<'_>) -> ParseResult<Parsed> {
    parse_fragments(&[text.to_string()], ctx)
}

/// Parse the fragments of one device's script
pub fn parse_fragments(fragments: &[String], ctx: &ParseContext<'_>) -> ParseResult<Parsed> {
    let mut parsed = Parsed::default();
    let mut comment_number = 1;
    for fragment in fragments {
        let (command, comment) = match fragment.split_once('#') {
            Some((command, comment)) => (command, Some(comment.trim())),
            None => (fragment.as_str(), None),
        };
        if !parsed.whole_script.is_empty() && !parsed.whole_script.ends_with(' ') {
            parsed.whole_script.push(' ');
        }
        let base = parsed.whole_script.len();
        parsed.whole_script.push_str(command);

        let mut parser = Parser::new(command, base, ctx.target);
        parsed.elements.extend(parser.elements(false)?);

        if let Some(text) = comment {
            if !parsed.whole_script.is_empty() {
                parsed.whole_script.push(' ');
            }
            let start = parsed.whole_script.len();
            parsed.whole_script.push_str(&format!("#{} ", comment_number));
            parsed.elements.push(
                Element::new(ElementKind::Comment {
                    text: text.to_string(),
                    number: comment_number,
                })
                .with_span(start, 2),
            );
            comment_number += 1;
        }
    }
    trace!(
        elements = parsed.elements.len(),
        script = %parsed.whole_script,
        "Parsed script"
    );
    Ok(parsed)
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    /// Offset of `text` in the whole script
    base: usize,
    target: Option<&'a Target>,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str, base: usize, target: Option<&'a Target>) -> Self {
        Self {
            text,
            pos: 0,
            base,
            target,
        }
    }

    fn error(&self, offset: usize, message: impl Into<String>) -> ParseError {
        ParseError::new(self.base + offset, message)
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.text[self.pos..].chars().next().filter(|c| c.is_whitespace()) {
            self.pos += c.len_utf8();
        }
    }

    /// Next whitespace separated token with its offset
    fn token(&mut self) -> Option<(usize, &'a str)> {
        self.skip_ws();
        if self.pos == self.text.len() {
            return None;
        }
        let start = self.pos;
        let end = self.text[start..]
            .find(char::is_whitespace)
            .map_or(self.text.len(), |i| start + i);
        self.pos = end;
        Some((start, &self.text[start..end]))
    }

    fn peek_token(&mut self) -> Option<&'a str> {
        let pos = self.pos;
        let token = self.token().map(|(_, t)| t);
        self.pos = pos;
        token
    }

    fn param<T: FromStr>(&mut self, what: &str) -> ParseResult<T> {
        let (start, token) = self
            .token()
            .ok_or_else(|| self.error(self.text.len(), format!("missing parameter {}", what)))?;
        token
            .parse()
            .map_err(|_| self.error(start, format!("invalid {} '{}'", what, token)))
    }

    fn string_param(&mut self, what: &str) -> ParseResult<&'a str> {
        self.token()
            .map(|(_, t)| t)
            .ok_or_else(|| self.error(self.text.len(), format!("missing parameter {}", what)))
    }

    fn condition(&mut self) -> ParseResult<Operand> {
        let (operand, consumed) =
            Operand::parse_expression(&self.text[self.pos..]).map_err(|e| e.shifted(self.base + self.pos))?;
        self.pos += consumed;
        Ok(operand)
    }

    fn open_block(&mut self) -> ParseResult<()> {
        match self.token() {
            Some((_, "{")) => Ok(()),
            Some((start, token)) => Err(self.error(start, format!("expected '{{', found '{}'", token))),
            None => Err(self.error(self.text.len(), "missing '{'")),
        }
    }

    /// Parse elements up to the end of text, or up to `}` when `in_block`
    fn elements(&mut self, in_block: bool) -> ParseResult<Vec<Element>> {
        let mut elements = Vec::new();
        loop {
            let Some((start, token)) = self.token() else {
                if in_block {
                    return Err(self.error(self.text.len(), "block not closed"));
                }
                return Ok(elements);
            };
            if token == "}" {
                if in_block {
                    return Ok(elements);
                }
                return Err(self.error(start, "'}' without block"));
            }
            let element = self.command(start, token)?;
            elements.push(element.with_span(self.base + start, self.pos - start));
        }
    }

    fn body(&mut self, kind: BlockKind) -> ParseResult<Block> {
        self.open_block()?;
        Ok(Block::new(kind).with_children(self.elements(true)?))
    }

    fn command(&mut self, start: usize, token: &'a str) -> ParseResult<Element> {
        let (device, keyword) = split_device(token);
        let device = device.map(str::to_string);
        if keyword.is_empty() {
            return Err(self.error(start, "missing command after device"));
        }
        let kind = match keyword {
            "E" | "D" => ElementKind::Expose {
                length: self.param::<f64>("exposure time")?,
                light: keyword == "E",
                phase: ExposePhase::First,
            },
            "BOX" => ElementKind::Box {
                x: self.param("x")?,
                y: self.param("y")?,
                w: self.param("width")?,
                h: self.param("height")?,
            },
            "center" => ElementKind::Center {
                w: self.param("width")?,
                h: self.param("height")?,
            },
            "C" => ElementKind::Offset {
                ra: self.param("ra offset")?,
                dec: self.param("dec offset")?,
            },
            "W" => ElementKind::WaitMove,
            "Aw" => ElementKind::WaitAcquire {
                obs_target_id: self.target.map_or(-1, |t| t.obs_target_id),
            },
            "P" => ElementKind::Photometer {
                filter: self.param("filter")?,
                exposure: self.param("exposure time")?,
                count: self.param("count")?,
            },
            "SS" | "sig" | "sendsig" => ElementKind::SendSignal {
                signal: self.param("signal")?,
                asked_for: false,
            },
            "SW" | "waitsig" => {
                self.skip_ws();
                let offset = self.pos;
                let signal: i32 = self.param("signal")?;
                if signal <= 0 {
                    return Err(self.error(offset, "signal must be positive"));
                }
                ElementKind::WaitSignal {
                    signal,
                    received: false,
                }
            }
            "A" => {
                let precision: f64 = self.param("precision")?;
                let exposure: f64 = self.param("exposure time")?;
                if self.target.is_some_and(|t| t.is_acquired()) {
                    ElementKind::Nop
                } else {
                    ElementKind::Acquire(Acquisition::new(precision, exposure))
                }
            }
            "BS" => {
                let signal = self.param("signal")?;
                ElementKind::Block(self.body(BlockKind::SignalEnd {
                    signal,
                    received: false,
                })?)
            }
            _ if keyword.starts_with('@') && keyword.len() > 1 => {
                let signal = keyword[1..]
                    .parse()
                    .map_err(|_| self.error(start, format!("invalid signal '{}'", keyword)))?;
                ElementKind::Block(self.body(BlockKind::SignalEnd {
                    signal,
                    received: false,
                })?)
            }
            "ifacq" => {
                self.open_block()?;
                let children = self.elements(true)?;
                let else_block = if self.peek_token() == Some("else") {
                    self.token();
                    Some(Box::new(self.body(BlockKind::Else)?))
                } else {
                    None
                };
                ElementKind::Block(
                    Block::new(BlockKind::Acquired {
                        check: None,
                        else_block,
                    })
                    .with_children(children),
                )
            }
            "for" => {
                let max = self.param("loop count")?;
                ElementKind::Block(self.body(BlockKind::For { max })?)
            }
            "while" => {
                let condition = self.condition()?;
                let max = self.param("loop count")?;
                ElementKind::Block(self.body(BlockKind::While { condition, max })?)
            }
            "do" => {
                let max = self.param("loop count")?;
                self.open_block()?;
                let children = self.elements(true)?;
                match self.token() {
                    Some((_, "while")) => {}
                    Some((offset, other)) => {
                        return Err(self.error(offset, format!("expected 'while', found '{}'", other)))
                    }
                    None => return Err(self.error(self.text.len(), "missing 'while'")),
                }
                let condition = self.condition()?;
                ElementKind::Block(Block::new(BlockKind::Do { condition, max }).with_children(children))
            }
            "once" => ElementKind::Block(self.body(BlockKind::Once)?),
            "waitsod" => {
                let end_sod = self.param("second of day")?;
                ElementKind::Block(self.body(BlockKind::WhileSod { end_sod })?)
            }
            "waitfor" => ElementKind::WaitFor {
                name: self.string_param("value name")?.to_string(),
                target: self.param("target value")?,
                range: self.param("range")?,
            },
            "sleep" => ElementKind::Sleep {
                seconds: self.param("seconds")?,
                deadline: None,
            },
            "waitidle" => ElementKind::WaitIdle,
            "tardisable" => ElementKind::TargetDisable,
            "tempdisable" => {
                let (offset, text) = self
                    .token()
                    .ok_or_else(|| self.error(self.text.len(), "missing parameter time"))?;
                let time = Operand::parse_value(text, Multiplier::Time)
                    .map_err(|e| e.shifted(self.base + offset))?;
                ElementKind::TempDisable(time)
            }
            "tarboost" => ElementKind::TarBoost {
                seconds: self.param("seconds")?,
                bonus: self.param("bonus")?,
            },
            "hex" | "fxf" => {
                let pattern_kind = if keyword == "hex" {
                    PatternKind::Hex
                } else {
                    PatternKind::Fxf
                };
                let ra_size = self.param("ra size")?;
                let dec_size = self.param("dec size")?;
                let pattern_device = device
                    .clone()
                    .unwrap_or_else(|| TELESCOPE_PSEUDO_DEVICE.to_string());
                ElementKind::Block(self.body(BlockKind::Pattern {
                    pattern: Pattern::new(pattern_kind, ra_size, dec_size),
                    device: pattern_device,
                    moved: false,
                })?)
            }
            "exe" => ElementKind::Exe(ExeBridge::new(self.string_param("path")?)),
            "command" => ElementKind::Command(self.string_param("command")?.to_string()),
            _ if keyword.contains('=') => self.change_value(start, token, keyword)?,
            _ => return Err(self.error(start, format!("unknown command '{}'", keyword))),
        };
        Ok(Element::new(kind).with_device(device))
    }

    fn change_value(&self, start: usize, token: &str, keyword: &str) -> ParseResult<ElementKind> {
        let keyword_start = start + (token.len() - keyword.len());
        let op_start = keyword
            .find(['+', '-', '='])
            .ok_or_else(|| self.error(keyword_start, "missing operator"))?;
        let (name, rest) = keyword.split_at(op_start);
        let op_len = if rest.starts_with('=') { 1 } else { 2 };
        let op = ValueOp::from_symbol(rest.get(..op_len).unwrap_or(rest))
            .ok_or_else(|| self.error(keyword_start + op_start, "invalid operator"))?;
        let (name, while_state) = match name.strip_prefix('!') {
            Some(name) => (name, true),
            None => (name, false),
        };
        if name.is_empty() {
            return Err(self.error(keyword_start, "missing value name"));
        }
        let value_text = &rest[op_len..];
        if value_text.is_empty() {
            return Err(self.error(keyword_start + keyword.len(), "missing value"));
        }
        let mut operands = Vec::new();
        let mut offset = keyword_start + op_start + op_len;
        for piece in value_text.split(',') {
            operands.push(change_operand(piece).map_err(|e| e.shifted(self.base + offset))?);
            offset += piece.len() + 1;
        }
        Ok(ElementKind::ChangeValue {
            name: name.to_string(),
            op,
            operands,
            while_state,
        })
    }
}

/// `dev.rest` when the dot comes before any `=`
fn split_device(token: &str) -> (Option<&str>, &str) {
    let dot = token.find('.');
    let eq = token.find('=');
    match (dot, eq) {
        (Some(dot), None) if dot > 0 => (Some(&token[..dot]), &token[dot + 1..]),
        (Some(dot), Some(eq)) if dot > 0 && dot < eq => (Some(&token[..dot]), &token[dot + 1..]),
        _ => (None, token),
    }
}

/// Operand of a value change: an expression if it reads as one, else text
fn change_operand(piece: &str) -> ParseResult<Operand> {
    if piece.is_empty() {
        return Err(ParseError::new(0, "empty value"));
    }
    match Operand::parse_expression(piece) {
        Ok((operand, consumed)) if consumed == piece.len() => Ok(operand),
        _ => Ok(Operand::Text(piece.to_string())),
    }
}
