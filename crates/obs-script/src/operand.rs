//! Operands of value changes and loop conditions
//!
//! Operands are small expressions: numbers with unit suffixes, bare strings,
//! `rand(a,b)` draws, device values (`C0.exposure`, or `.exposure` for the
//! script's own device) and one comparison between two of those. Device
//! values are looked up again on every evaluation.

use crate::error::{ParseError, ParseResult};
use obs_core::ValueSource;
use rand::Rng;
use std::fmt;

/// How unit suffixes of numbers are read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplier {
    /// Degrees: `d`, `h` (15), `m` (1/60), `s` (1/3600)
    Angle,
    /// Seconds: `s`, `m` (60), `h` (3600)
    Time,
}

impl Multiplier {
    fn factor(self, suffix: &str) -> Option<f64> {
        match (self, suffix) {
            (_, "") => Some(1.0),
            (_, "D") => Some(86400.0),
            (_, "H") => Some(3600.0),
            (_, "W") => Some(604800.0),
            (Multiplier::Angle, "d") => Some(1.0),
            (Multiplier::Angle, "h") => Some(15.0),
            (Multiplier::Angle, "m") => Some(1.0 / 60.0),
            (Multiplier::Angle, "s") => Some(1.0 / 3600.0),
            (Multiplier::Time, "s") => Some(1.0),
            (Multiplier::Time, "m") => Some(60.0),
            (Multiplier::Time, "h") => Some(3600.0),
            _ => None,
        }
    }
}

/// Comparison operators allowed in conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Equal,
    Less,
    LessEqual,
    GreaterEqual,
    Greater,
}

impl Comparator {
    fn as_str(self) -> &'static str {
        match self {
            Comparator::Equal => "==",
            Comparator::Less => "<",
            Comparator::LessEqual => "<=",
            Comparator::GreaterEqual => ">=",
            Comparator::Greater => ">",
        }
    }

    fn compare(self, left: f64, right: f64) -> bool {
        match self {
            Comparator::Equal => left == right,
            Comparator::Less => left < right,
            Comparator::LessEqual => left <= right,
            Comparator::GreaterEqual => left >= right,
            Comparator::Greater => left > right,
        }
    }
}

/// A parsed operand
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Number with its unit already applied; `text` is the source form
    Number { value: f64, text: String },
    Text(String),
    Random { low: f64, high: f64 },
    /// Device value; `None` device means the script's own device
    Value { device: Option<String>, name: String },
    Compare {
        left: Box<Operand>,
        cmp: Comparator,
        right: Box<Operand>,
    },
}

fn starts_number(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() => true,
        Some('.') => chars.next().is_some_and(|c| c.is_ascii_digit()),
        Some('+') | Some('-') => match chars.next() {
            Some(c) if c.is_ascii_digit() => true,
            Some('.') => chars.next().is_some_and(|c| c.is_ascii_digit()),
            _ => false,
        },
        _ => false,
    }
}

impl Operand {
    /// Parse a single value token: a number, `rand(a,b)`, or a string
    pub fn parse_value(token: &str, multiplier: Multiplier) -> ParseResult<Operand> {
        if starts_number(token) {
            let split = token
                .find(|c: char| !(c.is_ascii_digit() || matches!(c, '.' | '+' | '-')))
                .unwrap_or(token.len());
            let (number, suffix) = token.split_at(split);
            let value: f64 = number
                .parse()
                .map_err(|_| ParseError::new(0, format!("invalid number '{}'", token)))?;
            let factor = multiplier
                .factor(suffix)
                .ok_or_else(|| ParseError::new(split, format!("unknown multiplier '{}'", suffix)))?;
            return Ok(Operand::Number {
                value: value * factor,
                text: token.to_string(),
            });
        }
        if let Some(args) = token.strip_prefix("rand(") {
            let args = args
                .strip_suffix(')')
                .ok_or_else(|| ParseError::new(token.len(), "missing ')'"))?;
            let (low, high) = args
                .split_once(',')
                .ok_or_else(|| ParseError::new(5, "rand needs two arguments"))?;
            let bound = |s: &str| match Operand::parse_value(s.trim(), multiplier) {
                Ok(Operand::Number { value, .. }) => Ok(value),
                _ => Err(ParseError::new(5, format!("invalid rand bound '{}'", s))),
            };
            return Ok(Operand::Random {
                low: bound(low)?,
                high: bound(high)?,
            });
        }
        Ok(Operand::Text(token.to_string()))
    }

    /// Parse a condition from the start of `text`
    ///
    /// Returns the operand and the number of bytes consumed.
    pub fn parse_expression(text: &str) -> ParseResult<(Operand, usize)> {
        let mut parser = ExprParser { text, pos: 0 };
        let operand = parser.expression()?;
        Ok((operand, parser.pos))
    }

    /// Evaluate to a number; strings that are not numbers give NaN
    pub fn eval(&self, values: &dyn ValueSource, default_device: &str) -> f64 {
        match self {
            Operand::Number { value, .. } => *value,
            Operand::Text(s) => s.trim().parse().unwrap_or(f64::NAN),
            Operand::Random { low, high } => {
                let (low, high) = if low <= high { (*low, *high) } else { (*high, *low) };
                if low == high {
                    low
                } else {
                    rand::thread_rng().gen_range(low..high)
                }
            }
            Operand::Value { device, name } => values
                .value_f64(device.as_deref().unwrap_or(default_device), name)
                .unwrap_or(f64::NAN),
            Operand::Compare { left, cmp, right } => {
                let l = left.eval(values, default_device);
                let r = right.eval(values, default_device);
                if cmp.compare(l, r) {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Value as sent to a device: strings verbatim, everything else evaluated
    pub fn render(&self, values: &dyn ValueSource, default_device: &str) -> String {
        match self {
            Operand::Text(s) => s.clone(),
            Operand::Number { value, .. } => value.to_string(),
            other => other.eval(values, default_device).to_string(),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Number { text, .. } => f.write_str(text),
            Operand::Text(s) => f.write_str(s),
            Operand::Random { low, high } => write!(f, "rand({},{})", low, high),
            Operand::Value {
                device: Some(device),
                name,
            } => write!(f, "{}.{}", device, name),
            Operand::Value { device: None, name } => write!(f, ".{}", name),
            Operand::Compare { left, cmp, right } => {
                write!(f, "{}{}{}", left, cmp.as_str(), right)
            }
        }
    }
}

struct ExprParser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> ExprParser<'a> {
    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        self.text[self.pos..].chars().nth(1)
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek().filter(|c| c.is_whitespace()) {
            self.pos += c.len_utf8();
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(self.pos, message)
    }

    fn expression(&mut self) -> ParseResult<Operand> {
        let left = self.primary()?;
        let end = self.pos;
        self.skip_ws();
        match self.comparator()? {
            None => {
                self.pos = end;
                Ok(left)
            }
            Some(cmp) => {
                let right = self.primary()?;
                Ok(Operand::Compare {
                    left: Box::new(left),
                    cmp,
                    right: Box::new(right),
                })
            }
        }
    }

    fn comparator(&mut self) -> ParseResult<Option<Comparator>> {
        let first = match self.peek() {
            Some(c @ ('=' | '<' | '>')) => c,
            _ => return Ok(None),
        };
        let with_equal = self.peek_second() == Some('=');
        let cmp = match (first, with_equal) {
            ('=', true) => Comparator::Equal,
            ('=', false) => return Err(self.error("In conditions, only == is allowed")),
            ('<', true) => Comparator::LessEqual,
            ('<', false) => Comparator::Less,
            ('>', true) => Comparator::GreaterEqual,
            _ => Comparator::Greater,
        };
        self.pos += if with_equal { 2 } else { 1 };
        Ok(Some(cmp))
    }

    fn take_while(&mut self, keep: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(&keep) {
            self.pos += self.peek().map_or(0, char::len_utf8);
        }
        &self.text[start..self.pos]
    }

    fn primary(&mut self) -> ParseResult<Operand> {
        self.skip_ws();
        match self.peek() {
            None => Err(self.error("missing operand")),
            Some('(') => {
                self.pos += 1;
                self.skip_ws();
                if self.peek() == Some(')') {
                    return Err(self.error("missing expression inside ()"));
                }
                let inner = self.expression()?;
                self.skip_ws();
                if self.peek() != Some(')') {
                    return Err(self.error("missing ')'"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some('=' | '<' | '>') => Err(self.error("expected operand before operator")),
            Some(_) if starts_number(&self.text[self.pos..]) => {
                let start = self.pos;
                let token = self.take_while(|c| {
                    !(c.is_whitespace() || matches!(c, '(' | ')' | ',' | '=' | '<' | '>'))
                });
                Operand::parse_value(token, Multiplier::Angle).map_err(|e| e.shifted(start))
            }
            Some(c) if c.is_alphabetic() || c == '.' => {
                let start = self.pos;
                let name = self.take_while(|c| c.is_alphanumeric() || c == '.' || c == '_');
                if name == "rand" && self.peek() == Some('(') {
                    let args = self.take_while(|c| c != ')');
                    if self.peek() != Some(')') {
                        return Err(self.error("missing ')'"));
                    }
                    self.pos += 1;
                    let token = format!("{}{})", name, args);
                    return Operand::parse_value(&token, Multiplier::Angle)
                        .map_err(|e| e.shifted(start));
                }
                Ok(match name.split_once('.') {
                    Some(("", value)) => Operand::Value {
                        device: None,
                        name: value.to_string(),
                    },
                    Some((device, value)) => Operand::Value {
                        device: Some(device.to_string()),
                        name: value.to_string(),
                    },
                    None => Operand::Text(name.to_string()),
                })
            }
            Some(_) => Err(self.error("cannot parse sequence")),
        }
    }
}
