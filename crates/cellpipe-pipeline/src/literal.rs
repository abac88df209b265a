//! Literal-only parser for module header attribute values.
//!
//! Attribute values are written in a Python-repr style: `True`, `3`,
//! `'text'`, `['a', 'b']`, `array([1, 2], dtype=uint8)`. This parser
//! accepts only literals (booleans, `None`, numbers, strings, lists,
//! tuples, and the `array(...)` form) and rejects anything else.

use std::fmt::{self, Write as _};

/// A parsed attribute literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    /// `None`
    None,
    /// `True` / `False`
    Bool(bool),
    /// An integer, optionally with an `L` suffix.
    Int(i64),
    /// A float.
    Float(f64),
    /// A quoted string, optionally `u`-prefixed.
    Str(String),
    /// `[a, b]`
    List(Vec<Literal>),
    /// `(a, b)`
    Tuple(Vec<Literal>),
    /// `array([..], dtype=name)`
    Array {
        /// Element literals.
        values: Vec<Literal>,
        /// The `dtype` name, e.g. `uint8`.
        dtype: String,
    },
}

/// Why a literal failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LiteralError {
    /// Input ended mid-literal.
    #[error("unexpected end of input")]
    UnexpectedEnd,
    /// A character that cannot start or continue a literal.
    #[error("unexpected {found:?} at offset {offset}")]
    Unexpected {
        /// Byte offset.
        offset: usize,
        /// The offending character.
        found: char,
    },
    /// An identifier other than the accepted keywords.
    #[error("{0:?} is not a literal")]
    NotALiteral(String),
    /// Numeric text that does not parse.
    #[error("invalid number {0:?}")]
    BadNumber(String),
    /// A bad escape inside a string.
    #[error("invalid string escape at offset {0}")]
    BadEscape(usize),
    /// Content after a complete literal.
    #[error("trailing characters at offset {0}")]
    Trailing(usize),
}

/// Parse a single literal, rejecting trailing content.
///
/// # Errors
///
/// Returns a [`LiteralError`] when `text` is not exactly one literal.
pub fn parse_literal(text: &str) -> Result<Literal, LiteralError> {
    let mut parser = Parser { text, pos: 0 };
    let value = parser.value()?;
    parser.skip_ws();
    if parser.pos < text.len() {
        return Err(LiteralError::Trailing(parser.pos));
    }
    Ok(value)
}

impl Literal {
    /// The integer value, if this is an integer.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The truth value of a boolean or integer literal.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// The string value, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Elements of a list, tuple, or array.
    #[must_use]
    pub fn as_sequence(&self) -> Option<&[Self]> {
        match self {
            Self::List(items) | Self::Tuple(items) | Self::Array { values: items, .. } => Some(items),
            _ => None,
        }
    }

    /// A `uint8` array literal.
    #[must_use]
    pub fn byte_array(bytes: &[u8]) -> Self {
        Self::Array {
            values: bytes.iter().map(|&b| Self::Int(i64::from(b))).collect(),
            dtype: "uint8".to_string(),
        }
    }

    /// A list of string literals.
    #[must_use]
    pub fn string_list(items: &[String]) -> Self {
        Self::List(items.iter().cloned().map(Self::Str).collect())
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) if v.is_finite() && v.fract() == 0.0 => write!(f, "{v:.1}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write_quoted(f, s),
            Self::List(items) => write_seq(f, "[", items, "]"),
            Self::Tuple(items) if items.len() == 1 => write_seq(f, "(", items, ",)"),
            Self::Tuple(items) => write_seq(f, "(", items, ")"),
            Self::Array { values, dtype } => {
                write_seq(f, "array([", values, "]")?;
                write!(f, ", dtype={dtype})")
            }
        }
    }
}

fn write_seq(f: &mut fmt::Formatter<'_>, open: &str, items: &[Literal], close: &str) -> fmt::Result {
    f.write_str(open)?;
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    f.write_str(close)
}

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    if !s.is_ascii() {
        f.write_char('u')?;
    }
    f.write_char('\'')?;
    for c in s.chars() {
        match c {
            '\\' => f.write_str("\\\\")?,
            '\'' => f.write_str("\\'")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            c if (c as u32) < 0x20 || c as u32 == 0x7f => write!(f, "\\x{:02x}", c as u32)?,
            c if c.is_ascii() => f.write_char(c)?,
            c => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    write!(f, "\\u{unit:04x}")?;
                }
            }
        }
    }
    f.write_char('\'')
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek().filter(|c| c.is_whitespace()) {
            self.pos += c.len_utf8();
        }
    }

    fn expect(&mut self, want: char) -> Result<(), LiteralError> {
        self.skip_ws();
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(found) => Err(LiteralError::Unexpected {
                offset: self.pos - found.len_utf8(),
                found,
            }),
            None => Err(LiteralError::UnexpectedEnd),
        }
    }

    fn value(&mut self) -> Result<Literal, LiteralError> {
        self.skip_ws();
        let c = self.peek().ok_or(LiteralError::UnexpectedEnd)?;
        match c {
            '[' => {
                self.pos += 1;
                Ok(Literal::List(self.items(']')?.0))
            }
            '(' => {
                self.pos += 1;
                let (items, trailing_comma) = self.items(')')?;
                if items.len() == 1 && !trailing_comma {
                    Ok(items.into_iter().next().unwrap_or(Literal::None))
                } else {
                    Ok(Literal::Tuple(items))
                }
            }
            '\'' | '"' => self.string(),
            '-' | '+' | '.' | '0'..='9' => self.number(),
            c if c.is_ascii_alphabetic() || c == '_' => self.word(),
            found => Err(LiteralError::Unexpected {
                offset: self.pos,
                found,
            }),
        }
    }

    /// Comma-separated values up to `close`; reports a trailing comma.
    fn items(&mut self, close: char) -> Result<(Vec<Literal>, bool), LiteralError> {
        let mut items = Vec::new();
        let mut trailing_comma = false;
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.pos += 1;
                return Ok((items, trailing_comma));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.bump() {
                Some(',') => trailing_comma = true,
                Some(c) if c == close => return Ok((items, false)),
                Some(found) => {
                    return Err(LiteralError::Unexpected {
                        offset: self.pos - found.len_utf8(),
                        found,
                    });
                }
                None => return Err(LiteralError::UnexpectedEnd),
            }
        }
    }

    fn word(&mut self) -> Result<Literal, LiteralError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        let word = &self.text[start..self.pos];
        match word {
            "None" => Ok(Literal::None),
            "True" => Ok(Literal::Bool(true)),
            "False" => Ok(Literal::Bool(false)),
            "u" | "U" | "r" | "R" | "ur" | "UR" if matches!(self.peek(), Some('\'' | '"')) => {
                let raw = word.contains(['r', 'R']);
                if raw { self.raw_string() } else { self.string() }
            }
            "array" => self.array(),
            other => Err(LiteralError::NotALiteral(other.to_string())),
        }
    }

    fn array(&mut self) -> Result<Literal, LiteralError> {
        self.expect('(')?;
        let values = match self.value()? {
            Literal::List(values) => values,
            _ => return Err(LiteralError::NotALiteral("array".to_string())),
        };
        self.skip_ws();
        let mut dtype = String::from("float64");
        if self.peek() == Some(',') {
            self.pos += 1;
            self.skip_ws();
            let start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
                self.pos += 1;
            }
            if &self.text[start..self.pos] != "dtype" {
                return Err(LiteralError::NotALiteral(self.text[start..self.pos].to_string()));
            }
            self.expect('=')?;
            self.skip_ws();
            let start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
                self.pos += 1;
            }
            dtype = self.text[start..self.pos]
                .trim_start_matches("numpy.")
                .trim_start_matches("np.")
                .to_string();
            if dtype.is_empty() {
                return Err(LiteralError::UnexpectedEnd);
            }
        }
        self.expect(')')?;
        Ok(Literal::Array { values, dtype })
    }

    fn number(&mut self) -> Result<Literal, LiteralError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+'))
        {
            // Only allow a sign at the start or directly after an exponent.
            if matches!(self.peek(), Some('-' | '+')) && self.pos != start {
                let prev = self.text.as_bytes()[self.pos - 1];
                if prev != b'e' && prev != b'E' {
                    break;
                }
            }
            self.pos += 1;
        }
        let text = &self.text[start..self.pos];
        let digits = text.strip_suffix(['L', 'l']).unwrap_or(text);
        if let Ok(v) = digits.parse::<i64>() {
            return Ok(Literal::Int(v));
        }
        if digits.chars().any(|c| matches!(c, '.' | 'e' | 'E'))
            && let Ok(v) = digits.parse::<f64>()
        {
            return Ok(Literal::Float(v));
        }
        Err(LiteralError::BadNumber(text.to_string()))
    }

    fn raw_string(&mut self) -> Result<Literal, LiteralError> {
        let quote = self.bump().ok_or(LiteralError::UnexpectedEnd)?;
        let start = self.pos;
        loop {
            match self.bump() {
                Some('\\') => {
                    self.bump().ok_or(LiteralError::UnexpectedEnd)?;
                }
                Some(c) if c == quote => {
                    return Ok(Literal::Str(self.text[start..self.pos - 1].to_string()));
                }
                Some(_) => {}
                None => return Err(LiteralError::UnexpectedEnd),
            }
        }
    }

    fn string(&mut self) -> Result<Literal, LiteralError> {
        let quote = self.bump().ok_or(LiteralError::UnexpectedEnd)?;
        let mut out = String::new();
        let mut pending_high: Option<u16> = None;
        loop {
            let escape_at = self.pos;
            let c = self.bump().ok_or(LiteralError::UnexpectedEnd)?;
            if c == quote {
                if pending_high.is_some() {
                    out.push(char::REPLACEMENT_CHARACTER);
                }
                return Ok(Literal::Str(out));
            }
            if c != '\\' {
                if pending_high.take().is_some() {
                    out.push(char::REPLACEMENT_CHARACTER);
                }
                out.push(c);
                continue;
            }
            let e = self.bump().ok_or(LiteralError::UnexpectedEnd)?;
            let unit = match e {
                'u' => Some(self.hex(4, escape_at)?),
                'x' => {
                    let v = self.hex(2, escape_at)?;
                    out.push(char::from_u32(u32::from(v)).ok_or(LiteralError::BadEscape(escape_at))?);
                    None
                }
                'n' => {
                    out.push('\n');
                    None
                }
                'r' => {
                    out.push('\r');
                    None
                }
                't' => {
                    out.push('\t');
                    None
                }
                '0' => {
                    out.push('\0');
                    None
                }
                '\\' | '\'' | '"' => {
                    out.push(e);
                    None
                }
                other => {
                    out.push('\\');
                    out.push(other);
                    None
                }
            };
            match (pending_high.take(), unit) {
                (Some(high), Some(low)) if (0xDC00..0xE000).contains(&low) => {
                    let c = char::decode_utf16([high, low])
                        .next()
                        .and_then(Result::ok)
                        .unwrap_or(char::REPLACEMENT_CHARACTER);
                    out.push(c);
                }
                (high, Some(unit)) => {
                    if high.is_some() {
                        out.push(char::REPLACEMENT_CHARACTER);
                    }
                    if (0xD800..0xDC00).contains(&unit) {
                        pending_high = Some(unit);
                    } else {
                        out.push(char::from_u32(u32::from(unit)).unwrap_or(char::REPLACEMENT_CHARACTER));
                    }
                }
                (Some(_), None) => out.push(char::REPLACEMENT_CHARACTER),
                (None, None) => {}
            }
        }
    }

    fn hex(&mut self, len: usize, escape_at: usize) -> Result<u16, LiteralError> {
        let end = self.pos + len;
        let digits = self.text.get(self.pos..end).ok_or(LiteralError::BadEscape(escape_at))?;
        let v = u16::from_str_radix(digits, 16).map_err(|_| LiteralError::BadEscape(escape_at))?;
        self.pos = end;
        Ok(v)
    }
}
