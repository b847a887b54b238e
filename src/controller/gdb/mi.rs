//! Parser of gdb machine interface output records.

use crate::controller::escape::unescape_c;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("malformed MI record at column {pos}: {reason}")]
pub struct MiParseError {
    pub pos: usize,
    pub reason: &'static str,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MiValue {
    Const(String),
    Tuple(Tuple),
    List(Vec<MiValue>),
}

impl MiValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MiValue::Const(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&Tuple> {
        match self {
            MiValue::Tuple(t) => Some(t),
            _ => None,
        }
    }
}

/// Ordered list of `name=value` pairs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tuple(pub Vec<(String, MiValue)>);

impl Tuple {
    pub fn get(&self, name: &str) -> Option<&MiValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(MiValue::as_str)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::EnumString, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ResultClass {
    Done,
    Running,
    Connected,
    Error,
    Exit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsyncKind {
    /// `*` records, execution state changes.
    Exec,
    /// `+` records, progress of slow operations.
    Status,
    /// `=` records, supplementary information.
    Notify,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Console,
    Target,
    Log,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    Result {
        token: Option<u64>,
        class: ResultClass,
        results: Tuple,
    },
    Async {
        token: Option<u64>,
        kind: AsyncKind,
        class: String,
        results: Tuple,
    },
    Stream {
        kind: StreamKind,
        text: String,
    },
    /// `(gdb)` prompt, end of output chunk.
    Prompt,
    /// Line that is not an MI record, usually output of an inferior.
    Raw(String),
}

struct Cursor<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn expect(&mut self, b: u8, reason: &'static str) -> Result<(), MiParseError> {
        if self.bump() == Some(b) {
            Ok(())
        } else {
            Err(self.err(reason))
        }
    }

    fn err(&self, reason: &'static str) -> MiParseError {
        MiParseError {
            pos: self.pos,
            reason,
        }
    }

    fn word(&mut self, stop: &[u8]) -> &'a str {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if stop.contains(&b) {
                break;
            }
            self.pos += 1;
        }
        std::str::from_utf8(&self.src[start..self.pos]).unwrap_or_default()
    }

    fn token(&mut self) -> Option<u64> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        std::str::from_utf8(&self.src[start..self.pos])
            .ok()
            .and_then(|t| t.parse().ok())
    }

    fn c_string(&mut self) -> Result<String, MiParseError> {
        self.expect(b'"', "expect c-string")?;
        let start = self.pos;
        loop {
            match self.bump() {
                None => return Err(self.err("unterminated c-string")),
                Some(b'\\') => {
                    self.bump();
                }
                Some(b'"') => break,
                Some(_) => {}
            }
        }
        let body = std::str::from_utf8(&self.src[start..self.pos - 1])
            .map_err(|_| self.err("c-string is not utf-8"))?;
        let bytes = unescape_c(body).map_err(|_| self.err("invalid escape in c-string"))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn value(&mut self) -> Result<MiValue, MiParseError> {
        match self.peek() {
            Some(b'"') => self.c_string().map(MiValue::Const),
            Some(b'{') => {
                self.bump();
                let tuple = self.results_until(b'}')?;
                Ok(MiValue::Tuple(tuple))
            }
            Some(b'[') => {
                self.bump();
                let mut items = vec![];
                if self.peek() == Some(b']') {
                    self.bump();
                    return Ok(MiValue::List(items));
                }
                loop {
                    let item = match self.peek() {
                        Some(b'"' | b'{' | b'[') => self.value()?,
                        _ => {
                            let (name, value) = self.result()?;
                            MiValue::Tuple(Tuple(vec![(name, value)]))
                        }
                    };
                    items.push(item);
                    match self.bump() {
                        Some(b',') => continue,
                        Some(b']') => break,
                        _ => return Err(self.err("expect ',' or ']' in list")),
                    }
                }
                Ok(MiValue::List(items))
            }
            _ => Err(self.err("expect value")),
        }
    }

    fn result(&mut self) -> Result<(String, MiValue), MiParseError> {
        let name = self.word(b"=,{}[]\"").to_string();
        if name.is_empty() {
            return Err(self.err("expect variable name"));
        }
        self.expect(b'=', "expect '=' after variable name")?;
        Ok((name, self.value()?))
    }

    fn results_until(&mut self, close: u8) -> Result<Tuple, MiParseError> {
        let mut results = vec![];
        if self.peek() == Some(close) {
            self.bump();
            return Ok(Tuple(results));
        }
        loop {
            results.push(self.result()?);
            match self.bump() {
                Some(b',') => continue,
                Some(c) if c == close => break,
                _ => return Err(self.err("expect ',' or tuple end")),
            }
        }
        Ok(Tuple(results))
    }

    fn tail_results(&mut self) -> Result<Tuple, MiParseError> {
        let mut results = vec![];
        while self.peek() == Some(b',') {
            self.bump();
            results.push(self.result()?);
        }
        if self.peek().is_some() {
            return Err(self.err("unexpected trailing data"));
        }
        Ok(Tuple(results))
    }
}

/// Parse single line of gdb output.
pub fn parse_line(line: &str) -> Result<Record, MiParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim_end() == "(gdb)" {
        return Ok(Record::Prompt);
    }

    let mut cursor = Cursor {
        src: line.as_bytes(),
        pos: 0,
    };
    let token = cursor.token();

    let record = match cursor.bump() {
        Some(b'^') => {
            let class = cursor.word(b",");
            let Ok(class) = class.parse::<ResultClass>() else {
                return Err(cursor.err("unknown result class"));
            };
            Record::Result {
                token,
                class,
                results: cursor.tail_results()?,
            }
        }
        Some(prefix @ (b'*' | b'+' | b'=')) => {
            let kind = match prefix {
                b'*' => AsyncKind::Exec,
                b'+' => AsyncKind::Status,
                _ => AsyncKind::Notify,
            };
            let class = cursor.word(b",").to_string();
            Record::Async {
                token,
                kind,
                class,
                results: cursor.tail_results()?,
            }
        }
        Some(prefix @ (b'~' | b'@' | b'&')) if token.is_none() => {
            let kind = match prefix {
                b'~' => StreamKind::Console,
                b'@' => StreamKind::Target,
                _ => StreamKind::Log,
            };
            Record::Stream {
                kind,
                text: cursor.c_string()?,
            }
        }
        _ => Record::Raw(line.to_string()),
    };

    Ok(record)
}
