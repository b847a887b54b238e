//! Textual escaping for controllers without a structured argument path.
//!
//! A string argument travels through two quoting layers on its way into gdb:
//! first it becomes a C string literal inside a gdb expression, then the whole
//! expression becomes a MI c-string parameter of `-data-evaluate-expression`.
//! Both layers are produced only here.

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("byte sequence contains NUL at position {0} and can't be passed as a C string")]
    InteriorNul(usize),
    #[error("invalid escape sequence at position {0}")]
    InvalidEscape(usize),
}

/// Render bytes as a C string literal (including surrounding quotes).
///
/// Output consists of printable ASCII only, every other byte is written as a
/// three digit octal escape.
pub fn c_string_literal(bytes: &[u8]) -> Result<String, EncodingError> {
    let mut literal = String::with_capacity(bytes.len() + 2);
    literal.push('"');
    for (pos, &b) in bytes.iter().enumerate() {
        match b {
            0 => return Err(EncodingError::InteriorNul(pos)),
            b'\\' => literal.push_str("\\\\"),
            b'"' => literal.push_str("\\\""),
            b'\n' => literal.push_str("\\n"),
            b'\r' => literal.push_str("\\r"),
            b'\t' => literal.push_str("\\t"),
            0x20..=0x7e => literal.push(b as char),
            _ => literal.push_str(&format!("\\{b:03o}")),
        }
    }
    literal.push('"');
    Ok(literal)
}

/// Quote a MI command parameter as a MI c-string.
pub fn mi_c_string(param: &str) -> String {
    let mut quoted = String::with_capacity(param.len() + 2);
    quoted.push('"');
    for ch in param.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('"');
    quoted
}

/// Decode C escape sequences of a string body (without surrounding quotes).
pub fn unescape_c(body: &str) -> Result<Vec<u8>, EncodingError> {
    let src = body.as_bytes();
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        if src[i] != b'\\' {
            out.push(src[i]);
            i += 1;
            continue;
        }

        let esc_pos = i;
        i += 1;
        let Some(&c) = src.get(i) else {
            return Err(EncodingError::InvalidEscape(esc_pos));
        };
        i += 1;
        match c {
            b'\\' => out.push(b'\\'),
            b'"' => out.push(b'"'),
            b'\'' => out.push(b'\''),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'v' => out.push(0x0b),
            b'e' => out.push(0x1b),
            b'0'..=b'7' => {
                let mut value = u32::from(c - b'0');
                let mut digits = 1;
                while digits < 3 {
                    match src.get(i) {
                        Some(&d @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(d - b'0');
                            i += 1;
                            digits += 1;
                        }
                        _ => break,
                    }
                }
                let byte = u8::try_from(value).map_err(|_| EncodingError::InvalidEscape(esc_pos))?;
                out.push(byte);
            }
            b'x' => {
                let start = i;
                while i < src.len() && src[i].is_ascii_hexdigit() && i - start < 2 {
                    i += 1;
                }
                if start == i {
                    return Err(EncodingError::InvalidEscape(esc_pos));
                }
                let hex = std::str::from_utf8(&src[start..i])
                    .map_err(|_| EncodingError::InvalidEscape(esc_pos))?;
                let byte =
                    u8::from_str_radix(hex, 16).map_err(|_| EncodingError::InvalidEscape(esc_pos))?;
                out.push(byte);
            }
            _ => return Err(EncodingError::InvalidEscape(esc_pos)),
        }
    }
    Ok(out)
}
