//! Strict bencode encoder/decoder.
//!
//! Bencode has four types: byte strings, integers, lists and
//! dictionaries. This decoder is intentionally stricter than the
//! format's typical "be liberal in what you accept" implementations
//! because the infohash depends on every torrent file re-encoding back
//! to the exact bytes it was parsed from: a lenient parser that
//! accepts `i01e` or unsorted dict keys would silently compute the
//! wrong infohash for a tracker that expects canonical bencode.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Int(i64),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("invalid integer encoding")]
    InvalidInteger,
    #[error("invalid string length prefix")]
    InvalidStringLength,
    #[error("dictionary keys not in sorted order")]
    UnsortedKeys,
    #[error("duplicate dictionary key")]
    DuplicateKey,
    #[error("dictionary key is not a byte string")]
    NonStringKey,
    #[error("trailing bytes after top-level value")]
    TrailingBytes,
    #[error("expected a dictionary")]
    NotADict,
    #[error("expected a list")]
    NotAList,
    #[error("expected an integer")]
    NotAnInt,
    #[error("expected a byte string")]
    NotAString,
    #[error("missing required key {0:?}")]
    MissingKey(String),
    #[error("malformed value for key {0:?}")]
    MalformedValue(String),
}

impl Value {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Value::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(map) => {
                out.push(b'd');
                // BTreeMap iterates in sorted key order, which is exactly
                // bencode's canonical dictionary ordering.
                for (key, value) in map {
                    Value::Bytes(key.clone()).encode_into(out);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn as_dict(&self) -> Result<&BTreeMap<Vec<u8>, Value>, BencodeError> {
        match self {
            Value::Dict(d) => Ok(d),
            _ => Err(BencodeError::NotADict),
        }
    }

    pub fn as_list(&self) -> Result<&[Value], BencodeError> {
        match self {
            Value::List(l) => Ok(l),
            _ => Err(BencodeError::NotAList),
        }
    }

    pub fn as_int(&self) -> Result<i64, BencodeError> {
        match self {
            Value::Int(i) => Ok(*i),
            _ => Err(BencodeError::NotAnInt),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8], BencodeError> {
        match self {
            Value::Bytes(b) => Ok(b),
            _ => Err(BencodeError::NotAString),
        }
    }

    pub fn as_str(&self) -> Result<&str, BencodeError> {
        Ok(std::str::from_utf8(self.as_bytes()?).map_err(|_| BencodeError::NotAString)?)
    }

    pub fn dict_get<'a>(&'a self, key: &str) -> Option<&'a Value> {
        self.as_dict().ok().and_then(|d| d.get(key.as_bytes()))
    }

    pub fn dict_require<'a>(&'a self, key: &str) -> Result<&'a Value, BencodeError> {
        self.dict_get(key)
            .ok_or_else(|| BencodeError::MissingKey(key.to_string()))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "{s:?}"),
                Err(_) => write!(f, "<{} raw bytes>", b.len()),
            },
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Dict(map) => {
                write!(f, "{{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {value}", String::from_utf8_lossy(key))?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Decodes exactly one top-level bencoded value; trailing bytes are an error.
pub fn decode(input: &[u8]) -> Result<Value, BencodeError> {
    let mut cursor = Cursor { buf: input, pos: 0 };
    let value = cursor.parse_value()?;
    if cursor.pos != input.len() {
        return Err(BencodeError::TrailingBytes);
    }
    Ok(value)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.buf.get(self.pos).copied().ok_or(BencodeError::UnexpectedEof)
    }

    fn parse_value(&mut self) -> Result<Value, BencodeError> {
        match self.peek()? {
            b'i' => self.parse_int(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            b'0'..=b'9' => Ok(Value::Bytes(self.parse_string()?)),
            _ => Err(BencodeError::InvalidStringLength),
        }
    }

    fn parse_int(&mut self) -> Result<Value, BencodeError> {
        debug_assert_eq!(self.buf[self.pos], b'i');
        self.pos += 1;
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.buf[start..self.pos];
        self.pos += 1; // consume 'e'
        Self::validate_integer_digits(digits)?;
        let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger)?;
        text.parse::<i64>().map(Value::Int).map_err(|_| BencodeError::InvalidInteger)
    }

    fn validate_integer_digits(digits: &[u8]) -> Result<(), BencodeError> {
        if digits.is_empty() {
            return Err(BencodeError::InvalidInteger);
        }
        let (sign, rest) = if digits[0] == b'-' {
            (true, &digits[1..])
        } else {
            (false, digits)
        };
        if rest.is_empty() || !rest.iter().all(u8::is_ascii_digit) {
            return Err(BencodeError::InvalidInteger);
        }
        // "i0e" is the only value allowed to start with '0'; "i-0e" is banned
        // outright, and no positive value may carry a leading zero.
        if rest == b"0" {
            if sign {
                return Err(BencodeError::InvalidInteger); // negative zero
            }
            return Ok(());
        }
        if rest[0] == b'0' {
            return Err(BencodeError::InvalidInteger); // leading zero
        }
        Ok(())
    }

    fn parse_string(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            if !self.buf[self.pos].is_ascii_digit() {
                return Err(BencodeError::InvalidStringLength);
            }
            self.pos += 1;
        }
        let len_digits = &self.buf[start..self.pos];
        if len_digits.is_empty() || (len_digits.len() > 1 && len_digits[0] == b'0') {
            return Err(BencodeError::InvalidStringLength);
        }
        let len: usize = std::str::from_utf8(len_digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidStringLength)?;
        self.pos += 1; // consume ':'
        let end = self.pos.checked_add(len).ok_or(BencodeError::InvalidStringLength)?;
        if end > self.buf.len() {
            return Err(BencodeError::UnexpectedEof);
        }
        let bytes = self.buf[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<Value, BencodeError> {
        debug_assert_eq!(self.buf[self.pos], b'l');
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.parse_value()?);
        }
        self.pos += 1; // consume 'e'
        Ok(Value::List(items))
    }

    fn parse_dict(&mut self) -> Result<Value, BencodeError> {
        debug_assert_eq!(self.buf[self.pos], b'd');
        self.pos += 1;
        let mut map = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;
        while self.peek()? != b'e' {
            if self.peek()? < b'0' || self.peek()? > b'9' {
                return Err(BencodeError::NonStringKey);
            }
            let key = self.parse_string()?;
            if let Some(prev) = &last_key {
                if &key == prev {
                    return Err(BencodeError::DuplicateKey);
                }
                if key < *prev {
                    return Err(BencodeError::UnsortedKeys);
                }
            }
            let value = self.parse_value()?;
            last_key = Some(key.clone());
            map.insert(key, value);
        }
        self.pos += 1; // consume 'e'
        Ok(Value::Dict(map))
    }
}
