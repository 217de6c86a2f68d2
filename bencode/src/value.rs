use std::{collections::BTreeMap, ops::Range};
use crate::error::{Error, Result};

// Bencode types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    // Keys are kept sorted, which is also the order bencode requires on the wire.
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {

    // Decodes exactly one value, the input must not contain anything after it.
    pub fn decode(input: &[u8]) -> Result<Value> {
        let mut parser = Parser::new(input);
        let value = parser.parse_value()?;
        parser.finish()?;
        Ok(value)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {

            // i<integer encoded in base ten ASCII>e
            Value::Integer(i) => {
                buf.push(b'i');
                buf.extend_from_slice(i.to_string().as_bytes());
                buf.push(b'e');
            },

            // <length>:<contents>
            Value::Bytes(bytes) => encode_bytes(bytes, buf),

            // l<contents>e
            Value::List(list) => {
                buf.push(b'l');
                for value in list {
                    value.encode_into(buf);
                }
                buf.push(b'e');
            },

            // d<key><value>...e with keys in lexicographical order.
            Value::Dict(dict) => {
                buf.push(b'd');
                for (key, value) in dict {
                    encode_bytes(key, buf);
                    value.encode_into(buf);
                }
                buf.push(b'e');
            },
        }
    }

    // Builds a dictionary from string keys, mostly useful for tests and fixtures.
    pub fn dict<'a>(entries: impl IntoIterator<Item = (&'a str, Value)>) -> Value {
        Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.as_bytes().to_vec(), v))
                .collect()
        )
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    // Dictionary lookup, None if this is not a dictionary or the key is missing.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key.as_bytes()))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self { Value::Integer(i) }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::Bytes(s.as_bytes().to_vec()) }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self { Value::Bytes(b) }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self { Value::List(l) }
}

fn encode_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(bytes.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(bytes);
}

// Returns the byte range of the value stored under `key` in a top-level dictionary.
// The info-hash must be computed over the original bytes, re-encoding could
// reorder or drop keys.
pub fn dict_value_span(input: &[u8], key: &[u8]) -> Result<Option<Range<usize>>> {
    let mut parser = Parser::new(input);
    parser.expect(b'd', "d for dictionary")?;
    while parser.peek()? != b'e' {
        let k = parser.parse_bytes()?;
        let start = parser.pos;
        parser.skip_value()?;
        if k == key {
            return Ok(Some(start..parser.pos));
        }
    }
    Ok(None)
}

// Deepest list/dict nesting accepted. Metainfo and tracker replies need a handful of levels.
pub const MAX_DEPTH: usize = 128;

// Recursive descent parser over a borrowed buffer, shared with the serde decoder.
pub(crate) struct Parser<'a> {
    input: &'a [u8],
    pub pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {

    pub fn new(input: &'a [u8]) -> Self {
        Self { input, pos: 0, depth: 0 }
    }

    // Called before descending into a list or dict.
    pub fn enter(&mut self) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(Error::TooDeep(self.pos));
        }
        self.depth += 1;
        Ok(())
    }

    pub fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn peek(&self) -> Result<u8> {
        self.input.get(self.pos).copied().ok_or(Error::Eof(self.pos))
    }

    pub fn next(&mut self) -> Result<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    pub fn expect(&mut self, b: u8, expected: &'static str) -> Result<()> {
        let pos = self.pos;
        match self.next()? {
            found if found == b => Ok(()),
            found => Err(Error::InvalidToken { pos, expected, found: found as char }),
        }
    }

    pub fn finish(&self) -> Result<()> {
        if self.pos != self.input.len() {
            return Err(Error::TrailingData(self.pos));
        }
        Ok(())
    }

    // Reads digits (with optional sign) up to the terminator.
    fn read_number(&mut self, terminator: u8) -> Result<i64> {
        let start = self.pos;
        while self.peek()? != terminator {
            self.pos += 1;
        }
        let digits = &self.input[start..self.pos];
        self.pos += 1;

        // Negative zero and leading zeros are not valid bencode.
        let invalid = digits.is_empty()
            || digits == b"-0"
            || (digits.len() > 1 && digits[0] == b'0')
            || (digits.len() > 2 && digits[0] == b'-' && digits[1] == b'0');
        if invalid {
            return Err(Error::InvalidInteger(start));
        }

        std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(Error::InvalidInteger(start))
    }

    pub fn parse_int(&mut self) -> Result<i64> {
        self.expect(b'i', "i for integer")?;
        self.read_number(b'e')
    }

    pub fn parse_bytes(&mut self) -> Result<&'a [u8]> {
        let pos = self.pos;
        if !self.peek()?.is_ascii_digit() {
            return Err(Error::InvalidToken { pos, expected: "byte string length", found: self.peek()? as char });
        }
        let len = self.read_number(b':')?;
        let len = usize::try_from(len).map_err(|_| Error::InvalidInteger(pos))?;
        let end = self.pos.checked_add(len).ok_or(Error::InvalidInteger(pos))?;
        if end > self.input.len() {
            return Err(Error::Eof(self.input.len()));
        }
        let bytes = &self.input[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub fn parse_value(&mut self) -> Result<Value> {
        match self.peek()? {
            b'i' => Ok(Value::Integer(self.parse_int()?)),
            b'0'..=b'9' => Ok(Value::Bytes(self.parse_bytes()?.to_vec())),
            b'l' => {
                self.enter()?;
                self.pos += 1;
                let mut list = Vec::new();
                while self.peek()? != b'e' {
                    list.push(self.parse_value()?);
                }
                self.pos += 1;
                self.leave();
                Ok(Value::List(list))
            },
            b'd' => {
                self.enter()?;
                self.pos += 1;
                let mut dict = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key = self.parse_bytes()?.to_vec();
                    let value = self.parse_value()?;
                    dict.insert(key, value);
                }
                self.pos += 1;
                self.leave();
                Ok(Value::Dict(dict))
            },
            found => Err(Error::InvalidToken { pos: self.pos, expected: "a valid token type", found: found as char }),
        }
    }

    pub fn skip_value(&mut self) -> Result<()> {
        match self.peek()? {
            b'i' => { self.parse_int()?; },
            b'0'..=b'9' => { self.parse_bytes()?; },
            b'l' => {
                self.enter()?;
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.skip_value()?;
                }
                self.pos += 1;
                self.leave();
            },
            b'd' => {
                self.enter()?;
                self.pos += 1;
                while self.peek()? != b'e' {
                    self.parse_bytes()?;
                    self.skip_value()?;
                }
                self.pos += 1;
                self.leave();
            },
            found => return Err(Error::InvalidToken { pos: self.pos, expected: "a valid token type", found: found as char }),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_credentials_dict() {
        let v = Value::decode(b"d8:username3:joe8:password3:abc4:home2:~/8:disabledi0ee").unwrap();
        assert_eq!(v.get("username").and_then(Value::as_str), Some("joe"));
        assert_eq!(v.get("password").and_then(Value::as_str), Some("abc"));
        assert_eq!(v.get("home").and_then(Value::as_str), Some("~/"));
        assert_eq!(v.get("disabled").and_then(Value::as_int), Some(0));
        assert_eq!(v.as_dict().unwrap().len(), 4);
    }

    #[test]
    fn test_encode_sorts_keys() {
        let v = Value::dict([
            ("zed", Value::from(1)),
            ("abc", Value::from("spam")),
            ("list", Value::from(vec![Value::from(-42), Value::from("x")])),
        ]);
        assert_eq!(v.encode(), b"d3:abc4:spam4:listli-42e1:xe3:zedi1ee".to_vec());
    }

    #[test]
    fn test_decode_nested() {
        let v = Value::decode(b"ld1:ali1ei2eee3:fooe").unwrap();
        let list = v.as_list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].get("a").and_then(Value::as_list).map(|l| l.len()), Some(2));
        assert_eq!(list[1].as_str(), Some("foo"));
    }

    #[test]
    fn test_decode_invalid() {
        assert!(matches!(Value::decode(b"i12"), Err(Error::Eof(_))));
        assert!(matches!(Value::decode(b"5:abc"), Err(Error::Eof(_))));
        assert!(matches!(Value::decode(b"i03e"), Err(Error::InvalidInteger(_))));
        assert!(matches!(Value::decode(b"i-0e"), Err(Error::InvalidInteger(_))));
        assert!(matches!(Value::decode(b"i1ei2e"), Err(Error::TrailingData(3))));
        assert!(matches!(Value::decode(b"x"), Err(Error::InvalidToken { pos: 0, .. })));
        assert!(matches!(Value::decode(b"di1ei2ee"), Err(Error::InvalidToken { .. })));
    }

    fn nested(depth: usize) -> Vec<u8> {
        let mut input = b"d4:junk".to_vec();
        input.extend(std::iter::repeat(b'l').take(depth));
        input.extend(std::iter::repeat(b'e').take(depth));
        input.push(b'e');
        input
    }

    #[test]
    fn test_nesting_limit() {
        // The outer dict counts as one level.
        assert!(Value::decode(&nested(MAX_DEPTH - 1)).is_ok());
        assert!(matches!(Value::decode(&nested(MAX_DEPTH)), Err(Error::TooDeep(_))));
        assert!(matches!(Value::decode(&nested(200_000)), Err(Error::TooDeep(_))));
        assert!(matches!(dict_value_span(&nested(200_000), b"other"), Err(Error::TooDeep(_))));
    }

    #[test]
    fn test_dict_value_span() {
        let input = b"d8:announce3:url4:infod4:name3:fooe5:otheri1ee";
        let span = dict_value_span(input, b"info").unwrap().unwrap();
        assert_eq!(&input[span], b"d4:name3:fooe");
        assert_eq!(dict_value_span(input, b"missing").unwrap(), None);
    }
}
