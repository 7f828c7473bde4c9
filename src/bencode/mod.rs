pub mod pretty;

use std::fmt::{Display, Formatter};

use bytes::{BufMut, Bytes, BytesMut};


/// Nesting depth accepted by the decoder. Control payloads are shallow in practice; the
///  limit only exists so that hostile input cannot drive the recursive parser into the stack.
const MAX_DEPTH: usize = 32;

/// A decoded bencode value - an owned tree with no links back into the wire buffer.
///
/// Dictionaries keep their pairs in insertion order. Keys are neither required to be sorted
///  nor unique at this layer; lookups take the first match.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BencodeValue {
    Str(Bytes),
    Int(i64),
    List(Vec<BencodeValue>),
    Dict(Vec<(Bytes, BencodeValue)>),
}

impl BencodeValue {
    pub fn new_dict() -> BencodeValue {
        BencodeValue::Dict(Vec::new())
    }

    /// first-match lookup; `None` on a non-dictionary value
    pub fn get(&self, key: &[u8]) -> Option<&BencodeValue> {
        match self {
            BencodeValue::Dict(pairs) => pairs.iter()
                .find(|(k, _)| k.as_ref() == key)
                .map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &[u8]) -> Option<&[u8]> {
        match self.get(key)? {
            BencodeValue::Str(s) => Some(s.as_ref()),
            _ => None,
        }
    }

    /// appends a string pair; a no-op on anything but a dictionary
    pub fn push_str(&mut self, key: &str, value: &str) {
        if let BencodeValue::Dict(pairs) = self {
            pairs.push((
                Bytes::copy_from_slice(key.as_bytes()),
                BencodeValue::Str(Bytes::copy_from_slice(value.as_bytes())),
            ));
        }
    }

    /// appends an integer pair; a no-op on anything but a dictionary
    pub fn push_int(&mut self, key: &str, value: i64) {
        if let BencodeValue::Dict(pairs) = self {
            pairs.push((
                Bytes::copy_from_slice(key.as_bytes()),
                BencodeValue::Int(value),
            ));
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        self.encode_to(&mut buf);
        buf.freeze()
    }

    pub fn encode_to(&self, buf: &mut BytesMut) {
        match self {
            BencodeValue::Str(s) => {
                encode_str(s, buf);
            }
            BencodeValue::Int(value) => {
                buf.put_u8(b'i');
                buf.put_slice(value.to_string().as_bytes());
                buf.put_u8(b'e');
            }
            BencodeValue::List(items) => {
                buf.put_u8(b'l');
                for item in items {
                    item.encode_to(buf);
                }
                buf.put_u8(b'e');
            }
            BencodeValue::Dict(pairs) => {
                buf.put_u8(b'd');
                for (key, value) in pairs {
                    encode_str(key, buf);
                    value.encode_to(buf);
                }
                buf.put_u8(b'e');
            }
        }
    }
}

fn encode_str(s: &[u8], buf: &mut BytesMut) {
    buf.put_slice(s.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(s);
}


#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BencodeError {
    Truncated,
    InvalidInteger,
    InvalidLength,
    UnexpectedByte(u8),
    TrailingBytes,
    DepthLimit,
    ExpectedDictionary,
}

impl Display for BencodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BencodeError::Truncated => write!(f, "input ended in the middle of a value"),
            BencodeError::InvalidInteger => write!(f, "malformed integer"),
            BencodeError::InvalidLength => write!(f, "malformed string length"),
            BencodeError::UnexpectedByte(b) => write!(f, "unexpected byte 0x{:02x}", b),
            BencodeError::TrailingBytes => write!(f, "trailing bytes after the top-level value"),
            BencodeError::DepthLimit => write!(f, "nesting deeper than {} levels", MAX_DEPTH),
            BencodeError::ExpectedDictionary => write!(f, "top-level value is not a dictionary"),
        }
    }
}

impl std::error::Error for BencodeError {}


/// Decodes a complete bencode value from `buf`. The whole input must be consumed.
pub fn decode(buf: &[u8]) -> Result<BencodeValue, BencodeError> {
    let mut decoder = Decoder { buf, pos: 0 };
    let value = decoder.parse_value(0)?;
    if decoder.pos != buf.len() {
        return Err(BencodeError::TrailingBytes);
    }
    Ok(value)
}

/// Like [decode], but the top-level value must be a dictionary.
pub fn decode_dictionary(buf: &[u8]) -> Result<BencodeValue, BencodeError> {
    match decode(buf)? {
        value @ BencodeValue::Dict(_) => Ok(value),
        _ => Err(BencodeError::ExpectedDictionary),
    }
}


struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn parse_value(&mut self, depth: usize) -> Result<BencodeValue, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::DepthLimit);
        }

        match self.peek().ok_or(BencodeError::Truncated)? {
            b'i' => self.parse_int(),
            b'0'..=b'9' => self.parse_str().map(BencodeValue::Str),
            b'l' => {
                self.advance();
                let mut items = Vec::new();
                loop {
                    match self.peek().ok_or(BencodeError::Truncated)? {
                        b'e' => {
                            self.advance();
                            return Ok(BencodeValue::List(items));
                        }
                        _ => items.push(self.parse_value(depth + 1)?),
                    }
                }
            }
            b'd' => {
                self.advance();
                let mut pairs = Vec::new();
                loop {
                    match self.peek().ok_or(BencodeError::Truncated)? {
                        b'e' => {
                            self.advance();
                            return Ok(BencodeValue::Dict(pairs));
                        }
                        b'0'..=b'9' => {
                            let key = self.parse_str()?;
                            let value = self.parse_value(depth + 1)?;
                            pairs.push((key, value));
                        }
                        // dictionary keys must be strings
                        other => return Err(BencodeError::UnexpectedByte(other)),
                    }
                }
            }
            other => Err(BencodeError::UnexpectedByte(other)),
        }
    }

    fn parse_int(&mut self) -> Result<BencodeValue, BencodeError> {
        self.advance(); // 'i'

        let negative = if self.peek() == Some(b'-') {
            self.advance();
            true
        } else {
            false
        };

        let digits_start = self.pos;
        let mut value: i64 = 0;
        while let Some(c @ b'0'..=b'9') = self.peek() {
            let digit = (c - b'0') as i64;
            // accumulating on the negative side keeps i64::MIN representable
            value = value.checked_mul(10)
                .and_then(|v| if negative { v.checked_sub(digit) } else { v.checked_add(digit) })
                .ok_or(BencodeError::InvalidInteger)?;
            self.advance();
        }

        let digits = self.pos - digits_start;
        if digits == 0 {
            return Err(BencodeError::InvalidInteger);
        }
        if self.buf[digits_start] == b'0' && (negative || digits > 1) {
            // rejects "-0" and leading zeros
            return Err(BencodeError::InvalidInteger);
        }

        match self.peek() {
            Some(b'e') => self.advance(),
            Some(_) => return Err(BencodeError::InvalidInteger),
            None => return Err(BencodeError::Truncated),
        }
        Ok(BencodeValue::Int(value))
    }

    fn parse_str(&mut self) -> Result<Bytes, BencodeError> {
        let mut len: usize = 0;
        while let Some(c @ b'0'..=b'9') = self.peek() {
            len = len.checked_mul(10)
                .and_then(|l| l.checked_add((c - b'0') as usize))
                .ok_or(BencodeError::InvalidLength)?;
            self.advance();
        }

        match self.peek() {
            Some(b':') => self.advance(),
            Some(_) => return Err(BencodeError::InvalidLength),
            None => return Err(BencodeError::Truncated),
        }

        if len > self.buf.len() - self.pos {
            return Err(BencodeError::Truncated);
        }
        let value = Bytes::copy_from_slice(&self.buf[self.pos..self.pos + len]);
        self.pos += len;
        Ok(value)
    }
}


#[cfg(test)]
mod test {
    use bytes::Bytes;
    use rstest::rstest;

    use super::*;

    fn s(value: &str) -> BencodeValue {
        BencodeValue::Str(Bytes::copy_from_slice(value.as_bytes()))
    }

    fn key(value: &str) -> Bytes {
        Bytes::copy_from_slice(value.as_bytes())
    }

    #[rstest]
    #[case::int(b"i42e", BencodeValue::Int(42))]
    #[case::int_zero(b"i0e", BencodeValue::Int(0))]
    #[case::int_negative(b"i-7e", BencodeValue::Int(-7))]
    #[case::int_min(b"i-9223372036854775808e", BencodeValue::Int(i64::MIN))]
    #[case::int_max(b"i9223372036854775807e", BencodeValue::Int(i64::MAX))]
    #[case::str_empty(b"0:", s(""))]
    #[case::str_simple(b"4:ping", s("ping"))]
    #[case::list_empty(b"le", BencodeValue::List(vec![]))]
    #[case::list(b"l4:pingi3ee", BencodeValue::List(vec![s("ping"), BencodeValue::Int(3)]))]
    #[case::dict_empty(b"de", BencodeValue::Dict(vec![]))]
    #[case::dict(b"d7:command4:pinge", BencodeValue::Dict(vec![(key("command"), s("ping"))]))]
    #[case::dict_nested(b"d3:sdpd5:mediali1ei2eeee", BencodeValue::Dict(vec![
        (key("sdp"), BencodeValue::Dict(vec![
            (key("media"), BencodeValue::List(vec![BencodeValue::Int(1), BencodeValue::Int(2)])),
        ])),
    ]))]
    fn test_decode(#[case] buf: &[u8], #[case] expected: BencodeValue) {
        assert_eq!(decode(buf), Ok(expected));
    }

    #[rstest]
    #[case::empty(b"", BencodeError::Truncated)]
    #[case::truncated_int(b"i42", BencodeError::Truncated)]
    #[case::truncated_str(b"4:pin", BencodeError::Truncated)]
    #[case::truncated_list(b"l4:ping", BencodeError::Truncated)]
    #[case::truncated_dict(b"d7:command", BencodeError::Truncated)]
    #[case::int_no_digits(b"ie", BencodeError::InvalidInteger)]
    #[case::int_minus_only(b"i-e", BencodeError::InvalidInteger)]
    #[case::int_minus_zero(b"i-0e", BencodeError::InvalidInteger)]
    #[case::int_leading_zero(b"i042e", BencodeError::InvalidInteger)]
    #[case::int_overflow(b"i92233720368547758089e", BencodeError::InvalidInteger)]
    #[case::int_garbage(b"i4x2e", BencodeError::InvalidInteger)]
    #[case::str_bad_length(b"4x:ping", BencodeError::InvalidLength)]
    #[case::dict_non_string_key(b"di1e4:pinge", BencodeError::UnexpectedByte(b'i'))]
    #[case::unexpected(b"x", BencodeError::UnexpectedByte(b'x'))]
    #[case::trailing(b"i42ei43e", BencodeError::TrailingBytes)]
    fn test_decode_error(#[case] buf: &[u8], #[case] expected: BencodeError) {
        assert_eq!(decode(buf), Err(expected));
    }

    #[test]
    fn test_decode_depth_limit() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[b'l'; 64]);
        buf.extend_from_slice(&[b'e'; 64]);
        assert_eq!(decode(&buf), Err(BencodeError::DepthLimit));
    }

    #[rstest]
    #[case::dict(b"d7:command4:pinge")]
    #[case::dict_empty(b"de")]
    fn test_decode_dictionary(#[case] buf: &[u8]) {
        assert!(matches!(decode_dictionary(buf), Ok(BencodeValue::Dict(_))));
    }

    #[rstest]
    #[case::int(b"i42e")]
    #[case::str(b"4:ping")]
    #[case::list(b"le")]
    fn test_decode_dictionary_rejects_non_dict(#[case] buf: &[u8]) {
        assert_eq!(decode_dictionary(buf), Err(BencodeError::ExpectedDictionary));
    }

    #[rstest]
    #[case::int(b"i-42e")]
    #[case::str(b"5:hello")]
    #[case::nested(b"d6:result4:pong4:listl1:a1:bee")]
    fn test_encode_round_trip(#[case] buf: &[u8]) {
        let value = decode(buf).unwrap();
        assert_eq!(value.encode().as_ref(), buf);
    }

    #[test]
    fn test_duplicate_keys_first_match_wins() {
        let value = decode(b"d1:k1:a1:k1:be").unwrap();
        assert_eq!(value.get_str(b"k"), Some(b"a".as_ref()));
    }

    #[test]
    fn test_dict_helpers() {
        let mut reply = BencodeValue::new_dict();
        reply.push_str("result", "pong");
        reply.push_int("created", 1234);

        assert_eq!(reply.get_str(b"result"), Some(b"pong".as_ref()));
        assert_eq!(reply.get(b"created"), Some(&BencodeValue::Int(1234)));
        assert_eq!(reply.get(b"missing"), None);
        assert_eq!(reply.get_str(b"created"), None);
        assert_eq!(reply.encode().as_ref(), b"d6:result4:pong7:createdi1234ee");
    }

    #[test]
    fn test_helpers_on_non_dict_are_inert() {
        let mut value = BencodeValue::Int(1);
        value.push_str("k", "v");
        assert_eq!(value, BencodeValue::Int(1));
        assert_eq!(value.get(b"k"), None);
    }
}
