//! Minimal bencode reader/writer.
//!
//! The engine's resume blobs and `.torrent` files are bencoded; the system
//! treats them as opaque except for stripping the `info` key out of resume
//! blobs and wrapping info dictionaries into `.torrent` files. Dictionaries
//! use [`BTreeMap`] so encoding is canonical (keys in sorted order), which
//! keeps infohashes stable across decode/encode round trips.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A decoded bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Integer (`i...e`).
    Int(i64),
    /// Byte string (`<len>:...`).
    Bytes(Vec<u8>),
    /// List (`l...e`).
    List(Vec<Value>),
    /// Dictionary (`d...e`) with byte-string keys in sorted order.
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Decode a complete value, rejecting trailing garbage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bencode`] on malformed input.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut parser = Parser { buf, pos: 0 };
        let value = parser.parse()?;
        if parser.pos != buf.len() {
            return Err(Error::Bencode(format!(
                "trailing data after value at byte {}",
                parser.pos
            )));
        }
        Ok(value)
    }

    /// Encode into a byte vector.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Int(value) => {
                out.push(b'i');
                out.extend_from_slice(value.to_string().as_bytes());
                out.push(b'e');
            }
            Self::Bytes(bytes) => {
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(bytes);
            }
            Self::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Self::Dict(entries) => {
                out.push(b'd');
                for (key, value) in entries {
                    Self::Bytes(key.clone()).encode_into(out);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Borrow as a dictionary.
    #[must_use]
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Self::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Borrow as a mutable dictionary.
    #[must_use]
    pub fn as_dict_mut(&mut self) -> Option<&mut BTreeMap<Vec<u8>, Value>> {
        match self {
            Self::Dict(entries) => Some(entries),
            _ => None,
        }
    }

    /// Borrow as a byte string.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Borrow as an integer.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Borrow as a list.
    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Convenience constructor for a byte-string value.
    #[must_use]
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(data.into())
    }
}

/// Extract the raw byte span of the top-level `info` value from a bencoded
/// `.torrent` file, without re-encoding.
///
/// The span is exactly the bytes the infohash is computed over.
///
/// # Errors
///
/// Returns [`Error::Bencode`] if the input is not a dictionary, and
/// [`Error::Metainfo`] if it has no `info` key.
pub fn extract_info_slice(buf: &[u8]) -> Result<&[u8]> {
    let mut parser = Parser { buf, pos: 0 };
    if parser.next_byte()? != b'd' {
        return Err(Error::Bencode("torrent file is not a dictionary".into()));
    }
    parser.pos += 1;
    while parser.peek()? != b'e' {
        let key = parser.parse_bytes()?;
        let start = parser.pos;
        parser.skip_value()?;
        if key == b"info" {
            return Ok(&buf[start..parser.pos]);
        }
    }
    Err(Error::Metainfo("no info dictionary in torrent file".into()))
}

/// Wrap a bencoded info dictionary into a minimal `.torrent` file
/// (`d4:info...e`).
#[must_use]
pub fn wrap_info_dict(info: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(info.len() + 8);
    out.extend_from_slice(b"d4:info");
    out.extend_from_slice(info);
    out.push(b'e');
    out
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Result<u8> {
        self.next_byte()
    }

    fn next_byte(&self) -> Result<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| Error::Bencode("unexpected end of input".into()))
    }

    fn parse(&mut self) -> Result<Value> {
        match self.next_byte()? {
            b'i' => self.parse_int().map(Value::Int),
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.parse()?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut entries = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key = self.parse_bytes()?;
                    let value = self.parse()?;
                    entries.insert(key, value);
                }
                self.pos += 1;
                Ok(Value::Dict(entries))
            }
            b'0'..=b'9' => self.parse_bytes().map(Value::Bytes),
            other => Err(Error::Bencode(format!(
                "unexpected byte {:#04x} at offset {}",
                other, self.pos
            ))),
        }
    }

    fn parse_int(&mut self) -> Result<i64> {
        self.pos += 1;
        let end = self.find(b'e')?;
        let text = std::str::from_utf8(&self.buf[self.pos..end])
            .map_err(|_| Error::Bencode("non-ascii integer".into()))?;
        let value = text
            .parse::<i64>()
            .map_err(|err| Error::Bencode(format!("bad integer {text:?}: {err}")))?;
        self.pos = end + 1;
        Ok(value)
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>> {
        let colon = self.find(b':')?;
        let text = std::str::from_utf8(&self.buf[self.pos..colon])
            .map_err(|_| Error::Bencode("non-ascii length prefix".into()))?;
        let len = text
            .parse::<usize>()
            .map_err(|err| Error::Bencode(format!("bad length {text:?}: {err}")))?;
        let start = colon + 1;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::Bencode("byte string past end of input".into()))?;
        self.pos = end;
        Ok(self.buf[start..end].to_vec())
    }

    fn skip_value(&mut self) -> Result<()> {
        match self.next_byte()? {
            b'i' => {
                self.pos = self.find(b'e')? + 1;
                Ok(())
            }
            b'l' | b'd' => {
                let is_dict = self.next_byte()? == b'd';
                self.pos += 1;
                while self.peek()? != b'e' {
                    if is_dict {
                        self.parse_bytes()?;
                        self.skip_value()?;
                    } else {
                        self.skip_value()?;
                    }
                }
                self.pos += 1;
                Ok(())
            }
            b'0'..=b'9' => {
                self.parse_bytes()?;
                Ok(())
            }
            other => Err(Error::Bencode(format!(
                "unexpected byte {:#04x} at offset {}",
                other, self.pos
            ))),
        }
    }

    fn find(&self, needle: u8) -> Result<usize> {
        self.buf[self.pos..]
            .iter()
            .position(|byte| *byte == needle)
            .map(|offset| self.pos + offset)
            .ok_or_else(|| Error::Bencode(format!("missing {:?}", char::from(needle))))
    }
}
