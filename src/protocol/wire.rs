//! Primitive readers and writers for frame payloads.
//!
//! All integers are big-endian. Strings are u32-length-prefixed UTF-8
//! ("lstrings"); raw byte arrays are u32-length-prefixed.

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use crate::errors::ProtocolError;

/// Cursor over a single frame payload.
///
/// Every read checks the remaining length; a short payload is reported as a
/// malformed message naming the frame being decoded.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    message: &'static str,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8], message: &'static str) -> WireReader<'a> {
        WireReader {
            buf,
            pos: 0,
            message,
        }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn short(&self) -> ProtocolError {
        ProtocolError::Malformed {
            message: self.message,
            detail: "payload shorter than declared fields",
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(self.short());
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_i16(&mut self) -> Result<i16, ProtocolError> {
        Ok(i16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn get_uuid(&mut self) -> Result<Uuid, ProtocolError> {
        let raw: [u8; 16] = self.take(16)?.try_into().unwrap();
        Ok(Uuid::from_bytes(raw))
    }

    /// u32-length-prefixed UTF-8 string.
    pub fn get_lstring(&mut self) -> Result<String, ProtocolError> {
        let len = self.get_u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::Malformed {
            message: self.message,
            detail: "string field is not valid UTF-8",
        })
    }

    /// u32-length-prefixed byte array.
    pub fn get_bytes(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_fixed<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        Ok(self.take(N)?.try_into().unwrap())
    }

    /// Exactly `n` raw bytes with no length prefix.
    pub fn get_raw(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        self.take(n)
    }

    /// i16-count-prefixed (name, value) annotation array.
    pub fn get_annotations(&mut self) -> Result<Vec<(String, String)>, ProtocolError> {
        let count = self.get_i16()?;
        if count < 0 {
            return Err(self.short());
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = self.get_lstring()?;
            let value = self.get_lstring()?;
            out.push((name, value));
        }
        Ok(out)
    }

    /// i16-count-prefixed (code, bytes) key-value array.
    pub fn get_key_values(&mut self) -> Result<Vec<(u16, Vec<u8>)>, ProtocolError> {
        let count = self.get_i16()?;
        if count < 0 {
            return Err(self.short());
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let code = self.get_u16()?;
            let value = self.get_bytes()?;
            out.push((code, value));
        }
        Ok(out)
    }

    /// The decoder must consume the payload exactly: trailing garbage means
    /// the frame was built for a different protocol revision.
    pub fn expect_end(&self) -> Result<(), ProtocolError> {
        if self.remaining() != 0 {
            return Err(ProtocolError::Malformed {
                message: self.message,
                detail: "trailing bytes after last field",
            });
        }
        Ok(())
    }
}

/// Shallow-parse the tuple-encoded argument blob of an `Execute` into
/// positional values. `None`/NULL elements decode as empty values.
pub fn parse_argument_tuple(blob: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
    if blob.is_empty() {
        return Ok(Vec::new());
    }
    let mut r = WireReader::new(blob, "Execute");
    let count = r.get_i32()?;
    if count < 0 {
        return Err(ProtocolError::Malformed {
            message: "Execute",
            detail: "negative argument count",
        });
    }
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let _reserved = r.get_i32()?;
        let len = r.get_i32()?;
        if len < 0 {
            out.push(Vec::new());
        } else {
            out.push(r.get_raw(len as usize)?.to_vec());
        }
    }
    r.expect_end()?;
    Ok(out)
}

/// Encode positional argument values into the tuple wire form.
pub fn encode_argument_tuple(values: &[Vec<u8>]) -> Vec<u8> {
    if values.is_empty() {
        return Vec::new();
    }
    let mut buf = BytesMut::new();
    buf.put_i32(values.len() as i32);
    for value in values {
        buf.put_i32(0);
        buf.put_i32(value.len() as i32);
        buf.put_slice(value);
    }
    buf.to_vec()
}

pub fn put_lstring(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

pub fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

pub fn put_uuid(buf: &mut BytesMut, value: &Uuid) {
    buf.put_slice(value.as_bytes());
}

pub fn put_annotations(buf: &mut BytesMut, annotations: &[(String, String)]) {
    buf.put_i16(annotations.len() as i16);
    for (name, value) in annotations {
        put_lstring(buf, name);
        put_lstring(buf, value);
    }
}

pub fn put_key_values(buf: &mut BytesMut, pairs: &[(u16, Vec<u8>)]) {
    buf.put_i16(pairs.len() as i16);
    for (code, value) in pairs {
        buf.put_u16(*code);
        put_bytes(buf, value);
    }
}
