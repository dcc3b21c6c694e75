//! The binary protocol codec (§4.A).
//!
//! Four dialects share the same framing shape (`u32_le length || payload`)
//! but differ in code width: server, peer and distributed messages use a
//! 32-bit little-endian code, while the initialization dialect uses a single
//! byte. [`MessageBuilder`]/[`MessageReader`] handle the 32-bit dialects;
//! [`InitMessageBuilder`]/[`InitMessageReader`] handle initialization.

pub mod distributed;
pub mod init;
pub mod peer;
pub mod server;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Write;

use crate::error::CodecError;

type Result<T> = std::result::Result<T, CodecError>;

/// Deflates `data`, returning the raw zlib-wrapped deflate stream used by
/// the legacy network for browse/folder/search responses.
fn deflate(data: &[u8]) -> Vec<u8> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    // writing to an in-memory encoder cannot fail
    encoder.write_all(data).expect("in-memory zlib write");
    encoder.finish().expect("in-memory zlib finish")
}

/// Inflates a zlib-wrapped deflate stream.
fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::read::ZlibDecoder;
    use std::io::Read;
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Inflate(e.to_string()))?;
    Ok(out)
}

/// Decodes a length-prefixed string, falling back to Windows-1252 (a
/// practical superset of ISO-8859-1) when the bytes are not valid UTF-8 —
/// older clients on the network send usernames and filenames in the host's
/// native code page.
fn decode_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => {
            let (text, _encoding, _had_errors) =
                encoding_rs::WINDOWS_1252.decode(bytes);
            text.into_owned()
        }
    }
}

/// A builder for a message in one of the 32-bit-code dialects (server,
/// peer, distributed). The length prefix is computed last, in [`finish`].
///
/// [`finish`]: MessageBuilder::finish
pub struct MessageBuilder {
    buf: BytesMut,
}

impl MessageBuilder {
    /// Starts a new message with the given dialect code.
    pub fn new(code: u32) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u32_le(code);
        Self { buf }
    }

    pub fn write_u8(mut self, val: u8) -> Self {
        self.buf.put_u8(val);
        self
    }

    pub fn write_u32(mut self, val: u32) -> Self {
        self.buf.put_u32_le(val);
        self
    }

    pub fn write_i64(mut self, val: i64) -> Self {
        self.buf.put_i64_le(val);
        self
    }

    pub fn write_bool(self, val: bool) -> Self {
        self.write_u8(if val { 1 } else { 0 })
    }

    /// Writes a length-prefixed string, encoded as UTF-8.
    pub fn write_string(mut self, val: &str) -> Self {
        self.buf.put_u32_le(val.len() as u32);
        self.buf.put_slice(val.as_bytes());
        self
    }

    /// Writes a raw, already length-framed byte slice with no extra
    /// prefixing (used for sub-records the caller has already encoded).
    pub fn write_raw(mut self, bytes: &[u8]) -> Self {
        self.buf.put_slice(bytes);
        self
    }

    /// Writes an IPv4 address, reversed from network byte order as the
    /// legacy protocol requires.
    pub fn write_ipv4(mut self, addr: std::net::Ipv4Addr) -> Self {
        let mut octets = addr.octets();
        octets.reverse();
        self.buf.put_slice(&octets);
        self
    }

    /// Deflates everything written so far after the code, replacing the
    /// payload body with its compressed form. Intended to be the last call
    /// before [`finish`](Self::finish).
    pub fn compress(self) -> Self {
        let mut buf = self.buf;
        let code = buf.split_to(4);
        let compressed = deflate(&buf);
        let mut out = BytesMut::with_capacity(4 + compressed.len());
        out.put_slice(&code);
        out.put_slice(&compressed);
        Self { buf: out }
    }

    /// Finishes the message, prefixing it with its byte length.
    pub fn finish(self) -> Bytes {
        let mut framed = BytesMut::with_capacity(4 + self.buf.len());
        framed.put_u32_le(self.buf.len() as u32);
        framed.put_slice(&self.buf);
        framed.freeze()
    }
}

/// A cursor over the body of a decoded message in a 32-bit-code dialect.
pub struct MessageReader {
    code: u32,
    body: Bytes,
    pos: usize,
}

impl MessageReader {
    /// Parses `frame` (the payload that followed the length prefix: code
    /// then body) into a reader positioned just after the code.
    pub fn from_frame(mut frame: Bytes) -> Result<Self> {
        if frame.len() < 4 {
            return Err(CodecError::Truncated);
        }
        let code = frame.split_to(4).get_u32_le();
        Ok(Self {
            code,
            body: frame,
            pos: 0,
        })
    }

    /// Returns the dialect-specific code of the message.
    pub fn read_code(&self) -> u32 {
        self.code
    }

    /// Fails unless the message's code matches `expected`.
    pub fn expect_code(&self, expected: u32) -> Result<()> {
        if self.code != expected {
            Err(CodecError::WrongCode {
                expected,
                got: self.code,
            })
        } else {
            Ok(())
        }
    }

    fn remaining(&self) -> &[u8] {
        &self.body[self.pos..]
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let bytes = self.remaining();
        if bytes.is_empty() {
            return Err(CodecError::Truncated);
        }
        let val = bytes[0];
        self.pos += 1;
        Ok(val)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.as_ref().try_into().unwrap()))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let bytes = self.read_bytes(8)?;
        Ok(i64::from_le_bytes(bytes.as_ref().try_into().unwrap()))
    }

    /// Reads exactly `n` bytes, returning a zero-copy slice of the body.
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        let bytes = self.remaining();
        if bytes.len() < n {
            return Err(CodecError::Truncated);
        }
        let slice = self.body.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(slice)
    }

    /// Reads a length-prefixed string.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(decode_string(&bytes))
    }

    /// Reads a reversed-network-order IPv4 address.
    pub fn read_ipv4(&mut self) -> Result<std::net::Ipv4Addr> {
        let bytes = self.read_bytes(4)?;
        Ok(std::net::Ipv4Addr::new(
            bytes[3], bytes[2], bytes[1], bytes[0],
        ))
    }

    /// Inflates the remaining (unread) tail of the body in place, resetting
    /// the cursor to its start.
    pub fn decompress(&mut self) -> Result<()> {
        let tail = inflate(self.remaining())?;
        self.body = Bytes::from(tail);
        self.pos = 0;
        Ok(())
    }

    /// Returns the number of unread bytes remaining in the body.
    pub fn peek_length(&self) -> usize {
        self.body.len() - self.pos
    }

    /// Repositions the cursor to an absolute byte offset within the body.
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos.min(self.body.len());
    }
}

/// A builder for the 8-bit-code initialization dialect
/// (`PeerInit`/`PierceFirewall`).
pub struct InitMessageBuilder {
    buf: BytesMut,
}

impl InitMessageBuilder {
    pub fn new(code: u8) -> Self {
        let mut buf = BytesMut::with_capacity(32);
        buf.put_u8(code);
        Self { buf }
    }

    pub fn write_u8(mut self, val: u8) -> Self {
        self.buf.put_u8(val);
        self
    }

    pub fn write_u32(mut self, val: u32) -> Self {
        self.buf.put_u32_le(val);
        self
    }

    pub fn write_string(mut self, val: &str) -> Self {
        self.buf.put_u32_le(val.len() as u32);
        self.buf.put_slice(val.as_bytes());
        self
    }

    pub fn finish(self) -> Bytes {
        let mut framed = BytesMut::with_capacity(4 + self.buf.len());
        framed.put_u32_le(self.buf.len() as u32);
        framed.put_slice(&self.buf);
        framed.freeze()
    }
}

/// A cursor over the body of a decoded initialization message.
pub struct InitMessageReader {
    code: u8,
    body: Bytes,
    pos: usize,
}

impl InitMessageReader {
    pub fn from_frame(mut frame: Bytes) -> Result<Self> {
        if frame.is_empty() {
            return Err(CodecError::Truncated);
        }
        let code = frame.split_to(1)[0];
        Ok(Self {
            code,
            body: frame,
            pos: 0,
        })
    }

    pub fn read_code(&self) -> u8 {
        self.code
    }

    fn remaining(&self) -> &[u8] {
        &self.body[self.pos..]
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let bytes = self.remaining();
        if bytes.is_empty() {
            return Err(CodecError::Truncated);
        }
        let val = bytes[0];
        self.pos += 1;
        Ok(val)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.as_ref().try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes> {
        let bytes = self.remaining();
        if bytes.len() < n {
            return Err(CodecError::Truncated);
        }
        let slice = self.body.slice(self.pos..self.pos + n);
        self.pos += n;
        Ok(slice)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(decode_string(&bytes))
    }
}

/// Parses the `u32_le length` frame prefix used by all four dialects,
/// returning the number of payload bytes that should follow.
pub fn peek_frame_length(prefix: &[u8]) -> Result<u32> {
    if prefix.len() < 4 {
        return Err(CodecError::Truncated);
    }
    Ok(u32::from_le_bytes(prefix[..4].try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_primitives() {
        let frame = MessageBuilder::new(42)
            .write_u8(7)
            .write_u32(0xdead_beef)
            .write_i64(-1)
            .write_string("hello")
            .write_ipv4(std::net::Ipv4Addr::new(127, 0, 0, 1))
            .finish();

        let len = peek_frame_length(&frame).unwrap();
        assert_eq!(len as usize, frame.len() - 4);

        let mut reader = MessageReader::from_frame(frame.slice(4..)).unwrap();
        assert_eq!(reader.read_code(), 42);
        assert_eq!(reader.read_u8().unwrap(), 7);
        assert_eq!(reader.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(reader.read_i64().unwrap(), -1);
        assert_eq!(reader.read_string().unwrap(), "hello");
        assert_eq!(
            reader.read_ipv4().unwrap(),
            std::net::Ipv4Addr::new(127, 0, 0, 1)
        );
        assert_eq!(reader.peek_length(), 0);
    }

    #[test]
    fn wrong_code_is_rejected() {
        let frame = MessageBuilder::new(1).finish();
        let reader = MessageReader::from_frame(frame.slice(4..)).unwrap();
        assert!(matches!(
            reader.expect_code(2),
            Err(CodecError::WrongCode {
                expected: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn truncated_body_is_rejected() {
        let frame = MessageBuilder::new(1).write_u32(5).finish();
        let mut reader = MessageReader::from_frame(frame.slice(4..)).unwrap();
        assert!(reader.read_i64().is_err());
    }

    #[test]
    fn compressed_body_round_trips() {
        let frame = MessageBuilder::new(5)
            .write_string("alpha")
            .write_string("beta")
            .compress()
            .finish();
        let mut reader = MessageReader::from_frame(frame.slice(4..)).unwrap();
        reader.decompress().unwrap();
        assert_eq!(reader.read_string().unwrap(), "alpha");
        assert_eq!(reader.read_string().unwrap(), "beta");
    }

    #[test]
    fn init_dialect_uses_single_byte_code() {
        let frame = InitMessageBuilder::new(1)
            .write_string("bob")
            .write_string("F")
            .write_u32(99)
            .finish();
        let mut reader = InitMessageReader::from_frame(frame.slice(4..)).unwrap();
        assert_eq!(reader.read_code(), 1);
        assert_eq!(reader.read_string().unwrap(), "bob");
        assert_eq!(reader.read_string().unwrap(), "F");
        assert_eq!(reader.read_u32().unwrap(), 99);
    }

    #[test]
    fn bad_encoding_falls_back_to_windows_1252() {
        // 0xE9 is not valid standalone UTF-8 but decodes to 'é' in cp1252.
        let frame = MessageBuilder::new(1).write_raw(&[1, 0, 0, 0, 0xE9]).finish();
        let mut reader = MessageReader::from_frame(frame.slice(4..)).unwrap();
        assert_eq!(reader.read_string().unwrap(), "é");
    }
}
