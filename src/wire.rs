//! Length-prefixed binary framing for the sealed-box envelope
//!
//! Byte strings carry an unsigned big-endian 32-bit length prefix, the
//! framing used by SSH wire blobs.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::error::{Error, Result};

pub(crate) struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        WireWriter { buf: Vec::new() }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        // writing to a Vec cannot fail
        self.buf.write_u32::<BigEndian>(v).unwrap();
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
    }

    pub fn put_str(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }

    /// Multiple-precision integer: minimal big-endian with a leading
    /// zero byte when the high bit is set.
    pub fn put_mpint(&mut self, n: &[u8]) {
        let mut i = 0;
        while i < n.len() && n[i] == 0 {
            i += 1;
        }
        let n = &n[i..];
        if n.is_empty() {
            self.put_u32(0);
        } else if n[0] & 0x80 != 0 {
            self.put_u32(n.len() as u32 + 1);
            self.buf.push(0);
            self.buf.extend_from_slice(n);
        } else {
            self.put_bytes(n);
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        WireReader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Error::Invalid("truncated envelope".into()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    pub fn get_str(&mut self) -> Result<String> {
        let raw = self.get_bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| Error::Invalid("envelope string is not UTF-8".into()))
    }

    pub fn get_mpint(&mut self) -> Result<&'a [u8]> {
        let raw = self.get_bytes()?;
        Ok(raw.strip_prefix(&[0u8][..]).unwrap_or(raw))
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }
}
