//! Bounds-checked primitives for the Frontend↔Worker wire format.
//!
//! All integers are little-endian. Strings and byte blobs are a `u32` length
//! followed by that many bytes; every length read from the wire is checked
//! against a caller-supplied maximum and the remaining input before anything
//! is allocated.

use super::CodecError;

/// Append-only encoder.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    /// Write a length-prefixed blob, refusing anything above `max`.
    pub fn put_bytes(&mut self, what: &'static str, v: &[u8], max: usize) -> Result<(), CodecError> {
        if v.len() > max {
            return Err(CodecError::LengthExceeded {
                what,
                len: v.len(),
                max,
            });
        }
        self.put_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
        Ok(())
    }

    pub fn put_str(&mut self, what: &'static str, v: &str, max: usize) -> Result<(), CodecError> {
        self.put_bytes(what, v.as_bytes(), max)
    }

    /// Write a count, refusing anything above `max`.
    pub fn put_count(&mut self, what: &'static str, count: usize, max: usize) -> Result<(), CodecError> {
        if count > max {
            return Err(CodecError::CountExceeded { what, count, max });
        }
        self.put_u32(count as u32);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Reader over a complete, already length-checked frame.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    /// Read a length-prefixed blob of at most `max` bytes.
    pub fn get_bytes(&mut self, what: &'static str, max: usize) -> Result<&'a [u8], CodecError> {
        let len = self.get_u32()? as usize;
        if len > max {
            return Err(CodecError::LengthExceeded { what, len, max });
        }
        self.take(len)
    }

    pub fn get_str(&mut self, what: &'static str, max: usize) -> Result<&'a str, CodecError> {
        let bytes = self.get_bytes(what, max)?;
        std::str::from_utf8(bytes).map_err(|_| CodecError::Utf8(what))
    }

    /// Read an element count of at most `max`, each element occupying at
    /// least `min_elem` bytes of the remaining input.
    pub fn get_count(&mut self, what: &'static str, max: usize, min_elem: usize) -> Result<usize, CodecError> {
        let count = self.get_u32()? as usize;
        if count > max {
            return Err(CodecError::CountExceeded { what, count, max });
        }
        if count.saturating_mul(min_elem) > self.remaining() {
            return Err(CodecError::Truncated);
        }
        Ok(count)
    }

    /// Fail unless every byte has been consumed.
    pub fn finish(self) -> Result<(), CodecError> {
        if self.remaining() != 0 {
            return Err(CodecError::TrailingBytes(self.remaining()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_checked_before_read() {
        let mut enc = Encoder::new();
        enc.put_u32(u32::MAX);
        let buf = enc.into_inner();
        let mut dec = Decoder::new(&buf);
        assert!(matches!(
            dec.get_bytes("value", 1024),
            Err(CodecError::LengthExceeded { len, .. }) if len == u32::MAX as usize
        ));
    }

    #[test]
    fn count_must_fit_remaining_input() {
        let mut enc = Encoder::new();
        enc.put_u32(10);
        let buf = enc.into_inner();
        let mut dec = Decoder::new(&buf);
        assert!(matches!(dec.get_count("args", 100, 4), Err(CodecError::Truncated)));
    }

    #[test]
    fn encoder_refuses_oversize() {
        let mut enc = Encoder::new();
        assert!(enc.put_str("key", "abcd", 3).is_err());
        assert!(enc.put_count("langs", 5, 4).is_err());
        assert!(enc.is_empty());
    }
}
