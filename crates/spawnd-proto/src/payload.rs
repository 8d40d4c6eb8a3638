//! Read cursor over a received datagram payload
//!
//! All multi-byte integers are little-endian; strings are NUL-terminated
//! UTF-8. Reading past the end of the payload is a decoding error, never a
//! panic.

use crate::MalformedPayload;

pub struct Payload<'a> {
    data: &'a [u8],
}

impl<'a> Payload<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], MalformedPayload> {
        if self.data.len() < n {
            return Err(MalformedPayload);
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    pub fn read_u8(&mut self) -> Result<u8, MalformedPayload> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, MalformedPayload> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, MalformedPayload> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, MalformedPayload> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, MalformedPayload> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Reads a NUL-terminated string, consuming the terminator.
    pub fn read_str(&mut self) -> Result<&'a str, MalformedPayload> {
        let nul = self
            .data
            .iter()
            .position(|&b| b == 0)
            .ok_or(MalformedPayload)?;
        let raw = &self.data[..nul];
        self.data = &self.data[nul + 1..];
        std::str::from_utf8(raw).map_err(|_| MalformedPayload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_integers() {
        let data = [0x07, 0x34, 0x12, 0xff, 0xff, 0xff, 0xff];
        let mut payload = Payload::new(&data);
        assert_eq!(payload.read_u8().unwrap(), 7);
        assert_eq!(payload.read_u16().unwrap(), 0x1234);
        assert_eq!(payload.read_i32().unwrap(), -1);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_read_u64() {
        let data = 0xdead_beef_u64.to_le_bytes();
        let mut payload = Payload::new(&data);
        assert_eq!(payload.read_u64().unwrap(), 0xdead_beef);
    }

    #[test]
    fn test_read_str() {
        let data = b"hello\0world\0";
        let mut payload = Payload::new(data);
        assert_eq!(payload.read_str().unwrap(), "hello");
        assert_eq!(payload.read_str().unwrap(), "world");
        assert!(payload.is_empty());
    }

    #[test]
    fn test_truncated_read_is_malformed() {
        let mut payload = Payload::new(&[0x01, 0x02]);
        assert_eq!(payload.read_i32(), Err(MalformedPayload));
    }

    #[test]
    fn test_unterminated_string_is_malformed() {
        let mut payload = Payload::new(b"no terminator");
        assert_eq!(payload.read_str(), Err(MalformedPayload));
    }

    #[test]
    fn test_invalid_utf8_is_malformed() {
        let mut payload = Payload::new(&[0xc3, 0x28, 0x00]);
        assert_eq!(payload.read_str(), Err(MalformedPayload));
    }
}
