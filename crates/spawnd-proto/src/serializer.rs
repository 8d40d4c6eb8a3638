//! Datagram builder
//!
//! Accumulates one command payload plus the file descriptors to attach to
//! it. Used by the server for responses and by clients (and the tests) for
//! requests; the two directions differ only in their fd burst limit.

use crate::{
    ExecCommand, MAX_PAYLOAD, MAX_REQUEST_FDS, MAX_RESPONSE_FDS, PayloadTooLarge, RequestCommand,
    ResponseCommand,
};
use std::os::unix::io::RawFd;

pub struct Serializer {
    buf: Vec<u8>,
    fds: Vec<RawFd>,
    max_fds: usize,
}

impl Serializer {
    pub fn request(cmd: RequestCommand) -> Self {
        Self::with_tag(cmd as u8, MAX_REQUEST_FDS)
    }

    pub fn response(cmd: ResponseCommand) -> Self {
        Self::with_tag(cmd as u8, MAX_RESPONSE_FDS)
    }

    fn with_tag(tag: u8, max_fds: usize) -> Self {
        Self {
            buf: vec![tag],
            fds: Vec::new(),
            max_fds,
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), PayloadTooLarge> {
        if self.buf.len() + bytes.len() > MAX_PAYLOAD {
            return Err(PayloadTooLarge);
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<(), PayloadTooLarge> {
        self.write_bytes(&[value])
    }

    pub fn write_u16(&mut self, value: u16) -> Result<(), PayloadTooLarge> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<(), PayloadTooLarge> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), PayloadTooLarge> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), PayloadTooLarge> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Writes a string including its NUL terminator.
    pub fn write_str(&mut self, value: &str) -> Result<(), PayloadTooLarge> {
        debug_assert!(!value.as_bytes().contains(&0));
        self.write_bytes(value.as_bytes())?;
        self.write_u8(0)
    }

    pub fn write_command(&mut self, cmd: ExecCommand) -> Result<(), PayloadTooLarge> {
        self.write_u8(cmd as u8)
    }

    /// Writes the tag only when the flag is set.
    pub fn write_flag(&mut self, cmd: ExecCommand, value: bool) -> Result<(), PayloadTooLarge> {
        if value {
            self.write_command(cmd)?;
        }
        Ok(())
    }

    pub fn write_str_command(
        &mut self,
        cmd: ExecCommand,
        value: &str,
    ) -> Result<(), PayloadTooLarge> {
        self.write_command(cmd)?;
        self.write_str(value)
    }

    /// Writes the tag and queues the fd for the ancillary data.
    ///
    /// The serializer borrows the descriptor; it must stay open until the
    /// datagram has been sent.
    pub fn write_fd(&mut self, cmd: ExecCommand, fd: RawFd) -> Result<(), PayloadTooLarge> {
        if self.fds.len() == self.max_fds {
            return Err(PayloadTooLarge);
        }
        self.write_command(cmd)?;
        self.fds.push(fd);
        Ok(())
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf
    }

    pub fn fds(&self) -> &[RawFd] {
        &self.fds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Payload;

    #[test]
    fn test_tag_is_first_byte() {
        let s = Serializer::request(RequestCommand::Kill);
        assert_eq!(s.payload(), &[RequestCommand::Kill as u8]);
    }

    #[test]
    fn test_roundtrip_through_payload() {
        let mut s = Serializer::response(ResponseCommand::Exit);
        s.write_i32(7).unwrap();
        s.write_i32(0xff << 8).unwrap();

        let mut payload = Payload::new(s.payload());
        assert_eq!(payload.read_u8().unwrap(), ResponseCommand::Exit as u8);
        assert_eq!(payload.read_i32().unwrap(), 7);
        assert_eq!(payload.read_i32().unwrap(), 0xff << 8);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_string_roundtrip() {
        let mut s = Serializer::request(RequestCommand::Exec);
        s.write_str_command(ExecCommand::Arg, "/bin/true").unwrap();

        let mut payload = Payload::new(s.payload());
        payload.read_u8().unwrap();
        assert_eq!(payload.read_u8().unwrap(), ExecCommand::Arg as u8);
        assert_eq!(payload.read_str().unwrap(), "/bin/true");
    }

    #[test]
    fn test_flag_written_only_when_set() {
        let mut s = Serializer::request(RequestCommand::Exec);
        s.write_flag(ExecCommand::Tty, false).unwrap();
        assert_eq!(s.payload().len(), 1);
        s.write_flag(ExecCommand::Tty, true).unwrap();
        assert_eq!(s.payload().len(), 2);
    }

    #[test]
    fn test_payload_capacity_is_enforced() {
        let mut s = Serializer::request(RequestCommand::Exec);
        let chunk = [0x41u8; 4096];
        let mut result = Ok(());
        for _ in 0..=MAX_PAYLOAD / chunk.len() {
            result = s.write_bytes(&chunk);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(PayloadTooLarge));
        assert!(s.payload().len() <= MAX_PAYLOAD);
    }

    #[test]
    fn test_response_fd_limit() {
        let mut s = Serializer::response(ResponseCommand::Exit);
        for fd in 0..MAX_RESPONSE_FDS {
            s.write_fd(ExecCommand::Stdin, fd as RawFd).unwrap();
        }
        assert_eq!(
            s.write_fd(ExecCommand::Stdin, 99),
            Err(PayloadTooLarge)
        );
    }
}
