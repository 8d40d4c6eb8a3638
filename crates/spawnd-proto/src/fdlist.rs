//! Ownership of file descriptors received with a datagram

use crate::MalformedPayload;
use std::collections::VecDeque;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

/// The file descriptors attached to one received datagram.
///
/// Sub-commands consume descriptors front to back; whatever the decoder does
/// not claim is closed when the list is dropped, so a half-decoded datagram
/// cannot leak.
#[derive(Debug, Default)]
pub struct ReceivedFdList {
    fds: VecDeque<OwnedFd>,
}

impl ReceivedFdList {
    /// Takes ownership of raw descriptors produced by recvmsg.
    ///
    /// # Safety
    ///
    /// The descriptors must be open and not owned elsewhere.
    pub unsafe fn from_raw(raw: Vec<RawFd>) -> Self {
        Self {
            fds: raw
                .into_iter()
                .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Claims the next attached descriptor.
    ///
    /// Asking for more descriptors than the datagram carried is a decoding
    /// error.
    pub fn next(&mut self) -> Result<OwnedFd, MalformedPayload> {
        self.fds.pop_front().ok_or(MalformedPayload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::{AsRawFd, IntoRawFd};

    fn raw_pipe() -> (RawFd, RawFd) {
        let (read, write) = nix::unistd::pipe().unwrap();
        (read.into_raw_fd(), write.into_raw_fd())
    }

    fn is_open(fd: RawFd) -> bool {
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }

    #[test]
    fn test_fds_pop_in_order() {
        let (read, write) = raw_pipe();
        let mut list = unsafe { ReceivedFdList::from_raw(vec![read, write]) };
        assert_eq!(list.len(), 2);
        assert_eq!(list.next().unwrap().as_raw_fd(), read);
        assert_eq!(list.next().unwrap().as_raw_fd(), write);
        assert_eq!(list.next().unwrap_err(), MalformedPayload);
    }

    #[test]
    fn test_unclaimed_fds_close_on_drop() {
        let (read, write) = raw_pipe();
        {
            let mut list = unsafe { ReceivedFdList::from_raw(vec![read, write]) };
            drop(list.next().unwrap());
        }
        assert!(!is_open(read));
        assert!(!is_open(write));
    }
}
