//! Datagram transport with SCM_RIGHTS fd passing

use crate::fdlist::ReceivedFdList;
use crate::MAX_REQUEST_FDS;
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, BorrowedFd, RawFd};

/// Sends one datagram, attaching `fds` as SCM_RIGHTS ancillary data.
///
/// MSG_NOSIGNAL: a vanished peer surfaces as EPIPE, not as a signal.
pub fn send_with_fds(fd: BorrowedFd<'_>, payload: &[u8], fds: &[RawFd]) -> nix::Result<usize> {
    let iov = [IoSlice::new(payload)];
    let cmsgs = if fds.is_empty() {
        Vec::new()
    } else {
        vec![ControlMessage::ScmRights(fds)]
    };
    sendmsg::<()>(fd.as_raw_fd(), &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None)
}

/// Receives one datagram without blocking.
///
/// Received descriptors get close-on-exec before they become visible to the
/// process, and are owned by the returned list.
pub fn recv_with_fds(
    fd: BorrowedFd<'_>,
    buf: &mut [u8],
) -> nix::Result<(usize, ReceivedFdList)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_REQUEST_FDS]);
    let msg = recvmsg::<()>(
        fd.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    let mut raw = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            raw.extend(fds);
        }
    }
    let nbytes = msg.bytes;
    Ok((nbytes, unsafe { ReceivedFdList::from_raw(raw) }))
}
