//! One control connection and its datagram handling
//!
//! A connection owns its socket and the request-id bookkeeping for the
//! children it spawned. Decoding failures drop the datagram and keep the
//! connection alive; the peer is privileged already, so a bad frame means a
//! buggy client, not an attack.

use crate::hook::SpawnHook;
use crate::namespace::BindMount;
use crate::prepared::PreparedChild;
use crate::registry::{ChildProcessRegistry, ConnectionId, ExitListener};
use crate::spawn;
use log::{debug, error, warn};
use nix::poll::{PollFd, PollFlags, ppoll};
use nix::sys::signal::{SigSet, Signal};
use nix::sys::time::TimeSpec;
use spawnd_cgroup::CgroupState;
use spawnd_core::{RlimitValue, SpawnConfig, UidGid};
use spawnd_proto as proto;
use spawnd_proto::{
    ExecCommand, MalformedPayload, Payload, ReceivedFdList, RequestCommand, ResponseCommand,
    Serializer,
};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;
use std::time::Duration;

/// Exit pseudo-status reported when a request never reached the fork:
/// exit code 0xff, no signal.
pub const SPAWN_FAILED_STATUS: i32 = 0xff << 8;

/// How long to wait for room in a clogged client datagram queue.
const SEND_RETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// What the server loop should do after a datagram was handled.
pub enum ReadOutcome {
    /// Keep the connection registered.
    Continue,
    /// Peer vanished or is unusable; tear the connection down.
    Closed,
    /// CONNECT adopted a new control socket.
    NewConnection(OwnedFd),
}

pub struct Connection {
    id: ConnectionId,
    socket: OwnedFd,
    /// Children owned by this connection, request id to pid.
    children: BTreeMap<i32, nix::unistd::Pid>,
}

impl Connection {
    pub fn new(id: ConnectionId, socket: OwnedFd) -> Self {
        Self {
            id,
            socket,
            children: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn socket(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }

    /// Receives and handles one datagram.
    pub fn handle_readable(
        &mut self,
        registry: &mut ChildProcessRegistry,
        config: &SpawnConfig,
        cgroup_state: &CgroupState,
        hook: Option<&dyn SpawnHook>,
    ) -> ReadOutcome {
        let mut buf = [0u8; proto::MAX_PAYLOAD];
        let (nbytes, fds) = match proto::recv_with_fds(self.socket.as_fd(), &mut buf) {
            Ok((0, _)) => return ReadOutcome::Closed,
            Ok(received) => received,
            Err(nix::errno::Errno::EAGAIN) => return ReadOutcome::Continue,
            Err(e) => {
                warn!("recvmsg() failed: {}", e);
                return ReadOutcome::Closed;
            }
        };

        match self.handle_message(&buf[..nbytes], fds, registry, config, cgroup_state, hook) {
            Ok(outcome) => outcome,
            Err(MalformedPayload) => {
                warn!("Malformed spawn payload from connection {}", self.id);
                ReadOutcome::Continue
            }
        }
    }

    fn handle_message(
        &mut self,
        data: &[u8],
        mut fds: ReceivedFdList,
        registry: &mut ChildProcessRegistry,
        config: &SpawnConfig,
        cgroup_state: &CgroupState,
        hook: Option<&dyn SpawnHook>,
    ) -> Result<ReadOutcome, MalformedPayload> {
        let mut payload = Payload::new(data);
        match RequestCommand::try_from(payload.read_u8()?)? {
            RequestCommand::Connect => {
                if !payload.is_empty() || fds.len() != 1 {
                    return Err(MalformedPayload);
                }
                Ok(ReadOutcome::NewConnection(fds.next()?))
            }
            RequestCommand::Exec => {
                let id = payload.read_i32()?;
                let name = payload.read_str()?.to_string();
                let prepared = decode_exec(&mut payload, &mut fds)?;
                Ok(self.spawn_child(id, &name, prepared, registry, config, cgroup_state, hook))
            }
            RequestCommand::Kill => {
                let (id, signo) = decode_kill(&mut payload, &fds)?;
                self.handle_kill(id, signo, registry)?;
                Ok(ReadOutcome::Continue)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_child(
        &mut self,
        id: i32,
        name: &str,
        mut prepared: PreparedChild,
        registry: &mut ChildProcessRegistry,
        config: &SpawnConfig,
        cgroup_state: &CgroupState,
        hook: Option<&dyn SpawnHook>,
    ) -> ReadOutcome {
        // resolve the effective identity before any policy check
        if prepared.uid_gid.is_empty() {
            if config.default_uid_gid.is_empty() {
                warn!("No uid/gid specified for child {}", name);
                return self.send_exit(id, SPAWN_FAILED_STATUS);
            }
            prepared.uid_gid = config.default_uid_gid.clone();
        }

        let allowed = match hook {
            Some(hook) => hook.verify(&prepared),
            None => match config.verify(&prepared.uid_gid) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Rejecting child {}: {}", name, e);
                    false
                }
            },
        };
        if !allowed {
            return self.send_exit(id, SPAWN_FAILED_STATUS);
        }

        let pid = match spawn::spawn_child(&mut prepared, cgroup_state) {
            Ok(pid) => pid,
            Err(e) => {
                error!("Failed to spawn child process {}: {}", name, e);
                return self.send_exit(id, SPAWN_FAILED_STATUS);
            }
        };

        self.children.insert(id, pid);
        registry.add(
            pid,
            name,
            ExitListener {
                connection: self.id,
                id,
            },
        );
        debug!("Spawned child {} (pid {}) for request {}", name, pid, id);
        ReadOutcome::Continue
        // prepared drops here, closing the parent's copies of the stdio fds
    }

    fn handle_kill(
        &mut self,
        id: i32,
        signo: i32,
        registry: &mut ChildProcessRegistry,
    ) -> Result<(), MalformedPayload> {
        let signal = Signal::try_from(signo).map_err(|_| MalformedPayload)?;
        // an id nobody owns is a no-op, the child may simply be gone already
        if let Some(&pid) = self.children.get(&id) {
            registry.kill_signal(pid, signal);
        }
        Ok(())
    }

    /// Sends an EXIT frame for a request id.
    ///
    /// The client may be busy while its datagram queue has filled; in that
    /// case wait for room once, with every signal masked so the next SIGCHLD
    /// cannot cut the wait short.
    pub fn send_exit(&mut self, id: i32, status: i32) -> ReadOutcome {
        let mut serializer = Serializer::response(ResponseCommand::Exit);
        serializer.write_i32(id).expect("EXIT frame fits");
        serializer.write_i32(status).expect("EXIT frame fits");

        match proto::send_with_fds(self.socket.as_fd(), serializer.payload(), &[]) {
            Ok(_) => ReadOutcome::Continue,
            Err(nix::errno::Errno::EAGAIN) => {
                let mut pollfd = [PollFd::new(self.socket.as_fd(), PollFlags::POLLOUT)];
                let timeout = TimeSpec::from_duration(SEND_RETRY_TIMEOUT);
                let ready = ppoll(&mut pollfd, Some(timeout), Some(SigSet::all()));
                if matches!(ready, Ok(n) if n > 0)
                    && proto::send_with_fds(self.socket.as_fd(), serializer.payload(), &[]).is_ok()
                {
                    return ReadOutcome::Continue;
                }
                warn!("Failed to send EXIT to connection {}", self.id);
                ReadOutcome::Closed
            }
            Err(e) => {
                warn!("Failed to send EXIT to connection {}: {}", self.id, e);
                ReadOutcome::Closed
            }
        }
    }

    /// Removes the request-id bookkeeping once its exit was delivered.
    pub fn forget_child(&mut self, id: i32) {
        self.children.remove(&id);
    }

    /// Terminates every child this connection still owns.
    ///
    /// The registry keeps tracking the pids so the eventual SIGCHLD is still
    /// reaped; the EXIT frames are discarded because their listener is gone.
    pub fn teardown(&mut self, registry: &mut ChildProcessRegistry) {
        for (&id, &pid) in &self.children {
            debug!(
                "Connection {} vanished, terminating child of request {} (pid {})",
                self.id, id, pid
            );
            registry.set_exit_listener(pid, None);
            registry.kill(pid);
        }
        self.children.clear();
    }
}

fn decode_kill(payload: &mut Payload, fds: &ReceivedFdList) -> Result<(i32, i32), MalformedPayload> {
    if !fds.is_empty() {
        return Err(MalformedPayload);
    }
    let id = payload.read_i32()?;
    let signo = payload.read_i32()?;
    if !payload.is_empty() {
        return Err(MalformedPayload);
    }
    Ok((id, signo))
}

/// Decodes the sub-command stream of an EXEC datagram into a request.
///
/// On error the caller drops `fds`, closing whatever was not claimed yet.
pub fn decode_exec(
    payload: &mut Payload,
    fds: &mut ReceivedFdList,
) -> Result<PreparedChild, MalformedPayload> {
    let mut p = PreparedChild::default();

    while !payload.is_empty() {
        match ExecCommand::try_from(payload.read_u8()?)? {
            ExecCommand::Arg => p.append_arg(payload.read_str()?)?,
            ExecCommand::SetEnv => p.put_env(payload.read_str()?)?,
            ExecCommand::Umask => p.umask = Some(payload.read_u16()?),
            ExecCommand::Stdin => p.stdin = Some(fds.next()?),
            ExecCommand::Stdout => p.stdout = Some(fds.next()?),
            ExecCommand::Stderr => p.stderr = Some(fds.next()?),
            ExecCommand::Control => p.control = Some(fds.next()?),
            ExecCommand::StderrPath => p.stderr_path = Some(PathBuf::from(payload.read_str()?)),
            ExecCommand::StderrNull => p.stderr_null = true,
            ExecCommand::Tty => p.tty = true,
            ExecCommand::Refence => p.refence = Some(payload.read_str()?.to_string()),
            ExecCommand::UserNs => p.ns.enable_user = true,
            ExecCommand::PidNs => p.ns.enable_pid = true,
            ExecCommand::NetworkNs => p.ns.enable_network = true,
            ExecCommand::NetworkNsName => {
                p.ns.network_namespace = Some(payload.read_str()?.to_string());
            }
            ExecCommand::IpcNs => p.ns.enable_ipc = true,
            ExecCommand::MountNs => p.ns.enable_mount = true,
            ExecCommand::MountProc => p.ns.mount_proc = true,
            ExecCommand::WritableProc => p.ns.writable_proc = true,
            ExecCommand::PivotRoot => {
                p.ns.pivot_root = Some(PathBuf::from(payload.read_str()?));
            }
            ExecCommand::MountHome => {
                p.ns.mount_home = Some(PathBuf::from(payload.read_str()?));
                p.ns.home = Some(PathBuf::from(payload.read_str()?));
            }
            ExecCommand::MountTmpTmpfs => {
                p.ns.mount_tmp_tmpfs = Some(payload.read_str()?.to_string());
            }
            ExecCommand::MountTmpfs => {
                p.ns.mount_tmpfs = Some(payload.read_str()?.to_string());
            }
            ExecCommand::BindMount => {
                let source = PathBuf::from(payload.read_str()?);
                let target = PathBuf::from(payload.read_str()?);
                let writable = payload.read_u8()? != 0;
                let exec = payload.read_u8()? != 0;
                p.ns.bind_mounts.push(BindMount {
                    source,
                    target,
                    writable,
                    exec,
                });
            }
            ExecCommand::Hostname => p.ns.hostname = Some(payload.read_str()?.to_string()),
            ExecCommand::Rlimit => {
                let resource = payload.read_u8()? as usize;
                let value = RlimitValue {
                    cur: payload.read_u64()?,
                    max: payload.read_u64()?,
                };
                p.rlimits.set(resource, value).map_err(|_| MalformedPayload)?;
            }
            ExecCommand::UidGid => p.uid_gid = decode_uid_gid(payload)?,
            ExecCommand::SchedIdle => p.sched_idle = true,
            ExecCommand::IoprioIdle => p.ioprio_idle = true,
            ExecCommand::ForbidUserNs => p.forbid_user_ns = true,
            ExecCommand::ForbidMulticast => p.forbid_multicast = true,
            ExecCommand::ForbidBind => p.forbid_bind = true,
            ExecCommand::NoNewPrivs => p.no_new_privs = true,
            ExecCommand::Cgroup => p.cgroup.name = Some(payload.read_str()?.to_string()),
            ExecCommand::CgroupSet => {
                let key = payload.read_str()?.to_string();
                let value = payload.read_str()?.to_string();
                p.cgroup.set.push((key, value));
            }
            ExecCommand::Priority => p.priority = payload.read_i32()?,
            ExecCommand::Chroot => p.chroot = Some(PathBuf::from(payload.read_str()?)),
            ExecCommand::Chdir => p.chdir = Some(PathBuf::from(payload.read_str()?)),
            ExecCommand::HookInfo => p.hook_info = Some(payload.read_str()?.to_string()),
        }
    }

    // resolved before the fork, like a client-side descriptor would be; an
    // unopenable /dev/null just leaves stderr inherited
    if p.stderr.is_none() && p.stderr_null {
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_CLOEXEC | libc::O_NOCTTY)
            .open("/dev/null");
        if let Ok(file) = file {
            p.stderr = Some(file.into());
        }
    }

    Ok(p)
}

fn decode_uid_gid(payload: &mut Payload) -> Result<UidGid, MalformedPayload> {
    let uid = payload.read_u32()?;
    let gid = payload.read_u32()?;
    let n_groups = payload.read_u8()? as usize;
    if n_groups > spawnd_core::MAX_GROUPS {
        return Err(MalformedPayload);
    }
    let mut groups = Vec::with_capacity(n_groups);
    for _ in 0..n_groups {
        groups.push(payload.read_u32()?);
    }
    Ok(UidGid { uid, gid, groups })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

    fn decode(serializer: &Serializer, fds: Vec<RawFd>) -> Result<PreparedChild, MalformedPayload> {
        // skip the request tag like the dispatcher does
        let mut payload = Payload::new(&serializer.payload()[1..]);
        let mut fds = unsafe { ReceivedFdList::from_raw(fds) };
        decode_exec(&mut payload, &mut fds)
    }

    #[test]
    fn test_decode_full_request_roundtrip() {
        let mut s = Serializer::request(RequestCommand::Exec);
        s.write_str_command(ExecCommand::Arg, "/usr/bin/env").unwrap();
        s.write_str_command(ExecCommand::Arg, "-i").unwrap();
        s.write_str_command(ExecCommand::SetEnv, "PATH=/usr/bin").unwrap();
        s.write_command(ExecCommand::Umask).unwrap();
        s.write_u16(0o027).unwrap();
        s.write_flag(ExecCommand::Tty, true).unwrap();
        s.write_flag(ExecCommand::UserNs, true).unwrap();
        s.write_flag(ExecCommand::PidNs, true).unwrap();
        s.write_flag(ExecCommand::MountNs, true).unwrap();
        s.write_str_command(ExecCommand::NetworkNsName, "lab").unwrap();
        s.write_str_command(ExecCommand::PivotRoot, "/srv/jail").unwrap();
        s.write_command(ExecCommand::MountHome).unwrap();
        s.write_str("/home/alice").unwrap();
        s.write_str("/home/me").unwrap();
        s.write_str_command(ExecCommand::MountTmpTmpfs, "size=16m").unwrap();
        s.write_command(ExecCommand::BindMount).unwrap();
        s.write_str("/data").unwrap();
        s.write_str("/sandbox/data").unwrap();
        s.write_u8(1).unwrap();
        s.write_u8(0).unwrap();
        s.write_str_command(ExecCommand::Hostname, "jail").unwrap();
        s.write_command(ExecCommand::Rlimit).unwrap();
        s.write_u8(7).unwrap();
        s.write_u64(1024).unwrap();
        s.write_u64(4096).unwrap();
        s.write_command(ExecCommand::UidGid).unwrap();
        s.write_u32(1000).unwrap();
        s.write_u32(1000).unwrap();
        s.write_u8(2).unwrap();
        s.write_u32(33).unwrap();
        s.write_u32(44).unwrap();
        s.write_flag(ExecCommand::SchedIdle, true).unwrap();
        s.write_flag(ExecCommand::ForbidUserNs, true).unwrap();
        s.write_flag(ExecCommand::NoNewPrivs, true).unwrap();
        s.write_str_command(ExecCommand::Cgroup, "workers").unwrap();
        s.write_command(ExecCommand::CgroupSet).unwrap();
        s.write_str("memory.limit_in_bytes").unwrap();
        s.write_str("67108864").unwrap();
        s.write_command(ExecCommand::Priority).unwrap();
        s.write_i32(10).unwrap();
        s.write_str_command(ExecCommand::Chdir, "/work").unwrap();
        s.write_str_command(ExecCommand::Refence, "tag").unwrap();
        s.write_str_command(ExecCommand::HookInfo, "hint").unwrap();

        let p = decode(&s, Vec::new()).unwrap();
        assert_eq!(p.args.len(), 2);
        assert_eq!(p.program().unwrap().to_str().unwrap(), "/usr/bin/env");
        assert_eq!(p.env.len(), 1);
        assert_eq!(p.umask, Some(0o027));
        assert!(p.tty);
        assert!(p.ns.enable_user && p.ns.enable_pid && p.ns.enable_mount);
        assert!(!p.ns.enable_ipc);
        assert_eq!(p.ns.network_namespace.as_deref(), Some("lab"));
        assert_eq!(p.ns.pivot_root.as_deref(), Some(std::path::Path::new("/srv/jail")));
        assert_eq!(p.ns.mount_home.as_deref(), Some(std::path::Path::new("/home/alice")));
        assert_eq!(p.ns.home.as_deref(), Some(std::path::Path::new("/home/me")));
        assert_eq!(p.ns.mount_tmp_tmpfs.as_deref(), Some("size=16m"));
        assert_eq!(p.ns.bind_mounts.len(), 1);
        assert!(p.ns.bind_mounts[0].writable && !p.ns.bind_mounts[0].exec);
        assert_eq!(p.ns.hostname.as_deref(), Some("jail"));
        assert_eq!(p.rlimits.get(7), Some(RlimitValue { cur: 1024, max: 4096 }));
        assert_eq!(p.uid_gid.uid, 1000);
        assert_eq!(p.uid_gid.groups, vec![33, 44]);
        assert!(p.sched_idle && !p.ioprio_idle);
        assert!(p.forbid_user_ns && !p.forbid_multicast);
        assert!(p.no_new_privs);
        assert_eq!(p.cgroup.name.as_deref(), Some("workers"));
        assert_eq!(p.cgroup.set.len(), 1);
        assert_eq!(p.priority, 10);
        assert_eq!(p.chdir.as_deref(), Some(std::path::Path::new("/work")));
        assert_eq!(p.refence.as_deref(), Some("tag"));
        assert_eq!(p.hook_info.as_deref(), Some("hint"));
    }

    #[test]
    fn test_decode_consumes_fds_in_order() {
        let (read, write) = nix::unistd::pipe().unwrap();
        let read_raw = read.into_raw_fd();
        let write_raw = write.into_raw_fd();

        let mut s = Serializer::request(RequestCommand::Exec);
        s.write_str_command(ExecCommand::Arg, "/bin/cat").unwrap();
        s.write_fd(ExecCommand::Stdin, read_raw).unwrap();
        s.write_fd(ExecCommand::Stdout, write_raw).unwrap();

        let p = decode(&s, vec![read_raw, write_raw]).unwrap();
        assert_eq!(p.stdin.as_ref().unwrap().as_raw_fd(), read_raw);
        assert_eq!(p.stdout.as_ref().unwrap().as_raw_fd(), write_raw);
    }

    #[test]
    fn test_decode_missing_fd_is_malformed() {
        let mut s = Serializer::request(RequestCommand::Exec);
        s.write_command(ExecCommand::Stdin).unwrap();
        assert_eq!(decode(&s, Vec::new()).unwrap_err(), MalformedPayload);
    }

    #[test]
    fn test_decode_failure_closes_unclaimed_fds() {
        let (read, write) = nix::unistd::pipe().unwrap();
        let read_raw = read.into_raw_fd();
        let write_raw = write.into_raw_fd();

        let mut s = Serializer::request(RequestCommand::Exec);
        s.write_fd(ExecCommand::Stdin, read_raw).unwrap();
        s.write_u8(0xff).unwrap(); // unknown sub-command tag

        assert!(decode(&s, vec![read_raw, write_raw]).is_err());
        // both descriptors must be gone: one claimed and dropped with the
        // half-built request, one closed by the fd list
        assert_eq!(unsafe { libc::fcntl(read_raw, libc::F_GETFD) }, -1);
        assert_eq!(unsafe { libc::fcntl(write_raw, libc::F_GETFD) }, -1);
    }

    #[test]
    fn test_decode_unknown_tag_is_malformed() {
        let mut s = Serializer::request(RequestCommand::Exec);
        s.write_u8(39).unwrap();
        assert_eq!(decode(&s, Vec::new()).unwrap_err(), MalformedPayload);
    }

    #[test]
    fn test_decode_overlong_group_count_is_malformed() {
        let mut s = Serializer::request(RequestCommand::Exec);
        s.write_command(ExecCommand::UidGid).unwrap();
        s.write_u32(1000).unwrap();
        s.write_u32(1000).unwrap();
        s.write_u8(33).unwrap(); // one past the limit
        for _ in 0..33 {
            s.write_u32(1).unwrap();
        }
        assert_eq!(decode(&s, Vec::new()).unwrap_err(), MalformedPayload);
    }

    #[test]
    fn test_decode_rlimit_index_out_of_range_is_malformed() {
        let mut s = Serializer::request(RequestCommand::Exec);
        s.write_command(ExecCommand::Rlimit).unwrap();
        s.write_u8(16).unwrap();
        s.write_u64(0).unwrap();
        s.write_u64(0).unwrap();
        assert_eq!(decode(&s, Vec::new()).unwrap_err(), MalformedPayload);
    }

    #[test]
    fn test_decode_kill_frame() {
        let mut s = Serializer::request(RequestCommand::Kill);
        s.write_i32(7).unwrap();
        s.write_i32(libc::SIGTERM).unwrap();

        let mut payload = Payload::new(&s.payload()[1..]);
        let fds = ReceivedFdList::default();
        assert_eq!(decode_kill(&mut payload, &fds).unwrap(), (7, libc::SIGTERM));
    }

    #[test]
    fn test_decode_kill_with_trailing_bytes_is_malformed() {
        let mut s = Serializer::request(RequestCommand::Kill);
        s.write_i32(7).unwrap();
        s.write_i32(libc::SIGTERM).unwrap();
        s.write_u8(0).unwrap();

        let mut payload = Payload::new(&s.payload()[1..]);
        let fds = ReceivedFdList::default();
        assert!(decode_kill(&mut payload, &fds).is_err());
    }
}
