//! Multiplexer for SIGCHLD
//!
//! All children the server creates are tracked here, keyed by pid. SIGCHLD
//! is blocked and routed through a signalfd that the event loop polls; the
//! reap loop then drains every pending zombie with one wait4(2) sweep and
//! reports whom to notify.

use log::{debug, warn};
use nix::sys::signal::{SigSet, Signal, SigmaskHow, kill, sigprocmask};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::unistd::Pid;
use spawnd_core::{Result, SpawnError};
use std::collections::BTreeMap;
use std::os::unix::io::{AsFd, BorrowedFd};
use std::time::{Duration, Instant};

/// Time a child gets to react to SIGTERM/SIGKILL before escalation.
pub const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Identifies the connection a child belongs to.
pub type ConnectionId = u64;

/// Routing token for an exit notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitListener {
    pub connection: ConnectionId,
    /// The client-chosen request id.
    pub id: i32,
}

/// A reaped child together with the listener to notify.
#[derive(Debug)]
pub struct ReapedChild {
    pub pid: Pid,
    pub name: String,
    /// Raw wait status word.
    pub status: i32,
    /// None when the owning connection went away first.
    pub listener: Option<ExitListener>,
}

struct ManagedChild {
    name: String,
    start_time: Instant,
    listener: Option<ExitListener>,
    /// Armed by kill(); escalates to SIGKILL when it expires.
    kill_deadline: Option<Instant>,
}

pub struct ChildProcessRegistry {
    children: BTreeMap<libc::pid_t, ManagedChild>,
    /// Present while SIGCHLD handling is armed; released once the registry
    /// is volatile and empty.
    signal_fd: Option<SignalFd>,
    volatile_exit: bool,
}

impl ChildProcessRegistry {
    /// Blocks SIGCHLD and opens the signalfd that stands in for its handler.
    pub fn new() -> Result<Self> {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        sigprocmask(SigmaskHow::SIG_BLOCK, Some(&mask), None)
            .map_err(|e| SpawnError::Syscall(format!("sigprocmask failed: {}", e)))?;
        let signal_fd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(|e| SpawnError::Syscall(format!("signalfd failed: {}", e)))?;
        Ok(Self {
            children: BTreeMap::new(),
            signal_fd: Some(signal_fd),
            volatile_exit: false,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn count(&self) -> usize {
        self.children.len()
    }

    /// The descriptor the event loop polls for SIGCHLD, while still armed.
    pub fn signal_fd(&self) -> Option<BorrowedFd<'_>> {
        self.signal_fd.as_ref().map(|fd| fd.as_fd())
    }

    /// Drains pending signalfd records; the reaping happens in [`Self::reap`].
    pub fn drain_signal(&mut self) {
        if let Some(fd) = &mut self.signal_fd {
            while let Ok(Some(_)) = fd.read_signal() {}
        }
    }

    /// Registers a child under a symbolic name with its exit listener.
    pub fn add(&mut self, pid: Pid, name: &str, listener: ExitListener) {
        debug!("Tracking child {} (pid {})", name, pid);
        self.children.insert(
            pid.as_raw(),
            ManagedChild {
                name: name.to_string(),
                start_time: Instant::now(),
                listener: Some(listener),
                kill_deadline: None,
            },
        );
    }

    /// Rebinds (or clears) the exit listener of a tracked child.
    pub fn set_exit_listener(&mut self, pid: Pid, listener: Option<ExitListener>) {
        if let Some(child) = self.children.get_mut(&pid.as_raw()) {
            child.listener = listener;
        }
    }

    /// Sends a signal to a tracked child.
    ///
    /// SIGTERM and SIGKILL arm the kill timeout: a child that has not been
    /// reaped when it expires gets SIGKILL. The timeout is cancelled by the
    /// reap. Unknown pids are ignored.
    pub fn kill_signal(&mut self, pid: Pid, signal: Signal) {
        let Some(child) = self.children.get_mut(&pid.as_raw()) else {
            return;
        };
        if let Err(e) = kill(pid, signal) {
            warn!("Failed to send {} to pid {}: {}", signal, pid, e);
            return;
        }
        if matches!(signal, Signal::SIGTERM | Signal::SIGKILL) && child.kill_deadline.is_none() {
            child.kill_deadline = Some(Instant::now() + KILL_TIMEOUT);
        }
    }

    /// SIGTERM shorthand.
    pub fn kill(&mut self, pid: Pid) {
        self.kill_signal(pid, Signal::SIGTERM);
    }

    /// Escalates every expired kill timeout to SIGKILL.
    pub fn expire_kill_timeouts(&mut self, now: Instant) {
        for (&pid, child) in &mut self.children {
            if let Some(deadline) = child.kill_deadline
                && deadline <= now
            {
                warn!(
                    "Child {} (pid {}) ignored the signal, sending SIGKILL",
                    child.name, pid
                );
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                child.kill_deadline = None;
            }
        }
    }

    /// The nearest kill-timeout deadline, for the poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.children.values().filter_map(|c| c.kill_deadline).min()
    }

    /// Reaps every exited child and returns the notifications to deliver.
    ///
    /// Pids nobody registered (racing with [`Self::clear`]) are dropped
    /// silently.
    pub fn reap(&mut self) -> Vec<ReapedChild> {
        let mut reaped = Vec::new();
        loop {
            let mut status: libc::c_int = 0;
            let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
            let pid = unsafe { libc::wait4(-1, &mut status, libc::WNOHANG, &mut rusage) };
            if pid <= 0 {
                break;
            }

            let Some(child) = self.children.remove(&pid) else {
                continue;
            };
            let cpu_ms = rusage.ru_utime.tv_sec * 1000
                + rusage.ru_utime.tv_usec / 1000
                + rusage.ru_stime.tv_sec * 1000
                + rusage.ru_stime.tv_usec / 1000;
            debug!(
                "Child {} (pid {}) exited with status {:#x} after {:?} ({} ms cpu)",
                child.name,
                pid,
                status,
                child.start_time.elapsed(),
                cpu_ms
            );
            reaped.push(ReapedChild {
                pid: Pid::from_raw(pid),
                name: child.name,
                status,
                listener: child.listener,
            });
        }
        self.check_volatile();
        reaped
    }

    /// Begin shutdown: once the last child is reaped, release the signalfd.
    pub fn set_volatile(&mut self) {
        self.volatile_exit = true;
        self.check_volatile();
    }

    /// Forget all registered children. For a freshly forked process that
    /// must not inherit the parent's bookkeeping.
    pub fn clear(&mut self) {
        self.children.clear();
    }

    fn check_volatile(&mut self) {
        if self.volatile_exit && self.children.is_empty() && self.signal_fd.take().is_some() {
            debug!("All children reaped, SIGCHLD handling released");
        }
    }
}
