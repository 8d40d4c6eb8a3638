//! The fork/exec isolation pipeline
//!
//! Turns a [`PreparedChild`] into a running process: clone(2) with the
//! requested namespace flags, then — inside the child, in a fixed order —
//! network namespace join, cgroup attachment, hostname, mount topology,
//! chroot, resource limits, scheduling class, credential drop, no-new-privs,
//! seccomp, stdio wiring, execve. Any failure after the fork terminates the
//! child with exit code 0xff, which the parent observes as a normal exit.

use crate::mount;
use crate::prepared::PreparedChild;
use nix::sched::{CloneFlags, clone, setns};
use nix::sys::stat::Mode;
use nix::unistd::{chdir, chroot, execve, sethostname, setsid, Pid};
use spawnd_cgroup::CgroupState;
use spawnd_core::{Result, SpawnError};
use spawnd_seccomp::FilterOptions;
use std::convert::Infallible;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

/// Stack for the cloned child; the mount and cgroup setup run on it.
const CHILD_STACK_SIZE: usize = 256 * 1024;

/// Exit code of a child whose setup failed before execve.
pub const CHILD_SETUP_EXIT: i32 = 0xff;

const IOPRIO_WHO_PROCESS: libc::c_int = 1;
const IOPRIO_CLASS_IDLE: libc::c_int = 3;
const IOPRIO_CLASS_SHIFT: u32 = 13;

/// Forks the child with its namespace flags and runs the isolation sequence.
///
/// Returns the child's pid. The parent's copies of the transferred stdio
/// descriptors stay in `prepared` and close when the caller drops it.
pub fn spawn_child(prepared: &mut PreparedChild, cgroup_state: &CgroupState) -> Result<Pid> {
    let flags = prepared.ns.clone_flags();
    let mut stack = vec![0u8; CHILD_STACK_SIZE];

    let pid = unsafe {
        clone(
            Box::new(|| match run_in_child(prepared, cgroup_state) {
                Ok(never) => match never {},
                Err(e) => {
                    eprintln!("spawnd child setup failed: {}", e);
                    CHILD_SETUP_EXIT as isize
                }
            }),
            &mut stack,
            flags,
            Some(libc::SIGCHLD),
        )
    }
    .map_err(|e| SpawnError::Syscall(format!("clone failed: {}", e)))?;

    Ok(pid)
}

/// Everything that runs in the child. Only returns on failure.
fn run_in_child(p: &mut PreparedChild, cgroup_state: &CgroupState) -> Result<Infallible> {
    if let Some(name) = &p.ns.network_namespace {
        join_network_namespace(name)?;
    }

    if p.cgroup.is_defined() {
        let pid = nix::unistd::getpid().as_raw() as u32;
        spawnd_cgroup::attach(cgroup_state, &p.cgroup, pid)?;
    }

    if let Some(hostname) = &p.ns.hostname {
        sethostname(hostname)
            .map_err(|e| SpawnError::Namespace(format!("sethostname failed: {}", e)))?;
    }

    mount::apply(&p.ns)?;

    if let Some(root) = &p.chroot {
        chroot(root.as_path())
            .map_err(|e| SpawnError::Syscall(format!("chroot('{}') failed: {}", root.display(), e)))?;
        chdir("/").map_err(|e| SpawnError::Syscall(format!("chdir('/') failed: {}", e)))?;
    }
    if let Some(dir) = &p.chdir {
        chdir(dir.as_path())
            .map_err(|e| SpawnError::Syscall(format!("chdir('{}') failed: {}", dir.display(), e)))?;
    }

    p.rlimits.apply()?;

    if let Some(mask) = p.umask {
        nix::sys::stat::umask(Mode::from_bits_truncate(mask as libc::mode_t));
    }
    if p.priority != 0 {
        set_priority(p.priority)?;
    }
    if p.sched_idle {
        set_sched_idle()?;
    }
    if p.ioprio_idle {
        set_ioprio_idle();
    }

    p.uid_gid.apply()?;

    if p.no_new_privs || p.ns.any() {
        set_no_new_privs()?;
    }

    // Missing kernel support is not an error; the filter is simply omitted.
    let filter_options = FilterOptions {
        forbid_user_ns: p.forbid_user_ns,
        forbid_multicast: p.forbid_multicast,
        forbid_bind: p.forbid_bind,
    };
    if let Ok(filters) = spawnd_seccomp::build(&filter_options) {
        let _ = filters.apply();
    }

    // Opened only now so the path is resolved inside the jail, under the
    // child's own credentials.
    if p.stderr.is_none()
        && let Some(path) = &p.stderr_path
    {
        p.stderr = Some(open_stderr_path(path)?);
    }

    if p.tty {
        setsid().map_err(|e| SpawnError::Syscall(format!("setsid failed: {}", e)))?;
    }

    setup_stdio(p)?;

    if p.tty {
        let ret = unsafe { libc::ioctl(0, libc::TIOCSCTTY, 0) };
        if ret != 0 {
            return Err(SpawnError::Syscall(format!(
                "Failed to acquire the controlling terminal: {}",
                std::io::Error::last_os_error()
            )));
        }
    }

    let program = p
        .args
        .first()
        .ok_or_else(|| SpawnError::InvalidConfig("empty argv".to_string()))?;
    match execve(program, &p.args, &p.env) {
        Ok(never) => match never {},
        Err(e) => Err(SpawnError::Syscall(format!(
            "execve('{}') failed: {}",
            program.to_string_lossy(),
            e
        ))),
    }
}

fn join_network_namespace(name: &str) -> Result<()> {
    let path = format!("/var/run/netns/{}", name);
    let file = File::open(&path)
        .map_err(|e| SpawnError::Namespace(format!("Failed to open '{}': {}", path, e)))?;
    setns(&file, CloneFlags::CLONE_NEWNET)
        .map_err(|e| SpawnError::Namespace(format!("setns('{}') failed: {}", name, e)))
}

fn open_stderr_path(path: &Path) -> Result<OwnedFd> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(true)
        .custom_flags(libc::O_CLOEXEC | libc::O_NOCTTY)
        .mode(0o600)
        .open(path)
        .map_err(|e| SpawnError::Io(e))?;
    Ok(file.into())
}

/// Installs the stdio descriptors on 0/1/2 and the control descriptor on 3.
///
/// Everything is first lifted clear of the 0-3 range so a dup2 cannot
/// clobber a descriptor that is still waiting for its slot; the lifted
/// copies carry O_CLOEXEC and disappear at exec.
fn setup_stdio(p: &mut PreparedChild) -> Result<()> {
    let slots = [
        (p.stdin.take(), 0),
        (p.stdout.take(), 1),
        (p.stderr.take(), 2),
        (p.control.take(), 3),
    ];

    let mut placed: Vec<(OwnedFd, RawFd)> = Vec::new();
    for (fd, target) in slots {
        let Some(fd) = fd else { continue };
        if fd.as_raw_fd() <= 3 {
            let lifted = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 4) };
            if lifted < 0 {
                return Err(SpawnError::Syscall(format!(
                    "fcntl(F_DUPFD_CLOEXEC) failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            placed.push((unsafe { OwnedFd::from_raw_fd(lifted) }, target));
        } else {
            placed.push((fd, target));
        }
    }

    for (fd, target) in &placed {
        if unsafe { libc::dup2(fd.as_raw_fd(), *target) } < 0 {
            return Err(SpawnError::Syscall(format!(
                "dup2({}) failed: {}",
                target,
                std::io::Error::last_os_error()
            )));
        }
    }

    Ok(())
}

fn set_priority(priority: i32) -> Result<()> {
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, priority) };
    if ret != 0 {
        return Err(SpawnError::Syscall(format!(
            "setpriority({}) failed: {}",
            priority,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

fn set_sched_idle() -> Result<()> {
    let param = libc::sched_param { sched_priority: 0 };
    let ret = unsafe { libc::sched_setscheduler(0, libc::SCHED_IDLE, &param) };
    if ret != 0 {
        return Err(SpawnError::Syscall(format!(
            "sched_setscheduler(SCHED_IDLE) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Best effort: without I/O scheduling support the default priority stays.
fn set_ioprio_idle() {
    unsafe {
        libc::syscall(
            libc::SYS_ioprio_set,
            IOPRIO_WHO_PROCESS,
            0,
            IOPRIO_CLASS_IDLE << IOPRIO_CLASS_SHIFT,
        );
    }
}

fn set_no_new_privs() -> Result<()> {
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(SpawnError::Syscall(format!(
            "Failed to set PR_SET_NO_NEW_PRIVS: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial_guard;
    use nix::sys::wait::{WaitStatus, waitpid};
    use std::io::Read;

    fn wait_status(pid: Pid) -> WaitStatus {
        waitpid(pid, None).unwrap()
    }

    #[test]
    fn test_spawn_true_exits_zero() {
        let _guard = serial_guard();
        let mut prepared = PreparedChild::default();
        prepared.append_arg("/bin/true").unwrap();

        let pid = spawn_child(&mut prepared, &CgroupState::default()).unwrap();
        assert_eq!(wait_status(pid), WaitStatus::Exited(pid, 0));
    }

    #[test]
    fn test_spawn_reports_exec_failure_as_0xff() {
        let _guard = serial_guard();
        let mut prepared = PreparedChild::default();
        prepared.append_arg("/nonexistent/program").unwrap();

        let pid = spawn_child(&mut prepared, &CgroupState::default()).unwrap();
        assert_eq!(wait_status(pid), WaitStatus::Exited(pid, CHILD_SETUP_EXIT));
    }

    #[test]
    fn test_stdout_descriptor_is_wired_up() {
        let _guard = serial_guard();
        let (read, write) = nix::unistd::pipe().unwrap();

        let mut prepared = PreparedChild::default();
        prepared.append_arg("/bin/sh").unwrap();
        prepared.append_arg("-c").unwrap();
        prepared.append_arg("echo hi").unwrap();
        prepared.stdout = Some(write);

        let pid = spawn_child(&mut prepared, &CgroupState::default()).unwrap();
        drop(prepared); // close the parent's copy of the pipe

        assert_eq!(wait_status(pid), WaitStatus::Exited(pid, 0));

        let mut output = String::new();
        std::fs::File::from(read).read_to_string(&mut output).unwrap();
        assert_eq!(output, "hi\n");
    }

    #[test]
    fn test_environment_reaches_the_child() {
        let _guard = serial_guard();
        let mut prepared = PreparedChild::default();
        prepared.append_arg("/bin/sh").unwrap();
        prepared.append_arg("-c").unwrap();
        prepared.append_arg("test \"$SPAWND_MARKER\" = yes").unwrap();
        prepared.put_env("SPAWND_MARKER=yes").unwrap();

        let pid = spawn_child(&mut prepared, &CgroupState::default()).unwrap();
        assert_eq!(wait_status(pid), WaitStatus::Exited(pid, 0));
    }

    #[test]
    fn test_empty_argv_fails_in_the_child() {
        let _guard = serial_guard();
        let mut prepared = PreparedChild::default();
        let pid = spawn_child(&mut prepared, &CgroupState::default()).unwrap();
        assert_eq!(wait_status(pid), WaitStatus::Exited(pid, CHILD_SETUP_EXIT));
    }
}
