//! The fully resolved spawn request

use crate::namespace::NamespaceOptions;
use spawnd_cgroup::CgroupOptions;
use spawnd_core::{ResourceLimits, UidGid};
use spawnd_proto::MalformedPayload;
use std::ffi::CString;
use std::os::unix::io::OwnedFd;
use std::path::PathBuf;

/// A child process ready to be handed to the isolation pipeline.
///
/// Owns every file descriptor attached to the request; dropping the value
/// closes whatever was not passed on to a child yet.
#[derive(Debug, Default)]
pub struct PreparedChild {
    /// argv; the first element is the program path.
    pub args: Vec<CString>,
    /// KEY=VALUE environment entries.
    pub env: Vec<CString>,
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
    /// Control descriptor, installed as fd 3 in the child.
    pub control: Option<OwnedFd>,
    /// Error log opened by the child itself, after the jail is in place.
    pub stderr_path: Option<PathBuf>,
    /// Fall back to /dev/null when no stderr descriptor was attached.
    pub stderr_null: bool,
    /// File creation mask; None inherits the server's.
    pub umask: Option<u16>,
    pub chroot: Option<PathBuf>,
    pub chdir: Option<PathBuf>,
    /// Make stdin the controlling terminal.
    pub tty: bool,
    /// nice(2) value.
    pub priority: i32,
    pub sched_idle: bool,
    pub ioprio_idle: bool,
    pub no_new_privs: bool,
    pub forbid_user_ns: bool,
    pub forbid_multicast: bool,
    pub forbid_bind: bool,
    pub ns: NamespaceOptions,
    pub cgroup: CgroupOptions,
    pub rlimits: ResourceLimits,
    pub uid_gid: UidGid,
    /// Opaque tag, forwarded to hooks and log lines.
    pub refence: Option<String>,
    /// Opaque hint for the policy hook.
    pub hook_info: Option<String>,
}

impl PreparedChild {
    /// Appends an argv entry; NUL bytes cannot cross execve.
    pub fn append_arg(&mut self, arg: &str) -> Result<(), MalformedPayload> {
        self.args
            .push(CString::new(arg).map_err(|_| MalformedPayload)?);
        Ok(())
    }

    /// Appends a KEY=VALUE environment entry.
    pub fn put_env(&mut self, entry: &str) -> Result<(), MalformedPayload> {
        self.env
            .push(CString::new(entry).map_err(|_| MalformedPayload)?);
        Ok(())
    }

    /// The program to execute.
    pub fn program(&self) -> Option<&CString> {
        self.args.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_blank() {
        let prepared = PreparedChild::default();
        assert!(prepared.args.is_empty());
        assert!(prepared.program().is_none());
        assert!(prepared.umask.is_none());
        assert!(prepared.uid_gid.is_empty());
        assert_eq!(prepared.priority, 0);
    }

    #[test]
    fn test_argv_order_is_preserved() {
        let mut prepared = PreparedChild::default();
        prepared.append_arg("/bin/sh").unwrap();
        prepared.append_arg("-c").unwrap();
        prepared.append_arg("true").unwrap();
        assert_eq!(prepared.program().unwrap().to_str().unwrap(), "/bin/sh");
        assert_eq!(prepared.args.len(), 3);
    }

    #[test]
    fn test_env_entries() {
        let mut prepared = PreparedChild::default();
        prepared.put_env("PATH=/usr/bin").unwrap();
        prepared.put_env("HOME=/nonexistent").unwrap();
        assert_eq!(prepared.env.len(), 2);
    }
}
