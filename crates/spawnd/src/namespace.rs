//! Namespace and mount layout options for a spawned child

use nix::sched::CloneFlags;
use std::path::PathBuf;

/// One bind mount inside the child's mount namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub writable: bool,
    pub exec: bool,
}

/// Namespace configuration of a spawn request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceOptions {
    pub enable_user: bool,
    pub enable_pid: bool,
    pub enable_network: bool,
    pub enable_ipc: bool,
    pub enable_mount: bool,
    /// Join this named network namespace instead of creating a fresh one.
    pub network_namespace: Option<String>,
    /// New root directory, entered with pivot_root(2).
    pub pivot_root: Option<PathBuf>,
    pub mount_proc: bool,
    /// Mount /proc writable; children that set up nested user namespaces
    /// need to write their own uid/gid maps.
    pub writable_proc: bool,
    /// Bind-mount source for the home directory.
    pub mount_home: Option<PathBuf>,
    /// Where the home directory appears inside the sandbox.
    pub home: Option<PathBuf>,
    /// Mount a tmpfs on /tmp with these mount options.
    pub mount_tmp_tmpfs: Option<String>,
    /// Mount an additional tmpfs at this path.
    pub mount_tmpfs: Option<String>,
    /// Bind mounts, applied in request order.
    pub bind_mounts: Vec<BindMount>,
    /// Hostname inside a new UTS namespace.
    pub hostname: Option<String>,
}

impl NamespaceOptions {
    /// True when any namespace will be created for the child.
    pub fn any(&self) -> bool {
        self.enable_user
            || self.enable_pid
            || self.enable_network
            || self.enable_ipc
            || self.enable_mount
            || self.hostname.is_some()
    }

    /// The clone(2) flag union for this configuration.
    pub fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.enable_user {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.enable_pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.enable_network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.enable_ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.enable_mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.hostname.is_some() {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_requests_nothing() {
        let options = NamespaceOptions::default();
        assert!(!options.any());
        assert!(options.clone_flags().is_empty());
    }

    #[test]
    fn test_clone_flags_follow_the_switches() {
        let options = NamespaceOptions {
            enable_pid: true,
            enable_network: true,
            ..Default::default()
        };
        let flags = options.clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWNET));
        assert!(!flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(options.any());
    }

    #[test]
    fn test_hostname_implies_uts_namespace() {
        let options = NamespaceOptions {
            hostname: Some("sandbox".to_string()),
            ..Default::default()
        };
        assert!(options.clone_flags().contains(CloneFlags::CLONE_NEWUTS));
        assert!(options.any());
    }
}
