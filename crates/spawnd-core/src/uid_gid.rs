//! Credential records for spawned children

use crate::{Result, SpawnError};
use nix::unistd::{Gid, Uid, setgid, setgroups, setuid};

/// Maximum number of supplementary groups a spawn request may carry.
pub const MAX_GROUPS: usize = 32;

/// uid/gid pair plus supplementary groups requested for a child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UidGid {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub groups: Vec<libc::gid_t>,
}

impl UidGid {
    pub fn new(uid: libc::uid_t, gid: libc::gid_t) -> Self {
        Self {
            uid,
            gid,
            groups: Vec::new(),
        }
    }

    /// An all-zero record means "no credentials requested".
    pub fn is_empty(&self) -> bool {
        self.uid == 0 && self.gid == 0
    }

    /// Drop privileges to this identity: setgroups, then setgid, then setuid.
    ///
    /// An empty supplementary list clears the inherited groups. Without
    /// effective root there is nothing to drop and the call is a no-op.
    pub fn apply(&self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }

        if !Uid::effective().is_root() {
            log::warn!(
                "Skipping credential drop to {}:{} without root privileges",
                self.uid,
                self.gid
            );
            return Ok(());
        }

        let groups: Vec<Gid> = self.groups.iter().map(|&g| Gid::from_raw(g)).collect();
        setgroups(&groups)
            .map_err(|e| SpawnError::Syscall(format!("setgroups failed: {}", e)))?;
        setgid(Gid::from_raw(self.gid))
            .map_err(|e| SpawnError::Syscall(format!("setgid({}) failed: {}", self.gid, e)))?;
        setuid(Uid::from_raw(self.uid))
            .map_err(|e| SpawnError::Syscall(format!("setuid({}) failed: {}", self.uid, e)))?;
        Ok(())
    }
}
