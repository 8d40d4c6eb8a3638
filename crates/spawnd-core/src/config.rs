//! Server-side spawn policy
//!
//! The server only creates children under credentials its operator has
//! allow-listed; a request naming anything else is refused before fork.

use crate::{Result, SpawnError, UidGid};

/// Spawn server configuration.
#[derive(Debug, Clone, Default)]
pub struct SpawnConfig {
    /// uids clients may request, in addition to the default.
    pub allowed_uids: Vec<libc::uid_t>,
    /// gids clients may request (primary or supplementary), in addition to
    /// the default.
    pub allowed_gids: Vec<libc::gid_t>,
    /// Credentials used when a request does not name any.
    pub default_uid_gid: UidGid,
}

impl SpawnConfig {
    fn uid_allowed(&self, uid: libc::uid_t) -> bool {
        (!self.default_uid_gid.is_empty() && uid == self.default_uid_gid.uid)
            || self.allowed_uids.contains(&uid)
    }

    fn gid_allowed(&self, gid: libc::gid_t) -> bool {
        (!self.default_uid_gid.is_empty() && gid == self.default_uid_gid.gid)
            || self.allowed_gids.contains(&gid)
    }

    /// Check a requested identity against the allow-list.
    pub fn verify(&self, id: &UidGid) -> Result<()> {
        if !self.uid_allowed(id.uid) {
            return Err(SpawnError::Rejected(format!("uid {} is not allowed", id.uid)));
        }
        if !self.gid_allowed(id.gid) {
            return Err(SpawnError::Rejected(format!("gid {} is not allowed", id.gid)));
        }
        for &group in &id.groups {
            if !self.gid_allowed(group) {
                return Err(SpawnError::Rejected(format!(
                    "supplementary gid {} is not allowed",
                    group
                )));
            }
        }
        Ok(())
    }
}
