//! Spawn policy hooks

use crate::prepared::PreparedChild;

/// Decides whether a spawn request may proceed.
///
/// When a hook is installed its verdict replaces the configuration
/// allow-list check; the request's resolved credentials, `refence` and
/// `hook_info` fields are all visible to it.
pub trait SpawnHook {
    /// True to allow the request.
    fn verify(&self, child: &PreparedChild) -> bool;
}
