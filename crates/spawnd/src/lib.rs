//! spawnd: privileged spawn server
//!
//! Launches isolated child processes on behalf of unprivileged clients
//! connected over a UNIX datagram socket. Clients describe the child (argv,
//! environment, stdio descriptors, namespaces, cgroup, resource limits,
//! credentials, mounts, seccomp policy); the server forks and execs it in a
//! sandbox, multiplexes SIGCHLD for all managed children, and reports exit
//! statuses back to the originating client.
//!
//! # Modules
//!
//! - **prepared**: the fully resolved spawn request
//! - **namespace**: namespace and mount layout options
//! - **mount**: mount topology construction inside the child
//! - **spawn**: the fork/exec isolation pipeline
//! - **registry**: SIGCHLD multiplexing and kill timeouts
//! - **connection** / **server**: protocol dispatch and the event loop

pub mod connection;
pub mod hook;
pub mod mount;
pub mod namespace;
pub mod prepared;
pub mod registry;
pub mod server;
pub mod spawn;

pub use connection::SPAWN_FAILED_STATUS;
pub use hook::SpawnHook;
pub use namespace::{BindMount, NamespaceOptions};
pub use prepared::PreparedChild;
pub use registry::{ChildProcessRegistry, KILL_TIMEOUT};
pub use server::{SpawnServerProcess, run_spawn_server};
pub use spawnd_core::{Result, SpawnConfig, SpawnError, UidGid};

#[cfg(test)]
pub mod test_support {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    /// Serializes tests that fork or reap; wait4(-1) must not steal another
    /// test's child.
    pub fn serial_guard() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
