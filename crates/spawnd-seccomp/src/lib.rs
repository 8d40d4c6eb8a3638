//! spawnd-seccomp: syscall filtering for spawned children
//!
//! Children run under a default-allow filter with a targeted denylist:
//! dangerous syscalls are killed outright, socket domains outside a small
//! whitelist are refused, and a request can additionally forbid user
//! namespaces, multicast and listening sockets.

pub mod filter;
pub mod table;

pub use filter::{FilterOptions, FilterSet, build};
pub use table::syscall_number;
