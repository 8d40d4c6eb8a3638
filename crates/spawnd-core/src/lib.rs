//! spawnd-core: shared types for the spawnd spawn server
//!
//! The error type, the server configuration with its uid/gid allow-list, and
//! the credential and resource-limit records carried by spawn requests.

pub mod config;
pub mod error;
pub mod rlimit;
pub mod uid_gid;

pub use config::SpawnConfig;
pub use error::{Result, SpawnError};
pub use rlimit::{RLIMIT_SLOTS, ResourceLimits, RlimitValue};
pub use uid_gid::{MAX_GROUPS, UidGid};
