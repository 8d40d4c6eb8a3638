//! spawnd-cgroup: cgroup placement for the spawn server and its children
//!
//! At startup the server puts itself into a delegated systemd scope and
//! records its cgroup membership; children are then attached to sub-groups
//! below that path.

pub mod attach;
pub mod state;
pub mod systemd;

pub use attach::{CgroupOptions, attach};
pub use state::{CgroupState, load_cgroup_state, parse_proc_cgroup};
pub use systemd::{create_systemd_scope, sd_booted};
