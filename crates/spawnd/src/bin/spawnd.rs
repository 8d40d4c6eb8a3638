//! Spawn server daemon
//!
//! Expects its control socket as an already-open file descriptor (the parent
//! process keeps the other end), places itself in a delegated systemd scope,
//! and serves spawn requests until the last client disconnects.

use clap::Parser;
use log::{info, warn};
use spawnd::run_spawn_server;
use spawnd_cgroup::CgroupState;
use spawnd_core::{SpawnConfig, UidGid};
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::process;

#[derive(Parser)]
#[command(
    name = "spawnd",
    about = "Privileged spawn server for sandboxed child processes"
)]
struct Cli {
    /// File descriptor of the initial control socket
    #[arg(long, default_value_t = 3)]
    socket_fd: RawFd,

    /// uid clients may request (repeatable)
    #[arg(long = "allow-uid", value_name = "UID")]
    allowed_uids: Vec<libc::uid_t>,

    /// gid clients may request (repeatable)
    #[arg(long = "allow-gid", value_name = "GID")]
    allowed_gids: Vec<libc::gid_t>,

    /// uid used when a request does not name one
    #[arg(long, value_name = "UID")]
    default_uid: Option<libc::uid_t>,

    /// gid used when a request does not name one
    #[arg(long, value_name = "GID")]
    default_gid: Option<libc::gid_t>,

    /// Name of the transient scope unit to create
    #[arg(long, default_value = "spawnd.scope")]
    scope_name: String,

    /// Description of the transient scope unit
    #[arg(long, default_value = "spawnd process spawner")]
    scope_description: String,

    /// Slice to place the scope in
    #[arg(long)]
    slice: Option<String>,

    /// Skip the systemd scope and run without cgroup support
    #[arg(long)]
    no_systemd_scope: bool,
}

fn main() {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    let cli = Cli::parse();

    let mut config = SpawnConfig {
        allowed_uids: cli.allowed_uids,
        allowed_gids: cli.allowed_gids,
        ..Default::default()
    };
    if let (Some(uid), Some(gid)) = (cli.default_uid, cli.default_gid) {
        config.default_uid_gid = UidGid::new(uid, gid);
    }

    let cgroup_state = if cli.no_systemd_scope {
        CgroupState::default()
    } else {
        match spawnd_cgroup::create_systemd_scope(
            &cli.scope_name,
            &cli.scope_description,
            process::id(),
            true,
            cli.slice.as_deref(),
        ) {
            Ok(state) => state,
            Err(e) => {
                warn!("Failed to create systemd scope: {}", e);
                CgroupState::default()
            }
        }
    };
    info!(
        "Cgroup support {}",
        if cgroup_state.is_enabled() {
            "enabled"
        } else {
            "disabled"
        }
    );

    let socket = unsafe { OwnedFd::from_raw_fd(cli.socket_fd) };
    if let Err(e) = run_spawn_server(config, cgroup_state, None, socket) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
