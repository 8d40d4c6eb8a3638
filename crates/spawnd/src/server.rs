//! The spawn server process: connection set, event loop, entry point
//!
//! Single-threaded and cooperative: one poll(2) over the control sockets and
//! the registry's signalfd, with the timeout driven by the nearest kill
//! deadline. The server exits when its connection set becomes empty and the
//! registry has drained.

use crate::connection::{Connection, ReadOutcome};
use crate::hook::SpawnHook;
use crate::registry::{ChildProcessRegistry, ConnectionId};
use log::{debug, warn};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use spawnd_cgroup::CgroupState;
use spawnd_core::{Result, SpawnConfig};
use spawnd_proto as proto;
use spawnd_proto::ResponseCommand;
use std::os::unix::io::{AsFd, OwnedFd};
use std::time::Instant;

pub struct SpawnServerProcess {
    config: SpawnConfig,
    cgroup_state: CgroupState,
    hook: Option<Box<dyn SpawnHook>>,
    registry: ChildProcessRegistry,
    connections: Vec<Connection>,
    next_connection_id: ConnectionId,
}

impl SpawnServerProcess {
    pub fn new(
        config: SpawnConfig,
        cgroup_state: CgroupState,
        hook: Option<Box<dyn SpawnHook>>,
    ) -> Result<Self> {
        Ok(Self {
            config,
            cgroup_state,
            hook,
            registry: ChildProcessRegistry::new()?,
            connections: Vec::new(),
            next_connection_id: 0,
        })
    }

    /// Adopts a control socket as a new connection.
    pub fn add_connection(&mut self, socket: OwnedFd) {
        let id = self.next_connection_id;
        self.next_connection_id += 1;
        debug!("Connection {} registered", id);
        self.connections.push(Connection::new(id, socket));
    }

    /// Runs until the last connection is gone and every child is reaped.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if self.connections.is_empty() {
                // all connections are gone; finish once the children are too
                self.registry.set_volatile();
                if self.registry.is_empty() {
                    break;
                }
            }

            let timeout = poll_timeout(self.registry.next_deadline());
            let (signal_ready, readable) = self.wait(timeout)?;

            if signal_ready {
                self.registry.drain_signal();
                self.route_exits();
            }
            self.registry.expire_kill_timeouts(Instant::now());
            self.dispatch(readable);
        }
        debug!("Last connection and last child are gone, exiting");
        Ok(())
    }

    /// Polls the signalfd and every connection socket.
    fn wait(&self, timeout: PollTimeout) -> Result<(bool, Vec<ConnectionId>)> {
        let signal_fd = self.registry.signal_fd();
        let mut fds = Vec::with_capacity(self.connections.len() + 1);
        if let Some(fd) = signal_fd {
            fds.push(PollFd::new(fd, PollFlags::POLLIN));
        }
        for connection in &self.connections {
            fds.push(PollFd::new(connection.socket(), PollFlags::POLLIN));
        }

        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Ok((false, Vec::new())),
            Err(e) => return Err(e.into()),
        }

        let mut results = fds.iter();
        let signal_ready = signal_fd.is_some()
            && results
                .next()
                .and_then(|fd| fd.revents())
                .is_some_and(|revents| !revents.is_empty());
        let readable = self
            .connections
            .iter()
            .zip(results)
            .filter(|(_, fd)| {
                fd.revents().is_some_and(|revents| !revents.is_empty())
            })
            .map(|(connection, _)| connection.id())
            .collect();
        Ok((signal_ready, readable))
    }

    fn dispatch(&mut self, readable: Vec<ConnectionId>) {
        for id in readable {
            let outcome = {
                let Self {
                    connections,
                    registry,
                    config,
                    cgroup_state,
                    hook,
                    ..
                } = self;
                let Some(connection) = connections.iter_mut().find(|c| c.id() == id) else {
                    continue;
                };
                connection.handle_readable(registry, config, cgroup_state, hook.as_deref())
            };
            match outcome {
                ReadOutcome::Continue => {}
                ReadOutcome::Closed => self.remove_connection(id),
                ReadOutcome::NewConnection(socket) => self.add_connection(socket),
            }
        }
    }

    /// Delivers EXIT frames for everything the reap loop collected.
    fn route_exits(&mut self) {
        for reaped in self.registry.reap() {
            // the owner may have disconnected first; then the exit is only
            // reaped, never reported
            let Some(listener) = reaped.listener else {
                continue;
            };
            let Some(index) = self
                .connections
                .iter()
                .position(|c| c.id() == listener.connection)
            else {
                continue;
            };
            self.connections[index].forget_child(listener.id);
            if matches!(
                self.connections[index].send_exit(listener.id, reaped.status),
                ReadOutcome::Closed
            ) {
                self.remove_connection(listener.connection);
            }
        }
    }

    fn remove_connection(&mut self, id: ConnectionId) {
        let Some(index) = self.connections.iter().position(|c| c.id() == id) else {
            return;
        };
        let mut connection = self.connections.swap_remove(index);
        connection.teardown(&mut self.registry);
        debug!(
            "Connection {} closed, {} connection(s) remaining",
            id,
            self.connections.len()
        );
    }
}

fn poll_timeout(deadline: Option<Instant>) -> PollTimeout {
    match deadline {
        None => PollTimeout::NONE,
        Some(deadline) => {
            let millis = deadline
                .saturating_duration_since(Instant::now())
                .as_millis()
                .min(i32::MAX as u128) as i32;
            PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
        }
    }
}

/// Entry point: serves spawn requests on `initial` until every client is
/// gone and every child has been reaped.
///
/// When the cgroup feature is live, the client is told so with a single
/// CGROUPS_AVAILABLE byte before the loop starts; there is no other way for
/// it to find out.
pub fn run_spawn_server(
    config: SpawnConfig,
    cgroup_state: CgroupState,
    hook: Option<Box<dyn SpawnHook>>,
    initial: OwnedFd,
) -> Result<()> {
    if cgroup_state.is_enabled() {
        let frame = [ResponseCommand::CgroupsAvailable as u8];
        if let Err(e) = proto::send_with_fds(initial.as_fd(), &frame, &[]) {
            warn!("Failed to announce cgroup support: {}", e);
        }
    }

    let mut process = SpawnServerProcess::new(config, cgroup_state, hook)?;
    process.add_connection(initial);
    process.run()
}
