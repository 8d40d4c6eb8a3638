//! Transient scope creation via systemd
//!
//! At startup the server asks systemd for a delegated transient scope
//! containing its own pid, then reads back the resulting cgroup membership.
//! Everything here runs before the event loop exists, so the blocking DBus
//! API is fine.

use crate::{CgroupState, load_cgroup_state};
use log::{debug, warn};
use spawnd_core::{Result, SpawnError};
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;
use zbus::blocking::{Connection, Proxy};
use zbus::zvariant::{OwnedObjectPath, Value};

const SYSTEMD_BUS_NAME: &str = "org.freedesktop.systemd1";
const SYSTEMD_OBJECT_PATH: &str = "/org/freedesktop/systemd1";
const SYSTEMD_MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";
const UNIT_EXISTS_ERROR: &str = "org.freedesktop.systemd1.UnitExists";

/// How long to wait for systemd to clean up a leftover scope with our name.
const UNIT_REMOVED_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on the scope job itself; systemd normally finishes in
/// milliseconds.
const JOB_REMOVED_TIMEOUT: Duration = Duration::from_secs(30);

/// True when the system was booted with systemd as init.
pub fn sd_booted() -> bool {
    Path::new("/run/systemd/system").is_dir()
}

/// Puts the calling process into a new transient scope unit.
///
/// Returns the delegated cgroup state on success, or the disabled state when
/// the system does not run systemd. A scope left over from a crashed
/// predecessor is waited out and the creation retried once.
pub fn create_systemd_scope(
    name: &str,
    description: &str,
    pid: u32,
    delegate: bool,
    slice: Option<&str>,
) -> Result<CgroupState> {
    if !sd_booted() {
        debug!("Not booted with systemd, cgroup support disabled");
        return Ok(CgroupState::default());
    }

    let connection = Connection::system()
        .map_err(|e| SpawnError::Systemd(format!("Failed to connect to the system bus: {}", e)))?;
    let manager: Proxy<'static> = Proxy::new(
        &connection,
        SYSTEMD_BUS_NAME,
        SYSTEMD_OBJECT_PATH,
        SYSTEMD_MANAGER_INTERFACE,
    )
    .map_err(|e| SpawnError::Systemd(format!("Failed to create manager proxy: {}", e)))?;

    // Subscribe before sending the method call so no signal can be missed.
    let job_removed = manager
        .receive_signal("JobRemoved")
        .map_err(|e| SpawnError::Systemd(format!("Failed to subscribe to JobRemoved: {}", e)))?;
    let unit_removed = manager
        .receive_signal("UnitRemoved")
        .map_err(|e| SpawnError::Systemd(format!("Failed to subscribe to UnitRemoved: {}", e)))?;

    let job_path = match start_transient_unit(&manager, name, description, pid, delegate, slice) {
        Ok(path) => path,
        Err(e) if is_unit_exists(&e) => {
            // the previous instance crashed and systemd has not cleaned up
            // its scope yet
            warn!("Scope {} already exists, waiting for its removal", name);
            if !wait_unit_removed(unit_removed, name, UNIT_REMOVED_TIMEOUT) {
                return Err(SpawnError::Systemd(format!(
                    "Scope {} already exists",
                    name
                )));
            }
            start_transient_unit(&manager, name, description, pid, delegate, slice)
                .map_err(|e| SpawnError::Systemd(format!("StartTransientUnit failed: {}", e)))?
        }
        Err(e) => {
            return Err(SpawnError::Systemd(format!(
                "StartTransientUnit failed: {}",
                e
            )));
        }
    };

    wait_job_removed(job_removed, &job_path, JOB_REMOVED_TIMEOUT)?;
    debug!("Transient scope {} created", name);

    Ok(if delegate {
        load_cgroup_state(None)
    } else {
        CgroupState::default()
    })
}

fn start_transient_unit(
    manager: &Proxy<'_>,
    name: &str,
    description: &str,
    pid: u32,
    delegate: bool,
    slice: Option<&str>,
) -> zbus::Result<OwnedObjectPath> {
    let mut properties: Vec<(&str, Value)> = vec![
        ("Description", Value::new(description)),
        ("PIDs", Value::new(vec![pid])),
        ("Delegate", Value::new(delegate)),
    ];
    if let Some(slice) = slice {
        properties.push(("Slice", Value::new(slice)));
    }
    let aux: Vec<(&str, Vec<(&str, Value)>)> = Vec::new();

    let reply = manager.call_method("StartTransientUnit", &(name, "replace", properties, aux))?;
    reply.body().deserialize()
}

fn is_unit_exists(error: &zbus::Error) -> bool {
    matches!(error, zbus::Error::MethodError(name, _, _) if name.as_str() == UNIT_EXISTS_ERROR)
}

/// Waits for the JobRemoved signal matching our job object path.
fn wait_job_removed(
    signals: impl Iterator<Item = zbus::Message> + Send + 'static,
    job_path: &OwnedObjectPath,
    timeout: Duration,
) -> Result<()> {
    let expected = job_path.to_string();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for message in signals {
            let Ok((_job_id, path, _unit, _result)) = message
                .body()
                .deserialize::<(u32, OwnedObjectPath, String, String)>()
            else {
                continue;
            };
            if path.as_str() == expected {
                let _ = tx.send(());
                return;
            }
        }
    });
    rx.recv_timeout(timeout)
        .map_err(|_| SpawnError::Systemd("Timed out waiting for JobRemoved".to_string()))
}

/// Waits for the UnitRemoved signal for the given unit name.
fn wait_unit_removed(
    signals: impl Iterator<Item = zbus::Message> + Send + 'static,
    unit: &str,
    timeout: Duration,
) -> bool {
    let expected = unit.to_string();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for message in signals {
            let Ok((name, _path)) = message.body().deserialize::<(String, OwnedObjectPath)>()
            else {
                continue;
            };
            if name == expected {
                let _ = tx.send(());
                return;
            }
        }
    });
    rx.recv_timeout(timeout).is_ok()
}
