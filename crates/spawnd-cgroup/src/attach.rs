//! Child-side cgroup attachment
//!
//! Runs in the freshly forked child: creates its group below the server's
//! delegated path, moves itself in, and applies the requested controller
//! settings.

use crate::CgroupState;
use spawnd_core::{Result, SpawnError};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const CGROUP_FS_ROOT: &str = "/sys/fs/cgroup";

/// Cgroup placement requested for one child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgroupOptions {
    /// Name of the child's group below the server's delegated path.
    pub name: Option<String>,
    /// Controller settings applied to the group, in request order.
    pub set: Vec<(String, String)>,
}

impl CgroupOptions {
    pub fn is_defined(&self) -> bool {
        self.name.is_some()
    }
}

fn cgroup_fs_root() -> PathBuf {
    std::env::var("SPAWND_CGROUP_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(CGROUP_FS_ROOT))
}

/// Moves the calling process into its requested cgroup.
pub fn attach(state: &CgroupState, options: &CgroupOptions, pid: u32) -> Result<()> {
    attach_at(&cgroup_fs_root(), state, options, pid)
}

/// Like [`attach`], with an explicit cgroup filesystem root.
pub fn attach_at(
    root: &Path,
    state: &CgroupState,
    options: &CgroupOptions,
    pid: u32,
) -> Result<()> {
    let Some(name) = &options.name else {
        return Ok(());
    };
    if !state.is_enabled() {
        return Ok(());
    }

    for mount in &state.mounts {
        let dir = group_dir(root, mount, &state.group_path, name);
        fs::create_dir_all(&dir).map_err(|e| {
            SpawnError::Cgroup(format!(
                "Failed to create cgroup directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        write_file(&dir.join("cgroup.procs"), &pid.to_string())?;
    }

    for (key, value) in &options.set {
        let controller = key.split('.').next().unwrap_or("");
        let Some(mount) = state.controllers.get(controller) else {
            return Err(SpawnError::Cgroup(format!(
                "No controller mount for '{}'",
                key
            )));
        };
        let dir = group_dir(root, mount, &state.group_path, name);
        write_file(&dir.join(key), value)?;
    }

    Ok(())
}

fn group_dir(root: &Path, mount: &str, group_path: &str, name: &str) -> PathBuf {
    root.join(mount)
        .join(group_path.trim_start_matches('/'))
        .join(name)
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| SpawnError::Cgroup(format!("Failed to open {}: {}", path.display(), e)))?;
    write!(file, "{}", content)
        .map_err(|e| SpawnError::Cgroup(format!("Failed to write to {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn delegated_state() -> CgroupState {
        let mut state = CgroupState {
            group_path: "/spawnd.scope".to_string(),
            ..Default::default()
        };
        state.mounts = vec!["systemd".to_string(), "memory".to_string()];
        state
            .controllers
            .insert("memory".to_string(), "memory".to_string());
        state
    }

    #[test]
    fn test_attach_without_group_name_is_noop() {
        let tmp = tempdir().unwrap();
        let options = CgroupOptions::default();
        attach_at(tmp.path(), &delegated_state(), &options, 123).unwrap();
        assert!(!tmp.path().join("systemd").exists());
    }

    #[test]
    fn test_attach_creates_groups_and_moves_pid() {
        let tmp = tempdir().unwrap();
        let options = CgroupOptions {
            name: Some("worker".to_string()),
            set: Vec::new(),
        };
        attach_at(tmp.path(), &delegated_state(), &options, 123).unwrap();

        for mount in ["systemd", "memory"] {
            let procs = tmp
                .path()
                .join(mount)
                .join("spawnd.scope/worker/cgroup.procs");
            assert_eq!(fs::read_to_string(procs).unwrap(), "123");
        }
    }

    #[test]
    fn test_attach_applies_controller_settings() {
        let tmp = tempdir().unwrap();
        let options = CgroupOptions {
            name: Some("worker".to_string()),
            set: vec![("memory.limit_in_bytes".to_string(), "67108864".to_string())],
        };
        attach_at(tmp.path(), &delegated_state(), &options, 123).unwrap();

        let limit = tmp
            .path()
            .join("memory/spawnd.scope/worker/memory.limit_in_bytes");
        assert_eq!(fs::read_to_string(limit).unwrap(), "67108864");
    }

    #[test]
    fn test_setting_for_unknown_controller_fails() {
        let tmp = tempdir().unwrap();
        let options = CgroupOptions {
            name: Some("worker".to_string()),
            set: vec![("cpu.shares".to_string(), "512".to_string())],
        };
        let err = attach_at(tmp.path(), &delegated_state(), &options, 123).unwrap_err();
        assert!(err.to_string().contains("cpu.shares"));
    }

    #[test]
    fn test_attach_with_disabled_state_is_noop() {
        let tmp = tempdir().unwrap();
        let options = CgroupOptions {
            name: Some("worker".to_string()),
            set: Vec::new(),
        };
        attach_at(tmp.path(), &CgroupState::default(), &options, 123).unwrap();
        assert!(!tmp.path().join("systemd").exists());
    }
}
