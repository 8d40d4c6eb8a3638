//! Mount topology construction inside the child's mount namespace

use crate::namespace::NamespaceOptions;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::unistd::{chdir, pivot_root};
use spawnd_core::{Result, SpawnError};
use std::path::Path;

/// Applies the entire mount layout in request order.
pub fn apply(ns: &NamespaceOptions) -> Result<()> {
    if let Some(new_root) = &ns.pivot_root {
        enter_pivot_root(new_root)?;
    }
    if ns.mount_proc {
        mount_proc(ns.writable_proc)?;
    }
    if let Some(options) = &ns.mount_tmp_tmpfs {
        mount_tmpfs(Path::new("/tmp"), Some(options))?;
    }
    if let Some(path) = &ns.mount_tmpfs {
        mount_tmpfs(Path::new(path), None)?;
    }
    if let (Some(source), Some(home)) = (&ns.mount_home, &ns.home) {
        bind(source, home, true, true)?;
    }
    for entry in &ns.bind_mounts {
        bind(&entry.source, &entry.target, entry.writable, entry.exec)?;
    }
    Ok(())
}

/// Swaps the root filesystem for `new_root`.
fn enter_pivot_root(new_root: &Path) -> Result<()> {
    // pivot_root(2) requires the new root to be a mount point
    mount(
        Some(new_root),
        new_root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_NOSUID,
        None::<&str>,
    )
    .map_err(|e| {
        SpawnError::Mount(format!(
            "bind mount('{}') failed: {}",
            new_root.display(),
            e
        ))
    })?;
    chdir(new_root)
        .map_err(|e| SpawnError::Mount(format!("chdir('{}') failed: {}", new_root.display(), e)))?;
    pivot_root(".", ".")
        .map_err(|e| SpawnError::Mount(format!("pivot_root() failed: {}", e)))?;
    umount2(".", MntFlags::MNT_DETACH)
        .map_err(|e| SpawnError::Mount(format!("Failed to detach the old root: {}", e)))?;
    chdir("/").map_err(|e| SpawnError::Mount(format!("chdir('/') failed: {}", e)))?;
    Ok(())
}

fn mount_proc(writable: bool) -> Result<()> {
    let mut flags = MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    if !writable {
        flags |= MsFlags::MS_RDONLY;
    }
    mount(Some("proc"), "/proc", Some("proc"), flags, None::<&str>)
        .map_err(|e| SpawnError::Mount(format!("Failed to mount /proc: {}", e)))
}

fn mount_tmpfs(target: &Path, options: Option<&str>) -> Result<()> {
    mount(
        Some("none"),
        target,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        options,
    )
    .map_err(|e| {
        SpawnError::Mount(format!(
            "Failed to mount tmpfs at '{}': {}",
            target.display(),
            e
        ))
    })
}

/// Bind-mounts `source` onto `target`, then makes the ro/noexec options
/// effective with a remount pass.
fn bind(source: &Path, target: &Path, writable: bool, exec: bool) -> Result<()> {
    let base = MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND | base,
        None::<&str>,
    )
    .map_err(|e| {
        SpawnError::Mount(format!(
            "bind mount('{}' -> '{}') failed: {}",
            source.display(),
            target.display(),
            e
        ))
    })?;

    let mut extra = MsFlags::empty();
    if !writable {
        extra |= MsFlags::MS_RDONLY;
    }
    if !exec {
        extra |= MsFlags::MS_NOEXEC;
    }
    if extra.is_empty() {
        return Ok(());
    }

    // The kernel silently ignores ro/noexec on the initial bind; only a
    // remount applies them.
    let remount = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | base | extra;
    match mount(None::<&str>, target, None::<&str>, remount, None::<&str>) {
        Ok(()) => Ok(()),
        // some kernels refuse the remount unless MS_NOEXEC is included
        Err(nix::errno::Errno::EPERM) if !extra.contains(MsFlags::MS_NOEXEC) => mount(
            None::<&str>,
            target,
            None::<&str>,
            remount | MsFlags::MS_NOEXEC,
            None::<&str>,
        )
        .map_err(|e| {
            SpawnError::Mount(format!("remount('{}') failed: {}", target.display(), e))
        }),
        Err(e) => Err(SpawnError::Mount(format!(
            "remount('{}') failed: {}",
            target.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_options_mount_nothing() {
        assert!(apply(&NamespaceOptions::default()).is_ok());
    }
}
