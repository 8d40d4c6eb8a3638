//! Cgroup membership of the spawn server process

use std::collections::BTreeMap;

/// Where this process lives in the cgroup hierarchy.
///
/// Initialized once at startup, after the systemd scope has been created.
/// An empty group path disables the cgroup feature entirely.
#[derive(Debug, Clone, Default)]
pub struct CgroupState {
    /// This process's path within the delegated hierarchy, without the
    /// mount point prefix.
    pub group_path: String,
    /// Controller mount point names below /sys/fs/cgroup.
    pub mounts: Vec<String>,
    /// Controller name to the mount point name providing it.
    pub controllers: BTreeMap<String, String>,
}

impl CgroupState {
    pub fn is_enabled(&self) -> bool {
        !self.group_path.is_empty()
    }
}

/// Reads a process's cgroup membership; `None` means the calling process.
pub fn load_cgroup_state(pid: Option<u32>) -> CgroupState {
    let path = match pid {
        Some(pid) => format!("/proc/{}/cgroup", pid),
        None => "/proc/self/cgroup".to_string(),
    };
    match std::fs::read_to_string(&path) {
        Ok(text) => parse_proc_cgroup(&text),
        Err(_) => CgroupState::default(),
    }
}

/// Parses /proc/<pid>/cgroup.
///
/// The systemd-named hierarchy determines the group path; every controller
/// co-mounted at the same path is usable for children. No systemd hierarchy
/// means the feature is disabled.
pub fn parse_proc_cgroup(text: &str) -> CgroupState {
    struct Assignment {
        mount: String,
        path: String,
        controllers: Vec<String>,
    }

    let mut assignments = Vec::new();
    let mut systemd_path = String::new();

    for line in text.lines() {
        // hierarchy-ID:controller-list:path
        let mut parts = line.splitn(3, ':');
        let (Some(id), Some(name), Some(path)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        if id.parse::<u32>().is_err()
            || name.is_empty()
            || !path.starts_with('/')
            || path.starts_with("//")
        {
            continue;
        }

        if name == "name=systemd" {
            systemd_path = path.to_string();
        } else {
            assignments.push(Assignment {
                mount: name.to_string(),
                path: path.to_string(),
                controllers: name.split(',').map(str::to_string).collect(),
            });
        }
    }

    if systemd_path.is_empty() {
        return CgroupState::default();
    }

    let mut state = CgroupState {
        group_path: systemd_path.clone(),
        ..Default::default()
    };
    state.mounts.push("systemd".to_string());

    for assignment in assignments {
        if assignment.path == systemd_path {
            for controller in assignment.controllers {
                state
                    .controllers
                    .insert(controller, assignment.mount.clone());
            }
            state.mounts.push(assignment.mount);
        }
    }

    state
}

#[cfg(test)]
mod tests {
    use super::*;

    const HYBRID: &str = "\
12:pids:/spawnd.scope
11:devices:/
4:cpu,cpuacct:/spawnd.scope
3:memory:/spawnd.scope
1:name=systemd:/spawnd.scope
0::/spawnd.scope
";

    #[test]
    fn test_parse_hybrid_hierarchy() {
        let state = parse_proc_cgroup(HYBRID);
        assert!(state.is_enabled());
        assert_eq!(state.group_path, "/spawnd.scope");
        assert_eq!(
            state.mounts,
            vec!["systemd", "pids", "cpu,cpuacct", "memory"]
        );
        assert_eq!(state.controllers.get("cpu").unwrap(), "cpu,cpuacct");
        assert_eq!(state.controllers.get("cpuacct").unwrap(), "cpu,cpuacct");
        assert_eq!(state.controllers.get("memory").unwrap(), "memory");
        assert_eq!(state.controllers.get("pids").unwrap(), "pids");
        // mounted elsewhere, not delegated to us
        assert!(!state.controllers.contains_key("devices"));
    }

    #[test]
    fn test_no_systemd_hierarchy_disables_the_feature() {
        let state = parse_proc_cgroup("0::/some/path\n4:memory:/some/path\n");
        assert!(!state.is_enabled());
        assert!(state.mounts.is_empty());
    }

    #[test]
    fn test_garbage_lines_are_skipped() {
        let text = "not a cgroup line\n:x:/\nabc:memory:/p\n1:name=systemd:/scope\n";
        let state = parse_proc_cgroup(text);
        assert!(state.is_enabled());
        assert_eq!(state.group_path, "/scope");
        assert_eq!(state.mounts, vec!["systemd"]);
    }

    #[test]
    fn test_default_state_is_disabled() {
        assert!(!CgroupState::default().is_enabled());
    }
}
