//! Seccomp filter construction using seccompiler
//!
//! All filters default to allow and only name what is forbidden. A
//! seccompiler filter carries a single match action, so each action class
//! (kill, EAFNOSUPPORT, EPERM, EACCES) compiles to its own BPF program; the
//! kernel evaluates every installed filter and the most restrictive result
//! wins.

use crate::table::syscall_number;
use log::debug;
use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
    SeccompRule, TargetArch, apply_filter,
};
use spawnd_core::{Result, SpawnError};
use std::collections::BTreeMap;

/// The system calls which are forbidden unconditionally.
const FORBIDDEN_SYSCALLS: &[&str] = &[
    "acct",
    "add_key",
    "adjtimex",
    "bpf",
    "clock_adjtime",
    "clock_settime",
    "create_module",
    "delete_module",
    "fanotify_init",
    "fanotify_mark",
    "finit_module",
    "get_kernel_syms",
    "get_mempolicy",
    "init_module",
    "ioperm",
    "iopl",
    "kcmp",
    "kexec_file_load",
    "kexec_load",
    "keyctl",
    "lookup_dcookie",
    "mbind",
    "move_pages",
    "name_to_handle_at",
    "nfsservctl",
    "perf_event_open",
    "personality",
    "process_vm_readv",
    "process_vm_writev",
    // ptrace() is dangerous because it allows breaking out of namespaces
    "ptrace",
    "query_module",
    "quotactl",
    "reboot",
    "request_key",
    "set_mempolicy",
    "setns",
    "settimeofday",
    "stime",
    "swapoff",
    "swapon",
    "sysfs",
    "syslog",
    "_sysctl",
    "uselib",
    "userfaultfd",
    "ustat",
    "vm86",
    "vm86old",
];

/// Socket domains children may use; anything else gets EAFNOSUPPORT.
/// Must stay sorted.
const ALLOWED_SOCKET_DOMAINS: &[u64] = &[
    libc::AF_UNIX as u64,
    libc::AF_INET as u64,
    libc::AF_INET6 as u64,
];

const FORBIDDEN_IP_OPTIONS: &[libc::c_int] = &[
    libc::IP_ADD_MEMBERSHIP,
    libc::IP_ADD_SOURCE_MEMBERSHIP,
    libc::IP_BLOCK_SOURCE,
    libc::IP_DROP_MEMBERSHIP,
    libc::IP_DROP_SOURCE_MEMBERSHIP,
    libc::IP_MULTICAST_ALL,
    libc::IP_MULTICAST_IF,
    libc::IP_MULTICAST_LOOP,
    libc::IP_MULTICAST_TTL,
    libc::IP_UNBLOCK_SOURCE,
];

const FORBIDDEN_IPV6_OPTIONS: &[libc::c_int] = &[
    libc::IPV6_ADD_MEMBERSHIP,
    libc::IPV6_DROP_MEMBERSHIP,
    libc::IPV6_MULTICAST_HOPS,
    libc::IPV6_MULTICAST_IF,
    libc::IPV6_MULTICAST_LOOP,
];

/// Per-child filter extensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterOptions {
    pub forbid_user_ns: bool,
    pub forbid_multicast: bool,
    pub forbid_bind: bool,
}

/// A compiled set of BPF programs ready to install.
pub struct FilterSet {
    programs: Vec<BpfProgram>,
}

impl FilterSet {
    /// Installs every program.
    ///
    /// Requires PR_SET_NO_NEW_PRIVS or CAP_SYS_ADMIN, per seccomp(2).
    pub fn apply(&self) -> Result<()> {
        for program in &self.programs {
            apply_filter(program).map_err(|e| {
                SpawnError::Seccomp(format!("Failed to apply seccomp filter: {}", e))
            })?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

/// Builds the filter set for one child.
pub fn build(options: &FilterOptions) -> Result<FilterSet> {
    let mut programs = Vec::new();

    if let Some(rules) = denylist_rules() {
        programs.push(compile(rules, SeccompAction::KillProcess)?);
    }
    if let Some(rules) = socket_domain_rules()? {
        programs.push(compile(rules, errno(libc::EAFNOSUPPORT))?);
    }
    if options.forbid_user_ns
        && let Some(rules) = user_namespace_rules()?
    {
        programs.push(compile(rules, errno(libc::EPERM))?);
    }
    if options.forbid_multicast
        && let Some(rules) = multicast_rules()?
    {
        programs.push(compile(rules, errno(libc::EPERM))?);
    }
    if options.forbid_bind
        && let Some(rules) = bind_rules()
    {
        programs.push(compile(rules, errno(libc::EACCES))?);
    }

    Ok(FilterSet { programs })
}

fn errno(value: libc::c_int) -> SeccompAction {
    SeccompAction::Errno(value as u32)
}

fn target_arch() -> TargetArch {
    #[cfg(target_arch = "x86_64")]
    {
        TargetArch::x86_64
    }
    #[cfg(target_arch = "aarch64")]
    {
        TargetArch::aarch64
    }
}

fn compile(
    rules: BTreeMap<i64, Vec<SeccompRule>>,
    match_action: SeccompAction,
) -> Result<BpfProgram> {
    let filter = SeccompFilter::new(rules, SeccompAction::Allow, match_action, target_arch())
        .map_err(|e| SpawnError::Seccomp(format!("Failed to create filter: {}", e)))?;
    let program: BpfProgram = filter
        .try_into()
        .map_err(|e| SpawnError::Seccomp(format!("Failed to compile filter: {}", e)))?;
    Ok(program)
}

fn condition(arg: u8, op: SeccompCmpOp, value: u64) -> Result<SeccompCondition> {
    SeccompCondition::new(arg, SeccompCmpArgLen::Dword, op, value)
        .map_err(|e| SpawnError::Seccomp(format!("Invalid filter condition: {}", e)))
}

fn rule(conditions: Vec<SeccompCondition>) -> Result<SeccompRule> {
    SeccompRule::new(conditions)
        .map_err(|e| SpawnError::Seccomp(format!("Invalid filter rule: {}", e)))
}

/// Unconditional kill rules for the denylist; unknown names are skipped.
fn denylist_rules() -> Option<BTreeMap<i64, Vec<SeccompRule>>> {
    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    for name in FORBIDDEN_SYSCALLS {
        match syscall_number(name) {
            Some(number) => {
                rules.entry(number).or_default();
            }
            None => debug!("Syscall '{}' unknown on this architecture, skipping", name),
        }
    }
    (!rules.is_empty()).then_some(rules)
}

/// Matches every socket(2) domain outside the whitelist: one rule below the
/// first entry, one per gap, one above the last.
fn socket_domain_rules() -> Result<Option<BTreeMap<i64, Vec<SeccompRule>>>> {
    let Some(socket) = syscall_number("socket") else {
        return Ok(None);
    };

    let first = ALLOWED_SOCKET_DOMAINS[0];
    let last = ALLOWED_SOCKET_DOMAINS[ALLOWED_SOCKET_DOMAINS.len() - 1];

    let mut rules = Vec::new();
    rules.push(rule(vec![condition(0, SeccompCmpOp::Lt, first)?])?);
    for pair in ALLOWED_SOCKET_DOMAINS.windows(2) {
        for domain in pair[0] + 1..pair[1] {
            rules.push(rule(vec![condition(0, SeccompCmpOp::Eq, domain)?])?);
        }
    }
    rules.push(rule(vec![condition(0, SeccompCmpOp::Gt, last)?])?);

    let mut map = BTreeMap::new();
    map.insert(socket, rules);
    Ok(Some(map))
}

/// Refuses unshare(2) and clone(2) whenever CLONE_NEWUSER is in the flags.
fn user_namespace_rules() -> Result<Option<BTreeMap<i64, Vec<SeccompRule>>>> {
    let mask = libc::CLONE_NEWUSER as u64;
    let mut map = BTreeMap::new();
    for name in ["unshare", "clone"] {
        if let Some(number) = syscall_number(name) {
            let cond = SeccompCondition::new(
                0,
                SeccompCmpArgLen::Qword,
                SeccompCmpOp::MaskedEq(mask),
                mask,
            )
            .map_err(|e| SpawnError::Seccomp(format!("Invalid filter condition: {}", e)))?;
            map.insert(number, vec![rule(vec![cond])?]);
        }
    }
    Ok((!map.is_empty()).then_some(map))
}

/// Refuses the multicast-related setsockopt(2) options.
fn multicast_rules() -> Result<Option<BTreeMap<i64, Vec<SeccompRule>>>> {
    let Some(setsockopt) = syscall_number("setsockopt") else {
        return Ok(None);
    };

    let mut rules = Vec::new();
    for (level, options) in [
        (libc::IPPROTO_IP, FORBIDDEN_IP_OPTIONS),
        (libc::IPPROTO_IPV6, FORBIDDEN_IPV6_OPTIONS),
    ] {
        for &option in options {
            rules.push(rule(vec![
                condition(1, SeccompCmpOp::Eq, level as u64)?,
                condition(2, SeccompCmpOp::Eq, option as u64)?,
            ])?);
        }
    }

    let mut map = BTreeMap::new();
    map.insert(setsockopt, rules);
    Ok(Some(map))
}

/// Refuses bind(2) and listen(2) outright.
fn bind_rules() -> Option<BTreeMap<i64, Vec<SeccompRule>>> {
    let mut map: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    for name in ["bind", "listen"] {
        if let Some(number) = syscall_number(name) {
            map.entry(number).or_default();
        }
    }
    (!map.is_empty()).then_some(map)
}
