//! Resource limits carried by spawn requests
//!
//! A request may set any subset of the kernel resource limits, addressed by
//! their resource number; each populated entry is applied with setrlimit(2)
//! in the child before exec.

use crate::{Result, SpawnError};

/// Number of rlimit slots understood by the protocol (RLIM_NLIMITS).
pub const RLIMIT_SLOTS: usize = 16;

/// A single soft/hard limit pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitValue {
    pub cur: u64,
    pub max: u64,
}

/// Per-resource limits, indexed by the kernel resource number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    values: [Option<RlimitValue>; RLIMIT_SLOTS],
}

impl ResourceLimits {
    pub fn set(&mut self, resource: usize, value: RlimitValue) -> Result<()> {
        if resource >= RLIMIT_SLOTS {
            return Err(SpawnError::InvalidConfig(format!(
                "Resource limit index {} out of range",
                resource
            )));
        }
        self.values[resource] = Some(value);
        Ok(())
    }

    pub fn get(&self, resource: usize) -> Option<RlimitValue> {
        self.values.get(resource).copied().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }

    /// Apply every populated limit to the current process.
    pub fn apply(&self) -> Result<()> {
        for (resource, value) in self.values.iter().enumerate() {
            let Some(value) = value else { continue };
            let rlim = libc::rlimit {
                rlim_cur: value.cur,
                rlim_max: value.max,
            };
            let ret = unsafe { libc::setrlimit(resource as _, &rlim) };
            if ret != 0 {
                return Err(SpawnError::Syscall(format!(
                    "setrlimit({}) failed: {}",
                    resource_name(resource),
                    std::io::Error::last_os_error()
                )));
            }
        }
        Ok(())
    }
}

fn resource_name(resource: usize) -> &'static str {
    match resource {
        0 => "RLIMIT_CPU",
        1 => "RLIMIT_FSIZE",
        2 => "RLIMIT_DATA",
        3 => "RLIMIT_STACK",
        4 => "RLIMIT_CORE",
        5 => "RLIMIT_RSS",
        6 => "RLIMIT_NPROC",
        7 => "RLIMIT_NOFILE",
        8 => "RLIMIT_MEMLOCK",
        9 => "RLIMIT_AS",
        10 => "RLIMIT_LOCKS",
        11 => "RLIMIT_SIGPENDING",
        12 => "RLIMIT_MSGQUEUE",
        13 => "RLIMIT_NICE",
        14 => "RLIMIT_RTPRIO",
        15 => "RLIMIT_RTTIME",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_empty() {
        let limits = ResourceLimits::default();
        assert!(limits.is_empty());
        assert!(limits.get(0).is_none());
    }

    #[test]
    fn test_set_and_get() {
        let mut limits = ResourceLimits::default();
        let value = RlimitValue { cur: 1024, max: 2048 };
        limits.set(7, value).unwrap();
        assert!(!limits.is_empty());
        assert_eq!(limits.get(7), Some(value));
    }

    #[test]
    fn test_set_out_of_range() {
        let mut limits = ResourceLimits::default();
        let value = RlimitValue { cur: 0, max: 0 };
        assert!(limits.set(RLIMIT_SLOTS, value).is_err());
    }

    #[test]
    fn test_empty_apply_succeeds() {
        assert!(ResourceLimits::default().apply().is_ok());
    }

    #[test]
    fn test_apply_core_limit() {
        // lowering RLIMIT_CORE needs no privileges
        let mut limits = ResourceLimits::default();
        limits.set(4, RlimitValue { cur: 0, max: 0 }).unwrap();
        assert!(limits.apply().is_ok());
    }
}
