//! Command tags
//!
//! The numbering is part of the wire format and must not change.

use crate::MalformedPayload;

/// Top-level request commands (client to server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestCommand {
    /// Adopt an attached socket as a new control connection.
    Connect = 0,
    /// Spawn a child described by a sub-command stream.
    Exec = 1,
    /// Signal a child by its request id.
    Kill = 2,
}

impl TryFrom<u8> for RequestCommand {
    type Error = MalformedPayload;

    fn try_from(value: u8) -> Result<Self, MalformedPayload> {
        match value {
            0 => Ok(RequestCommand::Connect),
            1 => Ok(RequestCommand::Exec),
            2 => Ok(RequestCommand::Kill),
            _ => Err(MalformedPayload),
        }
    }
}

/// Top-level response commands (server to client).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCommand {
    /// A child exited; carries the request id and the raw wait status.
    Exit = 0,
    /// Sent once at startup when the cgroup feature is live.
    CgroupsAvailable = 1,
}

impl TryFrom<u8> for ResponseCommand {
    type Error = MalformedPayload;

    fn try_from(value: u8) -> Result<Self, MalformedPayload> {
        match value {
            0 => Ok(ResponseCommand::Exit),
            1 => Ok(ResponseCommand::CgroupsAvailable),
            _ => Err(MalformedPayload),
        }
    }
}

/// EXEC payload sub-commands, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExecCommand {
    Arg = 0,
    SetEnv = 1,
    Umask = 2,
    Stdin = 3,
    Stdout = 4,
    Stderr = 5,
    StderrPath = 6,
    Control = 7,
    Tty = 8,
    Refence = 9,
    UserNs = 10,
    PidNs = 11,
    NetworkNs = 12,
    NetworkNsName = 13,
    IpcNs = 14,
    MountNs = 15,
    MountProc = 16,
    WritableProc = 17,
    PivotRoot = 18,
    MountHome = 19,
    MountTmpTmpfs = 20,
    MountTmpfs = 21,
    BindMount = 22,
    Hostname = 23,
    Rlimit = 24,
    UidGid = 25,
    SchedIdle = 26,
    IoprioIdle = 27,
    ForbidUserNs = 28,
    ForbidMulticast = 29,
    ForbidBind = 30,
    NoNewPrivs = 31,
    Cgroup = 32,
    CgroupSet = 33,
    Priority = 34,
    Chroot = 35,
    Chdir = 36,
    HookInfo = 37,
    StderrNull = 38,
}

impl TryFrom<u8> for ExecCommand {
    type Error = MalformedPayload;

    fn try_from(value: u8) -> Result<Self, MalformedPayload> {
        use ExecCommand::*;
        Ok(match value {
            0 => Arg,
            1 => SetEnv,
            2 => Umask,
            3 => Stdin,
            4 => Stdout,
            5 => Stderr,
            6 => StderrPath,
            7 => Control,
            8 => Tty,
            9 => Refence,
            10 => UserNs,
            11 => PidNs,
            12 => NetworkNs,
            13 => NetworkNsName,
            14 => IpcNs,
            15 => MountNs,
            16 => MountProc,
            17 => WritableProc,
            18 => PivotRoot,
            19 => MountHome,
            20 => MountTmpTmpfs,
            21 => MountTmpfs,
            22 => BindMount,
            23 => Hostname,
            24 => Rlimit,
            25 => UidGid,
            26 => SchedIdle,
            27 => IoprioIdle,
            28 => ForbidUserNs,
            29 => ForbidMulticast,
            30 => ForbidBind,
            31 => NoNewPrivs,
            32 => Cgroup,
            33 => CgroupSet,
            34 => Priority,
            35 => Chroot,
            36 => Chdir,
            37 => HookInfo,
            38 => StderrNull,
            _ => return Err(MalformedPayload),
        })
    }
}
