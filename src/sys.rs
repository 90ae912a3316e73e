//! Typed wrappers around the mount-related system calls.
//!
//! Every wrapper returns a [`SysError`] on failure that records the operation
//! together with every argument it was called with, so that a failed mount
//! can be diagnosed from the error alone.  Nothing in here retries.

use std::{
    fmt,
    os::fd::{BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
};

use log::debug;
use nix::{
    errno::Errno,
    mount::{self, MntFlags, MsFlags},
};
use rustix::mount::{
    FsMountFlags, FsOpenFlags, MountAttrFlags, MoveMountFlags, OpenTreeFlags,
};
use thiserror::Error;

use crate::error::ErrorKind;

/// The system call a [`SysError`] originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Mount,
    Unmount,
    OpenTree,
    FsOpen,
    FsConfig,
    FsMount,
    MoveMount,
    PivotRoot,
    Chdir,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Op::Mount => "mount",
            Op::Unmount => "unmount",
            Op::OpenTree => "open_tree",
            Op::FsOpen => "fsopen",
            Op::FsConfig => "fsconfig",
            Op::FsMount => "fsmount",
            Op::MoveMount => "move_mount",
            Op::PivotRoot => "pivot_root",
            Op::Chdir => "chdir",
        })
    }
}

/// A failed mount-related system call.
///
/// Renders as `op source:target (via procfd), flags: 0x.., data: ..: errno`,
/// leaving out whatever was not supplied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", self.describe())]
pub struct SysError {
    pub op: Op,
    pub src: Option<String>,
    pub target: Option<PathBuf>,
    pub procfd: Option<PathBuf>,
    pub fstype: Option<String>,
    pub key: Option<String>,
    pub flags: u64,
    pub data: Option<String>,
    #[source]
    pub errno: Errno,
}

impl SysError {
    pub fn new(op: Op, errno: Errno) -> Self {
        Self {
            op,
            src: None,
            target: None,
            procfd: None,
            fstype: None,
            key: None,
            flags: 0,
            data: None,
            errno,
        }
    }

    pub fn with_source(mut self, src: Option<&str>) -> Self {
        self.src = src.map(str::to_owned);
        self
    }

    pub fn with_target(mut self, target: &Path) -> Self {
        self.target = Some(target.to_path_buf());
        self
    }

    pub fn with_procfd(mut self, procfd: Option<&Path>) -> Self {
        self.procfd = procfd.map(Path::to_path_buf);
        self
    }

    pub fn with_fstype(mut self, fstype: Option<&str>) -> Self {
        self.fstype = fstype.map(str::to_owned);
        self
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.key = Some(key.to_owned());
        self
    }

    pub fn with_flags(mut self, flags: u64) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_data(mut self, data: Option<&str>) -> Self {
        self.data = data.map(str::to_owned);
        self
    }

    /// An unmount of something that is not a mount point.
    pub fn is_not_mounted(&self) -> bool {
        self.op == Op::Unmount && self.errno == Errno::EINVAL
    }

    /// The kernel does not implement the system call at all.
    pub fn is_unsupported(&self) -> bool {
        is_unsupported(self.errno)
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_not_mounted() {
            ErrorKind::NotMounted
        } else if self.is_unsupported() {
            ErrorKind::UnsupportedApi
        } else {
            ErrorKind::SyscallFailure
        }
    }

    fn describe(&self) -> String {
        let mut out = format!("{} ", self.op);

        let target = self
            .target
            .as_deref()
            .map(|t| t.display().to_string())
            .unwrap_or_default();
        match &self.src {
            Some(src) if !src.is_empty() => out += &format!("{src}:{target}"),
            _ => out += &target,
        }
        if let Some(procfd) = &self.procfd {
            out += &format!(" (via {})", procfd.display());
        }
        if let Some(fstype) = &self.fstype {
            out += &format!(", type: {fstype}");
        }
        if let Some(key) = &self.key {
            out += &format!(", key: {key}");
        }
        if self.flags != 0 {
            out += &format!(", flags: {:#x}", self.flags);
        }
        if let Some(data) = self.data.as_deref().filter(|d| !d.is_empty()) {
            out += &format!(", data: {data}");
        }

        out += &format!(": {}", self.errno);
        out
    }
}

/// Returns `true` for the errno a kernel without the detached mount API
/// hands back.
pub fn is_unsupported(errno: Errno) -> bool {
    errno == Errno::ENOSYS
}

fn from_rustix(err: rustix::io::Errno) -> Errno {
    Errno::from_raw(err.raw_os_error())
}

/// Classic `mount(2)`.
pub fn mount(
    source: Option<&str>,
    target: &Path,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<(), SysError> {
    mount_via(source, target, None, fstype, flags, data)
}

/// Classic `mount(2)` where `procfd`, if present, is mounted on instead of
/// `target`.  `target` then only serves as context for the error.
pub fn mount_via(
    source: Option<&str>,
    target: &Path,
    procfd: Option<&Path>,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<(), SysError> {
    let dst = procfd.unwrap_or(target);
    mount::mount(source, dst, fstype, flags, data).map_err(|errno| {
        SysError::new(Op::Mount, errno)
            .with_source(source)
            .with_target(target)
            .with_procfd(procfd)
            .with_fstype(fstype)
            .with_flags(flags.bits() as u64)
            .with_data(data)
    })?;
    debug!("mount {source:?} -> {dst:?} (type {fstype:?}, flags {flags:?})");

    Ok(())
}

/// `umount2(2)`.  [`MntFlags::MNT_DETACH`] detaches now and cleans up once
/// the mount is no longer busy, [`MntFlags::MNT_FORCE`] forces it.
pub fn unmount(target: &Path, flags: MntFlags) -> Result<(), SysError> {
    mount::umount2(target, flags).map_err(|errno| {
        SysError::new(Op::Unmount, errno)
            .with_target(target)
            .with_flags(flags.bits() as u64)
    })?;
    debug!("unmounted {target:?} ({flags:?})");

    Ok(())
}

/// `open_tree(2)`: a descriptor for the mount at `path`, or a detached copy
/// of it when [`OpenTreeFlags::OPEN_TREE_CLONE`] is set.
pub fn open_tree(
    dir_fd: BorrowedFd<'_>,
    path: &Path,
    flags: OpenTreeFlags,
) -> Result<OwnedFd, SysError> {
    let flags = flags | OpenTreeFlags::OPEN_TREE_CLOEXEC;
    rustix::mount::open_tree(dir_fd, path, flags).map_err(|err| {
        SysError::new(Op::OpenTree, from_rustix(err))
            .with_target(path)
            .with_flags(u64::from(flags.bits()))
    })
}

/// `fsopen(2)`: a fresh filesystem context for `fstype`.
pub fn fs_open(fstype: &str) -> Result<OwnedFd, SysError> {
    rustix::mount::fsopen(fstype, FsOpenFlags::FSOPEN_CLOEXEC).map_err(|err| {
        SysError::new(Op::FsOpen, from_rustix(err)).with_fstype(Some(fstype))
    })
}

/// One `fsconfig(2)` command.
///
/// Each kind of value the kernel accepts has its own variant, so a value can
/// never be paired with the wrong command.
#[derive(Debug, Clone, Copy)]
pub enum FsConfig<'a> {
    Flag { key: &'a str },
    String { key: &'a str, value: &'a str },
    Binary { key: &'a str, value: &'a [u8] },
    Path { key: &'a str, path: &'a Path, dir_fd: BorrowedFd<'a> },
    PathEmpty { key: &'a str, fd: BorrowedFd<'a> },
    Fd { key: &'a str, fd: BorrowedFd<'a> },
    Create,
    Reconfigure,
}

impl FsConfig<'_> {
    pub fn key(&self) -> Option<&str> {
        match self {
            FsConfig::Flag { key }
            | FsConfig::String { key, .. }
            | FsConfig::Binary { key, .. }
            | FsConfig::Path { key, .. }
            | FsConfig::PathEmpty { key, .. }
            | FsConfig::Fd { key, .. } => Some(key),
            FsConfig::Create | FsConfig::Reconfigure => None,
        }
    }
}

/// `fsconfig(2)` on an open filesystem context.
pub fn fs_config(fs_fd: BorrowedFd<'_>, cmd: &FsConfig<'_>) -> Result<(), SysError> {
    use rustix::mount as rm;

    let res = match *cmd {
        FsConfig::Flag { key } => rm::fsconfig_set_flag(fs_fd, key),
        FsConfig::String { key, value } => rm::fsconfig_set_string(fs_fd, key, value),
        FsConfig::Binary { key, value } => rm::fsconfig_set_binary(fs_fd, key, value),
        FsConfig::Path { key, path, dir_fd } => rm::fsconfig_set_path(fs_fd, key, path, dir_fd),
        FsConfig::PathEmpty { key, fd } => rm::fsconfig_set_path_empty(fs_fd, key, fd),
        FsConfig::Fd { key, fd } => rm::fsconfig_set_fd(fs_fd, key, fd),
        FsConfig::Create => rm::fsconfig_create(fs_fd),
        FsConfig::Reconfigure => rm::fsconfig_reconfigure(fs_fd),
    };

    res.map_err(|err| {
        let mut e = SysError::new(Op::FsConfig, from_rustix(err));
        if let Some(key) = cmd.key() {
            e = e.with_key(key);
        }
        match cmd {
            FsConfig::String { value, .. } => e.with_data(Some(*value)),
            FsConfig::Path { path, .. } => e.with_target(path),
            FsConfig::Create => e.with_data(Some("create")),
            FsConfig::Reconfigure => e.with_data(Some("reconfigure")),
            _ => e,
        }
    })
}

/// `fsmount(2)`: turns a created context into a detached mount.
pub fn fs_mount(fs_fd: BorrowedFd<'_>, attrs: MountAttrFlags) -> Result<OwnedFd, SysError> {
    rustix::mount::fsmount(fs_fd, FsMountFlags::FSMOUNT_CLOEXEC, attrs).map_err(|err| {
        SysError::new(Op::FsMount, from_rustix(err)).with_flags(u64::from(attrs.bits()))
    })
}

/// `move_mount(2)`.
pub fn move_mount(
    from_fd: BorrowedFd<'_>,
    from_path: &Path,
    to_dir_fd: BorrowedFd<'_>,
    to_path: &Path,
    flags: MoveMountFlags,
) -> Result<(), SysError> {
    rustix::mount::move_mount(from_fd, from_path, to_dir_fd, to_path, flags).map_err(|err| {
        let src = from_path.to_string_lossy();
        SysError::new(Op::MoveMount, from_rustix(err))
            .with_source(Some(&src))
            .with_target(to_path)
            .with_flags(u64::from(flags.bits()))
    })?;
    debug!("move_mount {from_path:?} -> {to_path:?}");

    Ok(())
}
