//! Namespaces the entering process creates or joins.
//!
//! Namespaces that are created fresh are requested through the flags passed
//! to `clone(2)`.  Namespaces that already exist are joined with `setns(2)`
//! on a namespace file such as `/proc/<pid>/ns/net`.

use std::{
    fmt,
    fs::{self, File},
    path::{Path, PathBuf},
    str::FromStr,
};

use log::debug;
use nix::{
    sched::{self, CloneFlags},
    unistd::{Gid, Uid},
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    User,
    Mount,
    Pid,
    Network,
    Ipc,
    Uts,
    Cgroup,
}

impl NamespaceKind {
    pub const ALL: [NamespaceKind; 7] = [
        NamespaceKind::User,
        NamespaceKind::Mount,
        NamespaceKind::Pid,
        NamespaceKind::Network,
        NamespaceKind::Ipc,
        NamespaceKind::Uts,
        NamespaceKind::Cgroup,
    ];

    pub fn clone_flag(self) -> CloneFlags {
        match self {
            NamespaceKind::User => CloneFlags::CLONE_NEWUSER,
            NamespaceKind::Mount => CloneFlags::CLONE_NEWNS,
            NamespaceKind::Pid => CloneFlags::CLONE_NEWPID,
            NamespaceKind::Network => CloneFlags::CLONE_NEWNET,
            NamespaceKind::Ipc => CloneFlags::CLONE_NEWIPC,
            NamespaceKind::Uts => CloneFlags::CLONE_NEWUTS,
            NamespaceKind::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        }
    }

    /// Name of the namespace file under `/proc/<pid>/ns/`.
    pub fn proc_name(self) -> &'static str {
        match self {
            NamespaceKind::User => "user",
            NamespaceKind::Mount => "mnt",
            NamespaceKind::Pid => "pid",
            NamespaceKind::Network => "net",
            NamespaceKind::Ipc => "ipc",
            NamespaceKind::Uts => "uts",
            NamespaceKind::Cgroup => "cgroup",
        }
    }

    /// Position in the canonical join order.
    ///
    /// An existing user namespace is joined last: once the process is in a
    /// user namespace it does not own, it has lost the capabilities needed
    /// to join the remaining ones.
    fn join_rank(self) -> u8 {
        match self {
            NamespaceKind::Cgroup => 0,
            NamespaceKind::Ipc => 1,
            NamespaceKind::Uts => 2,
            NamespaceKind::Network => 3,
            NamespaceKind::Pid => 4,
            NamespaceKind::Mount => 5,
            NamespaceKind::User => 6,
        }
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

impl FromStr for NamespaceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "user" => NamespaceKind::User,
            "mnt" | "mount" => NamespaceKind::Mount,
            "pid" => NamespaceKind::Pid,
            "net" | "network" => NamespaceKind::Network,
            "ipc" => NamespaceKind::Ipc,
            "uts" => NamespaceKind::Uts,
            "cgroup" => NamespaceKind::Cgroup,
            _ => return Err(format!("unknown namespace kind `{s}`")),
        })
    }
}

/// One namespace of the plan: created fresh when `path` is `None`, joined
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSpec {
    pub kind: NamespaceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl NamespaceSpec {
    pub fn create(kind: NamespaceKind) -> Self {
        Self { kind, path: None }
    }

    pub fn join(kind: NamespaceKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: Some(path.into()),
        }
    }

    /// Joins the namespace of `kind` that process `pid` lives in.
    pub fn join_process(kind: NamespaceKind, pid: u32) -> Self {
        Self::join(kind, format!("/proc/{pid}/ns/{}", kind.proc_name()))
    }

    pub fn is_join(&self) -> bool {
        self.path.is_some()
    }
}

/// Accepts `KIND` (create) or `KIND=PATH` (join).
impl FromStr for NamespaceSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((kind, path)) if !path.is_empty() => Ok(Self::join(kind.parse()?, path)),
            Some(_) => Err(format!("missing namespace path in `{s}`")),
            None => Ok(Self::create(s.parse()?)),
        }
    }
}

/// Sorts joins into the canonical order.  The sort is stable, so specs of
/// the same kind keep their relative order.
pub fn canonical_order(specs: &mut [&NamespaceSpec]) {
    specs.sort_by_key(|spec| spec.kind.join_rank());
}

/// Moves the calling process into the namespace at `spec.path`.
///
/// Does nothing for a namespace that is created fresh, since `clone(2)`
/// already put the process into it.
pub fn enter(spec: &NamespaceSpec) -> Result<()> {
    match open(spec)? {
        Some(ns) => ns.enter(),
        None => Ok(()),
    }
}

/// A namespace file opened ahead of joining it.
#[derive(Debug)]
pub struct OpenNamespace {
    kind: NamespaceKind,
    path: PathBuf,
    file: File,
}

/// Opens the namespace file of a join.  `None` for a namespace to create.
pub fn open(spec: &NamespaceSpec) -> Result<Option<OpenNamespace>> {
    let Some(path) = &spec.path else {
        return Ok(None);
    };

    let file = File::open(path).map_err(|e| Error::NamespaceJoin {
        kind: spec.kind,
        path: path.clone(),
        errno: e
            .raw_os_error()
            .map_or(nix::errno::Errno::UnknownErrno, nix::errno::Errno::from_raw),
    })?;

    Ok(Some(OpenNamespace {
        kind: spec.kind,
        path: path.clone(),
        file,
    }))
}

impl OpenNamespace {
    pub fn kind(&self) -> NamespaceKind {
        self.kind
    }

    pub fn enter(self) -> Result<()> {
        sched::setns(&self.file, self.kind.clone_flag()).map_err(|errno| Error::NamespaceJoin {
            kind: self.kind,
            path: self.path.clone(),
            errno,
        })?;
        debug!("joined {} namespace at {:?}", self.kind, self.path);

        Ok(())
    }
}

/// One line of a `uid_map` or `gid_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub inside: u32,
    pub outside: u32,
    #[serde(default = "one")]
    pub count: u32,
}

fn one() -> u32 {
    1
}

impl IdMap {
    /// Maps `id` onto itself.
    pub fn identity(id: u32) -> Self {
        Self {
            inside: id,
            outside: id,
            count: 1,
        }
    }

    pub fn current_uid() -> Self {
        Self::identity(Uid::current().as_raw())
    }

    pub fn current_gid() -> Self {
        Self::identity(Gid::current().as_raw())
    }

    pub fn to_map_line(&self) -> String {
        format!("\t{}\t{}\t{}\n", self.inside, self.outside, self.count)
    }
}

fn write_proc(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Writes the id maps of a freshly created user namespace from inside it.
///
/// `setgroups(2)` is denied first, which the kernel requires before an
/// unprivileged process may write its `gid_map`.  The maps of a namespace
/// can only be written once.
pub fn write_id_maps(uid: &IdMap, gid: &IdMap) -> Result<()> {
    write_proc(Path::new("/proc/self/setgroups"), "deny\n")?;
    debug!("setgroups deny");

    write_proc(Path::new("/proc/self/uid_map"), &uid.to_map_line())?;
    debug!("mapped UID {} to {} (count {})", uid.inside, uid.outside, uid.count);

    write_proc(Path::new("/proc/self/gid_map"), &gid.to_map_line())?;
    debug!("mapped GID {} to {} (count {})", gid.inside, gid.outside, gid.count);

    Ok(())
}
