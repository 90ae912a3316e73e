//! Builds mounts with the detached mount API.
//!
//! A new filesystem is set up in a filesystem context (`fsopen(2)`,
//! `fsconfig(2)`), turned into a detached mount (`fsmount(2)`) and only then
//! attached to the tree (`move_mount(2)`).  Until that last step nothing is
//! visible anywhere, so a rejected filesystem type or option leaves no trace.
//! Bind mounts are cloned with `open_tree(2)` and attached the same way.
//! Kernels without the API get the classic `mount(2)` instead.

use std::{
    fmt, fs, io,
    os::fd::{AsFd, OwnedFd},
    path::{Path, PathBuf},
    str::FromStr,
    sync::OnceLock,
};

use log::{debug, info, warn};
use nix::{
    errno::Errno,
    libc::c_ulong,
    mount::{MntFlags, MsFlags},
    unistd,
};
use rustix::{
    fs::CWD,
    mount::{MountAttrFlags, MoveMountFlags, OpenTreeFlags},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    error::ErrorKind,
    sys::{self, FsConfig, Op, SysError},
};

/// Propagation flags.  The kernel only honours them in a `mount(2)` call of
/// their own.
const PROPAGATION: MsFlags = MsFlags::MS_PRIVATE
    .union(MsFlags::MS_SHARED)
    .union(MsFlags::MS_SLAVE)
    .union(MsFlags::MS_UNBINDABLE);

/// Flags that belong to a mount rather than to its superblock.  A bind mount
/// only picks them up through a remount.
const PER_MOUNT: MsFlags = MsFlags::MS_RDONLY
    .union(MsFlags::MS_NOSUID)
    .union(MsFlags::MS_NODEV)
    .union(MsFlags::MS_NOEXEC)
    .union(MsFlags::MS_NOATIME)
    .union(MsFlags::MS_NODIRATIME)
    .union(MsFlags::MS_RELATIME)
    .union(MsFlags::MS_STRICTATIME);

/// Where a mount goes.
///
/// `path` is the target as the caller sees it and is what errors report.
/// `procfd`, when set, is a `/proc` reference (`/proc/<pid>/root/...` or
/// `/proc/self/fd/<n>`) that is used in place of `path`, which lets a mount
/// land in another process's mount namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountTarget {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procfd: Option<PathBuf>,
}

impl MountTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            procfd: None,
        }
    }

    pub fn via(path: impl Into<PathBuf>, procfd: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            procfd: Some(procfd.into()),
        }
    }

    /// `path` as seen from the root of process `pid`.
    pub fn in_process(pid: u32, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let relative = path.strip_prefix("/").unwrap_or(&path);
        let procfd = Path::new("/proc")
            .join(pid.to_string())
            .join("root")
            .join(relative);
        Self::via(path, procfd)
    }

    /// The path the system calls operate on.
    pub fn resolved(&self) -> &Path {
        self.procfd.as_deref().unwrap_or(&self.path)
    }
}

impl fmt::Display for MountTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.procfd {
            Some(procfd) => write!(f, "{} (via {})", self.path.display(), procfd.display()),
            None => write!(f, "{}", self.path.display()),
        }
    }
}

/// A declarative description of one mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    #[serde(default)]
    pub source: Option<String>,
    pub target: MountTarget,
    #[serde(default)]
    pub fstype: Option<String>,
    #[serde(default = "MsFlags::empty", with = "ms_flags")]
    pub flags: MsFlags,
    #[serde(default)]
    pub data: Option<String>,
}

impl MountSpec {
    /// A new filesystem of type `fstype`, with the type doubling as source.
    pub fn new(fstype: &str, target: impl Into<PathBuf>) -> Self {
        Self {
            source: Some(fstype.to_owned()),
            target: MountTarget::new(target),
            fstype: Some(fstype.to_owned()),
            flags: MsFlags::empty(),
            data: None,
        }
    }

    /// A recursive bind mount of `source`.
    pub fn bind(source: impl AsRef<Path>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: Some(source.as_ref().to_string_lossy().into_owned()),
            target: MountTarget::new(target),
            fstype: None,
            flags: MsFlags::MS_BIND | MsFlags::MS_REC,
            data: None,
        }
    }

    /// `procfs`, mounted the way a fresh PID namespace needs it.
    pub fn procfs(target: impl Into<PathBuf>) -> Self {
        Self::new("proc", target)
            .with_flags(MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC)
    }

    /// Changes an existing mount at `target` instead of making a new one:
    /// its propagation type, or its flags when `MS_REMOUNT` is given.
    pub fn modify(target: impl Into<PathBuf>, flags: MsFlags) -> Self {
        Self {
            source: None,
            target: MountTarget::new(target),
            fstype: None,
            flags,
            data: None,
        }
    }

    pub fn with_flags(mut self, flags: MsFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_data(mut self, data: &str) -> Self {
        self.data = Some(data.to_owned());
        self
    }

    pub fn with_target(mut self, target: MountTarget) -> Self {
        self.target = target;
        self
    }

    pub fn is_bind(&self) -> bool {
        self.flags.contains(MsFlags::MS_BIND)
    }

    /// Whether this spec only changes the mount already at its target.
    pub fn is_modification(&self) -> bool {
        self.flags.contains(MsFlags::MS_REMOUNT)
            || (!self.is_bind() && self.fstype.is_none() && !self.propagation().is_empty())
    }

    fn propagation(&self) -> MsFlags {
        self.flags & PROPAGATION
    }
}

impl fmt::Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fstype = if self.is_bind() {
            "bind"
        } else {
            self.fstype.as_deref().unwrap_or("none")
        };
        write!(
            f,
            "{} {} on {}",
            fstype,
            self.source.as_deref().unwrap_or("none"),
            self.target
        )
    }
}

/// Parses the command line form `SOURCE:TARGET:FSTYPE[:OPTIONS]`.
///
/// `OPTIONS` is comma separated.  Mount flags (`ro`, `bind`, `rbind`,
/// `nosuid`, `nodev`, `noexec`, `noatime`, `private`, `rprivate`, `shared`,
/// `slave`, ...) become [`MsFlags`], everything else is passed on as
/// filesystem data.  An `FSTYPE` of `bind` or `none` with a bind option
/// makes a bind mount.
impl FromStr for MountSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(4, ':');
        let (Some(source), Some(target), Some(fstype)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("expected SOURCE:TARGET:FSTYPE[:OPTIONS], got `{s}`"));
        };
        if target.is_empty() {
            return Err(format!("missing mount target in `{s}`"));
        }

        let mut flags = MsFlags::empty();
        let mut data = Vec::new();
        for opt in parts.next().unwrap_or("").split(',').filter(|o| !o.is_empty()) {
            match option_flag(opt) {
                Some(flag) => flags |= flag,
                None => data.push(opt),
            }
        }
        if fstype == "bind" {
            flags |= MsFlags::MS_BIND;
        }

        let fstype = match fstype {
            "" | "none" | "bind" => None,
            other => Some(other.to_owned()),
        };
        let modifies = flags.intersects(PROPAGATION | MsFlags::MS_REMOUNT);
        if fstype.is_none() && !flags.contains(MsFlags::MS_BIND) && !modifies {
            return Err(format!("mount `{s}` needs a filesystem type or a bind option"));
        }

        Ok(Self {
            source: (!source.is_empty()).then(|| source.to_owned()),
            target: MountTarget::new(target),
            fstype,
            flags,
            data: (!data.is_empty()).then(|| data.join(",")),
        })
    }
}

fn option_flag(opt: &str) -> Option<MsFlags> {
    Some(match opt {
        "ro" => MsFlags::MS_RDONLY,
        "nosuid" => MsFlags::MS_NOSUID,
        "nodev" => MsFlags::MS_NODEV,
        "noexec" => MsFlags::MS_NOEXEC,
        "noatime" => MsFlags::MS_NOATIME,
        "nodiratime" => MsFlags::MS_NODIRATIME,
        "relatime" => MsFlags::MS_RELATIME,
        "strictatime" => MsFlags::MS_STRICTATIME,
        "bind" => MsFlags::MS_BIND,
        "rbind" => MsFlags::MS_BIND | MsFlags::MS_REC,
        "private" => MsFlags::MS_PRIVATE,
        "rprivate" => MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        "shared" => MsFlags::MS_SHARED,
        "rshared" => MsFlags::MS_SHARED | MsFlags::MS_REC,
        "slave" => MsFlags::MS_SLAVE,
        "rslave" => MsFlags::MS_SLAVE | MsFlags::MS_REC,
        "unbindable" => MsFlags::MS_UNBINDABLE,
        "runbindable" => MsFlags::MS_UNBINDABLE | MsFlags::MS_REC,
        "remount" => MsFlags::MS_REMOUNT,
        _ => return None,
    })
}

mod ms_flags {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(flags: &MsFlags, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(flags.bits() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<MsFlags, D::Error> {
        let bits = u64::deserialize(d)?;
        Ok(MsFlags::from_bits_truncate(bits as c_ulong))
    }
}

/// One parameter of a filesystem context, as split from a `data` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param<'a> {
    Flag(&'a str),
    Value(&'a str, &'a str),
}

impl<'a> Param<'a> {
    fn as_config(&self) -> FsConfig<'a> {
        match *self {
            Param::Flag(key) => FsConfig::Flag { key },
            Param::Value(key, value) => FsConfig::String { key, value },
        }
    }
}

/// Splits `key=value,flag,...` into parameters.
pub fn parameters(data: &str) -> impl Iterator<Item = Param<'_>> {
    data.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| match p.split_once('=') {
            Some((key, value)) => Param::Value(key, value),
            None => Param::Flag(p),
        })
}

/// Translates the per-mount `MS_*` flags into `MOUNT_ATTR_*` flags.
pub fn mount_attrs(flags: MsFlags) -> MountAttrFlags {
    let mut attrs = MountAttrFlags::empty();
    for (ms, attr) in [
        (MsFlags::MS_RDONLY, MountAttrFlags::MOUNT_ATTR_RDONLY),
        (MsFlags::MS_NOSUID, MountAttrFlags::MOUNT_ATTR_NOSUID),
        (MsFlags::MS_NODEV, MountAttrFlags::MOUNT_ATTR_NODEV),
        (MsFlags::MS_NOEXEC, MountAttrFlags::MOUNT_ATTR_NOEXEC),
        (MsFlags::MS_NODIRATIME, MountAttrFlags::MOUNT_ATTR_NODIRATIME),
    ] {
        if flags.contains(ms) {
            attrs |= attr;
        }
    }

    // relatime is what the kernel does when no atime attribute is given.
    if flags.contains(MsFlags::MS_NOATIME) {
        attrs |= MountAttrFlags::MOUNT_ATTR_NOATIME;
    } else if flags.contains(MsFlags::MS_STRICTATIME) {
        attrs |= MountAttrFlags::MOUNT_ATTR_STRICTATIME;
    }

    attrs
}

/// How far a mount got before it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    /// `fsopen(2)`
    Open,
    /// `fsconfig(2)` with a parameter
    Config,
    /// `fsconfig(2)` with `FSCONFIG_CMD_CREATE`
    Create,
    /// `fsmount(2)`
    Convert,
    /// `open_tree(2)` of a bind source
    Clone,
    /// `move_mount(2)`
    Attach,
    /// read-only remount of a bind mount
    Remount,
    /// propagation change after attaching
    Propagate,
    /// the classic `mount(2)` path
    Classic,
}

impl BuildStage {
    /// Whether a failure at this stage may already have left something
    /// attached.
    pub fn is_after_attach(self) -> bool {
        matches!(self, BuildStage::Remount | BuildStage::Propagate)
    }
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildStage::Open => "open",
            BuildStage::Config => "config",
            BuildStage::Create => "create",
            BuildStage::Convert => "convert",
            BuildStage::Clone => "clone",
            BuildStage::Attach => "attach",
            BuildStage::Remount => "remount",
            BuildStage::Propagate => "propagate",
            BuildStage::Classic => "classic mount",
        })
    }
}

/// A mount that could not be built.
#[derive(Error, Debug)]
#[error("failed to mount {spec} ({stage} stage): {cause}")]
pub struct BuildError {
    pub spec: Box<MountSpec>,
    pub stage: BuildStage,
    pub kind: ErrorKind,
    #[source]
    pub cause: SysError,
}

impl BuildError {
    fn new(spec: &MountSpec, stage: BuildStage, cause: SysError) -> Self {
        Self {
            spec: Box::new(spec.clone()),
            stage,
            kind: classify(stage, &cause),
            cause,
        }
    }
}

fn at(spec: &MountSpec, stage: BuildStage) -> impl FnOnce(SysError) -> BuildError + '_ {
    move |cause| BuildError::new(spec, stage, cause)
}

fn classify(stage: BuildStage, cause: &SysError) -> ErrorKind {
    match stage {
        BuildStage::Open | BuildStage::Classic if cause.errno == Errno::ENODEV => {
            ErrorKind::InvalidMountSpec
        }
        BuildStage::Open if cause.is_unsupported() => ErrorKind::UnsupportedApi,
        BuildStage::Config | BuildStage::Create => ErrorKind::InvalidMountSpec,
        _ => cause.kind(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Opened,
    Configured,
    Created,
}

/// A filesystem context on its way to becoming a mount.
///
/// Dropping it at any point closes the context; nothing has been attached
/// anywhere until [`MountFd::attach`] is called.
#[derive(Debug)]
pub struct DetachedMount {
    fd: OwnedFd,
    fstype: String,
    state: ContextState,
}

impl DetachedMount {
    pub fn open(fstype: &str) -> Result<Self, SysError> {
        let fd = sys::fs_open(fstype)?;
        debug!("opened filesystem context for {fstype}");

        Ok(Self {
            fd,
            fstype: fstype.to_owned(),
            state: ContextState::Opened,
        })
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn configure(&mut self, cfg: &FsConfig<'_>) -> Result<(), SysError> {
        sys::fs_config(self.fd.as_fd(), cfg).map_err(|e| e.with_fstype(Some(self.fstype.as_str())))?;
        self.state = match cfg {
            FsConfig::Create | FsConfig::Reconfigure => ContextState::Created,
            _ => ContextState::Configured,
        };

        Ok(())
    }

    /// Instantiates the superblock.  This is where the kernel validates the
    /// configuration as a whole.
    pub fn create(&mut self) -> Result<(), SysError> {
        self.configure(&FsConfig::Create)?;
        debug!("created {} superblock", self.fstype);

        Ok(())
    }

    pub fn into_mount(self, attrs: MountAttrFlags) -> Result<MountFd, SysError> {
        let fd = sys::fs_mount(self.fd.as_fd(), attrs)
            .map_err(|e| e.with_fstype(Some(self.fstype.as_str())))?;

        Ok(MountFd(fd))
    }
}

/// A detached mount, attached by [`MountFd::attach`] or discarded on drop.
#[derive(Debug)]
pub struct MountFd(OwnedFd);

impl MountFd {
    pub fn attach(self, target: &MountTarget) -> Result<(), SysError> {
        sys::move_mount(
            self.0.as_fd(),
            Path::new(""),
            CWD,
            target.resolved(),
            MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
        )
        .map_err(|e| e.with_target(&target.path).with_procfd(target.procfd.as_deref()))?;
        debug!("attached mount at {target}");

        Ok(())
    }
}

impl AsFd for MountFd {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.0.as_fd()
    }
}

/// Clones the mount at `source`, with everything below it when `recursive`.
pub fn clone_tree(source: &Path, recursive: bool) -> Result<MountFd, SysError> {
    let mut flags = OpenTreeFlags::OPEN_TREE_CLONE;
    if recursive {
        flags |= OpenTreeFlags::AT_RECURSIVE;
    }

    Ok(MountFd(sys::open_tree(CWD, source, flags)?))
}

/// Which mount API [`MountTreeBuilder`] uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountApi {
    /// The detached API when the kernel has it, `mount(2)` otherwise.
    #[default]
    Auto,
    /// The detached API only; a kernel without it is an error.
    Detached,
    /// `mount(2)` only.
    Classic,
}

static DETACHED_SUPPORTED: OnceLock<bool> = OnceLock::new();

/// Whether this kernel implements the detached mount API.  Checked once per
/// process by opening (and closing) a tmpfs context.
pub fn detached_api_supported() -> bool {
    *DETACHED_SUPPORTED.get_or_init(|| match sys::fs_open("tmpfs") {
        Ok(_) => true,
        Err(e) => !e.is_unsupported(),
    })
}

/// Executes [`MountSpec`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct MountTreeBuilder {
    api: MountApi,
}

impl MountTreeBuilder {
    pub fn new(api: MountApi) -> Self {
        Self { api }
    }

    fn use_detached(&self) -> bool {
        match self.api {
            MountApi::Auto => detached_api_supported(),
            MountApi::Detached => true,
            MountApi::Classic => false,
        }
    }

    /// Performs one mount.
    pub fn build(&self, spec: &MountSpec) -> Result<(), BuildError> {
        if spec.is_modification() {
            return self.modify(spec);
        }
        if !self.use_detached() {
            return self.classic(spec);
        }

        let res = if spec.is_bind() {
            self.bind(spec)
        } else {
            self.construct(spec)
        };

        match res {
            Err(e) if e.kind == ErrorKind::UnsupportedApi && self.api == MountApi::Auto => {
                warn!("detached mount API unavailable ({}), using mount(2)", e.cause);
                self.classic(spec)
            }
            res => res,
        }
    }

    /// Performs every mount in order.  On the first failure, the mounts
    /// attached so far are detached again in reverse order before the error
    /// is returned.
    pub fn build_all(&self, specs: &[MountSpec]) -> Result<(), BuildError> {
        for (i, spec) in specs.iter().enumerate() {
            if let Err(e) = self.build(spec) {
                if e.stage.is_after_attach() {
                    rollback(std::slice::from_ref(spec));
                }
                rollback(&specs[..i]);
                return Err(e);
            }
        }
        info!("built {} mounts", specs.len());

        Ok(())
    }

    fn construct(&self, spec: &MountSpec) -> Result<(), BuildError> {
        let fail = |stage| at(spec, stage);
        let fstype = spec.fstype.as_deref().unwrap_or("none");

        let mut ctx = DetachedMount::open(fstype).map_err(fail(BuildStage::Open))?;
        if let Some(source) = spec.source.as_deref() {
            ctx.configure(&FsConfig::String {
                key: "source",
                value: source,
            })
            .map_err(fail(BuildStage::Config))?;
        }
        for param in parameters(spec.data.as_deref().unwrap_or("")) {
            ctx.configure(&param.as_config())
                .map_err(fail(BuildStage::Config))?;
        }
        ctx.create().map_err(fail(BuildStage::Create))?;

        let mnt = ctx
            .into_mount(mount_attrs(spec.flags))
            .map_err(fail(BuildStage::Convert))?;
        mnt.attach(&spec.target).map_err(fail(BuildStage::Attach))?;
        self.propagate(spec)?;
        info!("mounted {spec}");

        Ok(())
    }

    fn bind(&self, spec: &MountSpec) -> Result<(), BuildError> {
        let fail = |stage| at(spec, stage);
        let source = Path::new(spec.source.as_deref().unwrap_or(""));

        let tree = clone_tree(source, spec.flags.contains(MsFlags::MS_REC))
            .map_err(fail(BuildStage::Clone))?;
        tree.attach(&spec.target).map_err(fail(BuildStage::Attach))?;
        self.remount_bind(spec)?;
        self.propagate(spec)?;
        info!("mounted {spec}");

        Ok(())
    }

    fn classic(&self, spec: &MountSpec) -> Result<(), BuildError> {
        let target = &spec.target;
        sys::mount_via(
            spec.source.as_deref(),
            &target.path,
            target.procfd.as_deref(),
            spec.fstype.as_deref(),
            spec.flags - PROPAGATION,
            spec.data.as_deref(),
        )
        .map_err(|cause| BuildError::new(spec, BuildStage::Classic, cause))?;

        if spec.is_bind() {
            self.remount_bind(spec)?;
        }
        self.propagate(spec)?;
        info!("mounted {spec} with mount(2)");

        Ok(())
    }

    /// Bind mounts ignore the per-mount flags when they are created.
    fn remount_bind(&self, spec: &MountSpec) -> Result<(), BuildError> {
        let per_mount = spec.flags & PER_MOUNT;
        if per_mount.is_empty() {
            return Ok(());
        }

        let flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | per_mount;
        sys::mount_via(
            None,
            &spec.target.path,
            spec.target.procfd.as_deref(),
            None,
            flags,
            None,
        )
        .map_err(|cause| BuildError::new(spec, BuildStage::Remount, cause))
    }

    /// Remounts and/or changes the propagation of an existing mount.
    fn modify(&self, spec: &MountSpec) -> Result<(), BuildError> {
        if spec.flags.contains(MsFlags::MS_REMOUNT) {
            let target = &spec.target;
            sys::mount_via(
                spec.source.as_deref(),
                &target.path,
                target.procfd.as_deref(),
                None,
                spec.flags - PROPAGATION,
                spec.data.as_deref(),
            )
            .map_err(|cause| BuildError::new(spec, BuildStage::Remount, cause))?;
        }
        self.propagate(spec)?;
        info!("changed {spec}");

        Ok(())
    }

    fn propagate(&self, spec: &MountSpec) -> Result<(), BuildError> {
        let propagation = spec.propagation();
        if propagation.is_empty() {
            return Ok(());
        }

        sys::mount_via(
            None,
            &spec.target.path,
            spec.target.procfd.as_deref(),
            None,
            propagation | (spec.flags & MsFlags::MS_REC),
            None,
        )
        .map_err(|cause| BuildError::new(spec, BuildStage::Propagate, cause))
    }
}

/// Detaches what `specs` mounted.  Modifications of existing mounts are
/// left alone, the mount they changed was never ours.
fn rollback(specs: &[MountSpec]) {
    for spec in specs.iter().rev().filter(|spec| !spec.is_modification()) {
        match teardown(&spec.target) {
            Ok(_) => debug!("rolled back {spec}"),
            Err(e) => warn!("failed to roll back {spec}: {e}"),
        }
    }
}

/// Lazily unmounts `target`.
///
/// Returns `Ok(false)` when nothing was mounted there, so teardown code can
/// run without knowing how far setup got.
pub fn teardown(target: &MountTarget) -> Result<bool, SysError> {
    match sys::unmount(target.resolved(), MntFlags::MNT_DETACH) {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_mounted() => {
            debug!("{target} was not mounted");
            Ok(false)
        }
        Err(e) => Err(e.with_target(&target.path).with_procfd(target.procfd.as_deref())),
    }
}

/// Tears down `targets` in reverse order, stopping at the first real error.
pub fn teardown_all(targets: &[MountTarget]) -> Result<usize, SysError> {
    let mut unmounted = 0;
    for target in targets.iter().rev() {
        if teardown(target)? {
            unmounted += 1;
        }
    }

    Ok(unmounted)
}

/// Makes every mount below `/` private, so nothing done in a new mount
/// namespace propagates back out of it.
pub fn make_private() -> Result<(), SysError> {
    sys::mount(
        None,
        Path::new("/"),
        None,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None,
    )?;
    debug!("mounted `/` with `MsFlags::MS_PRIVATE`");

    Ok(())
}

/// Makes `new_root` the root of the mount namespace and detaches the old one.
///
/// `new_root` has to be a mount point; callers usually bind mount it onto
/// itself first.
pub fn pivot_root(new_root: &Path) -> Result<(), SysError> {
    unistd::chdir(new_root).map_err(|e| SysError::new(Op::Chdir, e).with_target(new_root))?;

    // Stacks the old root on top of the new one, so it can be unmounted from
    // `.` without needing a directory for it.
    unistd::pivot_root(".", ".")
        .map_err(|e| SysError::new(Op::PivotRoot, e).with_target(new_root))?;
    sys::unmount(Path::new("."), MntFlags::MNT_DETACH)?;

    unistd::chdir("/").map_err(|e| SysError::new(Op::Chdir, e).with_target(Path::new("/")))?;
    info!("pivoted root to {new_root:?}");

    Ok(())
}

/// One line of `/proc/self/mountinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_point: PathBuf,
    pub options: String,
    /// `shared:N`, `master:N` and the like.
    pub optional_fields: Vec<String>,
    pub fstype: String,
    pub source: String,
    pub super_options: String,
}

/// Undoes the octal escapes (`\040` and friends) of `mountinfo` fields.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escape = bytes.get(i + 1..i + 4).filter(|digits| {
            bytes[i] == b'\\' && digits.iter().all(|b| (b'0'..=b'7').contains(b))
        });
        match escape.and_then(|d| u8::from_str_radix(std::str::from_utf8(d).ok()?, 8).ok()) {
            Some(b) => {
                out.push(b);
                i += 4;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parses the contents of a `mountinfo` file, skipping malformed lines.
pub fn parse_mountinfo(text: &str) -> Vec<MountInfo> {
    text.lines()
        .filter_map(|line| {
            let (head, tail) = line.split_once(" - ")?;
            let head: Vec<&str> = head.split(' ').collect();
            let mut tail = tail.split(' ');
            if head.len() < 6 {
                return None;
            }

            Some(MountInfo {
                mount_point: PathBuf::from(unescape(head[4])),
                options: head[5].to_owned(),
                optional_fields: head[6..].iter().map(|f| (*f).to_owned()).collect(),
                fstype: tail.next()?.to_owned(),
                source: unescape(tail.next()?),
                super_options: tail.next().unwrap_or("").to_owned(),
            })
        })
        .collect()
}

/// The mount table of the calling thread's mount namespace.
pub fn mount_table() -> io::Result<Vec<MountInfo>> {
    Ok(parse_mountinfo(&fs::read_to_string(
        "/proc/thread-self/mountinfo",
    )?))
}

/// The topmost mount at exactly `path`, if any.
pub fn find_mount(path: &Path) -> io::Result<Option<MountInfo>> {
    let path = fs::canonicalize(path)?;
    Ok(mount_table()?
        .into_iter()
        .rev()
        .find(|m| m.mount_point == path))
}

pub fn is_mount_point(path: &Path) -> io::Result<bool> {
    Ok(find_mount(path)?.is_some())
}

/// The filesystem type mounted at exactly `path`.
pub fn mount_fstype(path: &Path) -> io::Result<Option<String>> {
    Ok(find_mount(path)?.map(|m| m.fstype))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_data_into_parameters() {
        let params: Vec<_> = parameters("size=64m, mode=0755,,nr_inodes=1k,noswap").collect();
        assert_eq!(
            params,
            [
                Param::Value("size", "64m"),
                Param::Value("mode", "0755"),
                Param::Value("nr_inodes", "1k"),
                Param::Flag("noswap"),
            ]
        );
        assert_eq!(parameters("").count(), 0);
    }

    #[test]
    fn translate_flags_to_attrs() {
        let attrs = mount_attrs(
            MsFlags::MS_RDONLY | MsFlags::MS_NOEXEC | MsFlags::MS_NOATIME | MsFlags::MS_PRIVATE,
        );
        assert_eq!(
            attrs,
            MountAttrFlags::MOUNT_ATTR_RDONLY
                | MountAttrFlags::MOUNT_ATTR_NOEXEC
                | MountAttrFlags::MOUNT_ATTR_NOATIME
        );
        assert!(mount_attrs(MsFlags::MS_BIND | MsFlags::MS_REC).is_empty());
    }

    #[test]
    fn parse_tmpfs_spec() {
        let spec: MountSpec = "tmpfs:/newroot/tmp:tmpfs:nosuid,size=64m".parse().unwrap();
        assert_eq!(spec.source.as_deref(), Some("tmpfs"));
        assert_eq!(spec.target, MountTarget::new("/newroot/tmp"));
        assert_eq!(spec.fstype.as_deref(), Some("tmpfs"));
        assert_eq!(spec.flags, MsFlags::MS_NOSUID);
        assert_eq!(spec.data.as_deref(), Some("size=64m"));
    }

    #[test]
    fn parse_bind_spec() {
        let spec: MountSpec = "/srv/data:/newroot/data:bind:rbind,ro".parse().unwrap();
        assert!(spec.is_bind());
        assert!(spec.flags.contains(MsFlags::MS_REC | MsFlags::MS_RDONLY));
        assert_eq!(spec.fstype, None);
        assert_eq!(spec.data, None);

        assert!("/a:/b:none".parse::<MountSpec>().is_err());
        assert!("/a:/b:none:nosuid".parse::<MountSpec>().is_err());
        assert!("tmpfs::tmpfs".parse::<MountSpec>().is_err());
        assert!("tmpfs".parse::<MountSpec>().is_err());
    }

    #[test]
    fn parse_modification_spec() {
        let spec: MountSpec = ":/newroot:none:rshared".parse().unwrap();
        assert!(spec.is_modification());
        assert_eq!(spec, MountSpec::modify("/newroot", MsFlags::MS_SHARED | MsFlags::MS_REC));

        let spec: MountSpec = ":/newroot/etc:none:remount,bind,ro".parse().unwrap();
        assert!(spec.is_bind());
        assert!(spec.is_modification());

        let spec: MountSpec = ":/newroot/etc:none:remount,ro".parse().unwrap();
        assert!(spec.is_modification());
        assert!(!MountSpec::new("tmpfs", "/tmp").is_modification());
        assert!(!MountSpec::bind("/srv", "/mnt")
            .with_flags(MsFlags::MS_PRIVATE)
            .is_modification());
    }

    #[test]
    fn target_inside_another_process() {
        let target = MountTarget::in_process(4242, "/newroot/tmp");
        assert_eq!(target.path, Path::new("/newroot/tmp"));
        assert_eq!(target.resolved(), Path::new("/proc/4242/root/newroot/tmp"));
        assert_eq!(
            target.to_string(),
            "/newroot/tmp (via /proc/4242/root/newroot/tmp)"
        );
    }

    #[test]
    fn spec_serializes_flags_as_bits() {
        let spec = MountSpec::procfs("/proc");
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(
            json["flags"],
            (MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC).bits() as u64
        );
        assert_eq!(serde_json::from_value::<MountSpec>(json).unwrap(), spec);
    }

    #[test]
    fn unknown_filesystem_is_invalid_spec() {
        let cause = SysError::new(Op::FsOpen, Errno::ENODEV).with_fstype(Some("bogusfs9"));
        let err = BuildError::new(&MountSpec::new("bogusfs9", "/mnt"), BuildStage::Open, cause);
        assert_eq!(err.kind, ErrorKind::InvalidMountSpec);
        assert!(err.to_string().contains("type: bogusfs9"));
    }

    #[test]
    fn classify_by_stage() {
        let unsupported = SysError::new(Op::FsOpen, Errno::ENOSYS);
        assert_eq!(
            classify(BuildStage::Open, &unsupported),
            ErrorKind::UnsupportedApi
        );

        let rejected = SysError::new(Op::FsConfig, Errno::EINVAL);
        assert_eq!(
            classify(BuildStage::Create, &rejected),
            ErrorKind::InvalidMountSpec
        );

        let denied = SysError::new(Op::MoveMount, Errno::EPERM);
        assert_eq!(
            classify(BuildStage::Attach, &denied),
            ErrorKind::SyscallFailure
        );
    }

    #[test]
    fn parse_mountinfo_lines() {
        let text = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
98 22 0:45 / /newroot/tmp rw,nosuid - tmpfs tmpfs rw,size=65536k
99 22 0:46 / /mnt/with\\040space rw - tmpfs none rw
garbage
";
        let mounts = parse_mountinfo(text);
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[1].mount_point, Path::new("/newroot/tmp"));
        assert_eq!(mounts[1].fstype, "tmpfs");
        assert_eq!(mounts[1].options, "rw,nosuid");
        assert_eq!(mounts[1].super_options, "rw,size=65536k");
        assert_eq!(mounts[0].optional_fields, ["shared:1"]);
        assert!(mounts[1].optional_fields.is_empty());
        assert_eq!(mounts[2].mount_point, Path::new("/mnt/with space"));
    }

    #[test]
    fn teardown_of_missing_path_is_an_error() {
        let err = teardown(&MountTarget::new("/nonexistent/nsmount/target")).unwrap_err();
        assert_eq!(err.errno, Errno::ENOENT);
        assert_eq!(err.target.as_deref(), Some(Path::new("/nonexistent/nsmount/target")));
    }
}
