//! What one namespace-entry attempt is supposed to do.
//!
//! The controller validates an [`EntryPlan`], derives the `clone(2)` flags
//! from it and ships the whole plan to the entering process as JSON in the
//! first handshake message.

use std::{collections::BTreeMap, fs, path::{Path, PathBuf}, time::Duration};

use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    mount::{MountApi, MountSpec},
    namespace::{self, IdMap, NamespaceKind, NamespaceSpec},
};

/// Default deadline for each handshake stage.
pub const DEFAULT_STAGE_TIMEOUT_MS: u64 = 10_000;

fn default_stage_timeout_ms() -> u64 {
    DEFAULT_STAGE_TIMEOUT_MS
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinOrder {
    /// Cgroup, ipc, uts, net, pid, mnt, and an existing user namespace last.
    #[default]
    Canonical,
    /// Exactly the order of [`EntryPlan::namespaces`].
    AsGiven,
    /// Canonical, but an existing user namespace is joined only once the
    /// mount tree has been built, while the process still holds the
    /// capabilities of its original user namespace.
    DeferUser,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPlan {
    #[serde(default)]
    pub namespaces: Vec<NamespaceSpec>,
    #[serde(default)]
    pub join_order: JoinOrder,
    /// Id maps for a fresh user namespace; 1:1 maps of the caller's ids
    /// when left out.
    #[serde(default)]
    pub uid_map: Option<IdMap>,
    #[serde(default)]
    pub gid_map: Option<IdMap>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(default)]
    pub mount_api: MountApi,
    /// Pivoted into once all mounts are in place.
    #[serde(default)]
    pub rootfs: Option<PathBuf>,
    #[serde(default)]
    pub drop_capabilities: bool,
    #[serde(default = "default_stage_timeout_ms")]
    pub stage_timeout_ms: u64,
    /// The entrypoint, `argv[0]` first.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for EntryPlan {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            join_order: JoinOrder::default(),
            uid_map: None,
            gid_map: None,
            mounts: Vec::new(),
            mount_api: MountApi::default(),
            rootfs: None,
            drop_capabilities: false,
            stage_timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
            command: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

impl EntryPlan {
    pub fn new<S: Into<String>>(command: impl IntoIterator<Item = S>) -> Self {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text)
            .map_err(|e| Error::InvalidPlan(format!("{}: {e}", path.display())))
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(Error::InvalidPlan("no command to execute".to_owned()));
        }
        if self.stage_timeout_ms == 0 {
            return Err(Error::InvalidPlan("stage timeout must not be zero".to_owned()));
        }
        for kind in NamespaceKind::ALL {
            if self.namespaces.iter().filter(|ns| ns.kind == kind).count() > 1 {
                return Err(Error::InvalidPlan(format!("{kind} namespace listed twice")));
            }
        }
        if (self.uid_map.is_some() || self.gid_map.is_some()) && !self.creates(NamespaceKind::User)
        {
            return Err(Error::InvalidPlan(
                "id maps need a fresh user namespace".to_owned(),
            ));
        }
        if let Some(spec) = self.mounts.iter().find(|m| m.target.path.as_os_str().is_empty()) {
            return Err(Error::InvalidPlan(format!("mount `{spec}` has no target")));
        }
        // pivot_root(2) moves the root of every process in the namespace.
        if self.rootfs.is_some() && self.shares_mount_namespace() {
            return Err(Error::InvalidPlan(
                "rootfs needs its own mount namespace".to_owned(),
            ));
        }

        Ok(())
    }

    pub fn creates(&self, kind: NamespaceKind) -> bool {
        self.namespaces.iter().any(|ns| ns.kind == kind && !ns.is_join())
    }

    pub fn joins(&self, kind: NamespaceKind) -> bool {
        self.namespaces.iter().any(|ns| ns.kind == kind && ns.is_join())
    }

    /// Flags for every namespace created fresh.
    pub fn clone_flags(&self) -> CloneFlags {
        self.namespaces
            .iter()
            .filter(|ns| !ns.is_join())
            .fold(CloneFlags::empty(), |flags, ns| flags | ns.kind.clone_flag())
    }

    /// Existing namespaces to join, in the order they are joined.
    pub fn join_sequence(&self) -> Vec<&NamespaceSpec> {
        let mut joins: Vec<_> = self.namespaces.iter().filter(|ns| ns.is_join()).collect();
        match self.join_order {
            JoinOrder::Canonical => namespace::canonical_order(&mut joins),
            JoinOrder::AsGiven => {}
            JoinOrder::DeferUser => {
                joins.retain(|ns| ns.kind != NamespaceKind::User);
                namespace::canonical_order(&mut joins);
            }
        }
        joins
    }

    /// The user namespace join held back until after the mount tree is
    /// built, if any.
    pub fn deferred_join(&self) -> Option<&NamespaceSpec> {
        if self.join_order != JoinOrder::DeferUser {
            return None;
        }
        self.namespaces
            .iter()
            .find(|ns| ns.kind == NamespaceKind::User && ns.is_join())
    }

    /// Whether the mounts land in the controller's own mount namespace.
    pub fn shares_mount_namespace(&self) -> bool {
        !self
            .namespaces
            .iter()
            .any(|ns| ns.kind == NamespaceKind::Mount)
    }

    /// A joined PID namespace only applies to children of the joining
    /// process, so the entrypoint has to be spawned rather than exec'd.
    pub fn spawns_entrypoint(&self) -> bool {
        self.joins(NamespaceKind::Pid)
    }

    pub fn uid_map(&self) -> IdMap {
        self.uid_map.unwrap_or_else(IdMap::current_uid)
    }

    pub fn gid_map(&self) -> IdMap {
        self.gid_map.unwrap_or_else(IdMap::current_gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> EntryPlan {
        EntryPlan::new(["/bin/true"])
    }

    #[test]
    fn command_is_required() {
        let err = EntryPlan::default().validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidPlan);
        assert!(plan().validate().is_ok());
    }

    #[test]
    fn namespace_kinds_are_unique() {
        let mut plan = plan();
        plan.namespaces = vec![
            NamespaceSpec::create(NamespaceKind::Network),
            NamespaceSpec::join(NamespaceKind::Network, "/proc/1/ns/net"),
        ];
        assert!(plan.validate().is_err());
    }

    #[test]
    fn id_maps_need_user_namespace() {
        let mut plan = plan();
        plan.uid_map = Some(IdMap::identity(0));
        assert!(plan.validate().is_err());

        plan.namespaces.push(NamespaceSpec::create(NamespaceKind::User));
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn rootfs_needs_mount_namespace() {
        let mut plan = plan();
        plan.rootfs = Some(PathBuf::from("/newroot"));
        assert!(plan.validate().is_err());

        plan.namespaces.push(NamespaceSpec::create(NamespaceKind::Mount));
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn only_fresh_namespaces_become_clone_flags() {
        let mut plan = plan();
        plan.namespaces = vec![
            NamespaceSpec::create(NamespaceKind::User),
            NamespaceSpec::create(NamespaceKind::Mount),
            NamespaceSpec::join(NamespaceKind::Network, "/proc/1/ns/net"),
        ];
        assert_eq!(
            plan.clone_flags(),
            CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS
        );
        assert!(!plan.shares_mount_namespace());
        assert_eq!(plan.join_sequence().len(), 1);
    }

    #[test]
    fn join_order_as_given() {
        let mut plan = plan();
        plan.namespaces = vec![
            NamespaceSpec::join(NamespaceKind::User, "/proc/1/ns/user"),
            NamespaceSpec::join(NamespaceKind::Ipc, "/proc/1/ns/ipc"),
        ];
        assert_eq!(plan.join_sequence()[0].kind, NamespaceKind::Ipc);

        plan.join_order = JoinOrder::AsGiven;
        assert_eq!(plan.join_sequence()[0].kind, NamespaceKind::User);
        assert!(plan.deferred_join().is_none());
    }

    #[test]
    fn user_join_deferred_past_mounts() {
        let mut plan = plan();
        plan.namespaces = vec![
            NamespaceSpec::join(NamespaceKind::User, "/proc/1/ns/user"),
            NamespaceSpec::join(NamespaceKind::Mount, "/proc/1/ns/mnt"),
            NamespaceSpec::join(NamespaceKind::Ipc, "/proc/1/ns/ipc"),
        ];
        plan.join_order = JoinOrder::DeferUser;

        let kinds: Vec<_> = plan.join_sequence().iter().map(|ns| ns.kind).collect();
        assert_eq!(kinds, [NamespaceKind::Ipc, NamespaceKind::Mount]);
        assert_eq!(plan.deferred_join().unwrap().kind, NamespaceKind::User);

        let order: JoinOrder = serde_json::from_str(r#""defer-user""#).unwrap();
        assert_eq!(order, JoinOrder::DeferUser);

        // A created user namespace has nothing to defer.
        plan.namespaces[0] = NamespaceSpec::create(NamespaceKind::User);
        assert!(plan.deferred_join().is_none());
    }

    #[test]
    fn joined_pid_namespace_spawns() {
        let mut plan = plan();
        plan.namespaces = vec![NamespaceSpec::create(NamespaceKind::Pid)];
        assert!(!plan.spawns_entrypoint());

        plan.namespaces = vec![NamespaceSpec::join(NamespaceKind::Pid, "/proc/1/ns/pid")];
        assert!(plan.spawns_entrypoint());
    }

    #[test]
    fn plan_file_defaults() {
        let plan: EntryPlan = serde_json::from_str(
            r#"{
                "namespaces": [{"kind": "mount"}, {"kind": "network", "path": "/proc/1/ns/net"}],
                "mounts": [{"source": "tmpfs", "target": {"path": "/newroot/tmp"},
                            "fstype": "tmpfs", "data": "size=64m"}],
                "command": ["/bin/sh"]
            }"#,
        )
        .unwrap();

        assert_eq!(plan.stage_timeout(), Duration::from_secs(10));
        assert_eq!(plan.mount_api, MountApi::Auto);
        assert_eq!(plan.join_order, JoinOrder::Canonical);
        assert_eq!(plan.mounts[0].flags, nix::mount::MsFlags::empty());
        assert_eq!(plan.mounts[0].data.as_deref(), Some("size=64m"));
        assert!(plan.joins(NamespaceKind::Network));
        assert!(plan.creates(NamespaceKind::Mount));
        assert!(plan.validate().is_ok());
    }
}
