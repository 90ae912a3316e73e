//! Enter Linux namespaces and build a container's mount tree inside them.
//!
//! A controller clones an entering process into fresh namespaces, walks it
//! through joining existing ones and mounting every filesystem of an
//! [`EntryPlan`], and only then lets it exec the entrypoint.  Mounts are made
//! with the detached mount API (`fsopen(2)` and friends) where the kernel has
//! it and with `mount(2)` otherwise.
//!
//! ```no_run
//! use nsmount::{EntryPlan, MountSpec, NamespaceKind, NamespaceSpec};
//!
//! let mut plan = EntryPlan::new(["/bin/sh"]);
//! plan.namespaces = vec![
//!     NamespaceSpec::create(NamespaceKind::User),
//!     NamespaceSpec::create(NamespaceKind::Mount),
//! ];
//! plan.mounts.push(MountSpec::new("tmpfs", "/tmp").with_data("size=64m"));
//!
//! let code = nsmount::attempt(&plan)?.start()?.wait()?;
//! println!("exited with {code}");
//! # Ok::<(), nsmount::Error>(())
//! ```

pub mod error;
pub mod message;
pub mod mount;
pub mod namespace;
pub mod plan;
pub mod sync;
pub mod sys;

pub use error::{Error, ErrorKind, Result};
pub use message::{NamespaceEntryMessage, Stage};
pub use mount::{MountApi, MountSpec, MountTarget, MountTreeBuilder};
pub use namespace::{IdMap, NamespaceKind, NamespaceSpec};
pub use plan::{EntryPlan, JoinOrder};
pub use sync::{attempt, EnteredProcess, RunningProcess};
