//! Crate-wide error type.

use std::{io, path::PathBuf, time::Duration};

use nix::errno::Errno;
use thiserror::Error;

use crate::{
    message::{CodecError, Failure, Stage},
    mount::BuildError,
    namespace::NamespaceKind,
    sys::SysError,
};

/// The class of a failure, for callers that need to branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A system call failed; the error carries its arguments.
    SyscallFailure,
    /// The detached mount API is missing from this kernel.
    UnsupportedApi,
    /// The kernel rejected the filesystem type or its parameters.
    InvalidMountSpec,
    /// `setns(2)` or the namespace file it needed could not be used.
    NamespaceJoinFailure,
    /// The entering process did not report in time.
    HandshakeTimeout,
    /// An unmount targeted something that is not a mount point.
    NotMounted,
    /// The handshake channel broke or carried something unexpected.
    Protocol,
    /// The entering process reported a failure of its own.
    ChildFailed,
    /// The plan is inconsistent and was never started.
    InvalidPlan,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Sys(#[from] SysError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("failed to join {kind} namespace at {path:?}: {errno}")]
    NamespaceJoin {
        kind: NamespaceKind,
        path: PathBuf,
        #[source]
        errno: Errno,
    },

    #[error("failed to access {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("no {expected} message within {timeout:?}")]
    HandshakeTimeout { expected: Stage, timeout: Duration },

    #[error("handshake failed while waiting for {expected}: {source}")]
    Handshake {
        expected: Stage,
        #[source]
        source: CodecError,
    },

    #[error("expected {expected}, got {got}")]
    UnexpectedStage { expected: Stage, got: Stage },

    #[error("entering process failed before {}: {}", .0.stage, .0.description)]
    ChildFailed(Failure),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("{op} failed: {errno}")]
    Process { op: &'static str, errno: Errno },

    #[error("failed to drop capabilities: {0}")]
    Capabilities(#[from] caps::errors::CapsError),

    #[error("failed to execute {command:?}: {source}")]
    Exec { command: String, source: io::Error },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Sys(e) => e.kind(),
            Error::Build(e) => e.kind,
            Error::NamespaceJoin { .. } => ErrorKind::NamespaceJoinFailure,
            Error::HandshakeTimeout { .. } => ErrorKind::HandshakeTimeout,
            Error::Handshake { .. } | Error::UnexpectedStage { .. } => ErrorKind::Protocol,
            Error::ChildFailed(_) => ErrorKind::ChildFailed,
            Error::InvalidPlan(_) => ErrorKind::InvalidPlan,
            Error::Io { .. }
            | Error::Process { .. }
            | Error::Capabilities(_)
            | Error::Exec { .. } => ErrorKind::SyscallFailure,
        }
    }

    /// The OS error underneath, if there is one.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Sys(e) => Some(e.errno),
            Error::Build(e) => Some(e.cause.errno),
            Error::NamespaceJoin { errno, .. } | Error::Process { errno, .. } => Some(*errno),
            Error::Io { source, .. } | Error::Exec { source, .. } => {
                source.raw_os_error().map(Errno::from_raw)
            }
            Error::ChildFailed(f) => Some(Errno::from_raw(f.errno)),
            Error::HandshakeTimeout { .. } => Some(Errno::ETIMEDOUT),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::Op;

    #[test]
    fn not_mounted_is_distinguishable() {
        let err = Error::from(SysError::new(Op::Unmount, Errno::EINVAL));
        assert_eq!(err.kind(), ErrorKind::NotMounted);
        assert_eq!(err.errno(), Some(Errno::EINVAL));
    }

    #[test]
    fn child_failure_keeps_its_stage() {
        let err = Error::ChildFailed(Failure {
            stage: Stage::MountSetupComplete,
            errno: Errno::ENODEV as i32,
            description: "fsopen bogusfs9".to_owned(),
        });
        assert_eq!(err.kind(), ErrorKind::ChildFailed);
        assert_eq!(err.errno(), Some(Errno::ENODEV));
        assert!(err.to_string().contains("mount-setup-complete"));
    }
}
