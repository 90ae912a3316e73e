//! Messages exchanged over the handshake channel.
//!
//! A frame is a stage code (`u32`, native endian).  The two stages that carry
//! a payload follow it with a `u32` length and that many bytes.  Both ends run
//! the same binary, so there is no versioning.

use std::{
    fmt,
    io::{self, Read, Write},
};

use thiserror::Error;

/// Largest payload accepted from the other end.
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// Size of the fixed part of a [`Failure`] payload (stage + errno).
const FAILURE_HEADER: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Stage {
    /// Controller to entering process: namespaces exist, here is the plan.
    NamespaceSetReady = 1,
    /// Every requested namespace has been joined.
    NamespaceJoined = 2,
    /// Every mount of the plan is in place.
    MountSetupComplete = 3,
    /// Nothing left to do but exec.
    ReadyToExec = 4,
    /// Controller to entering process: go on with the next stage.
    Ack = 5,
    FatalError = 6,
}

impl Stage {
    fn has_payload(self) -> bool {
        matches!(self, Stage::NamespaceSetReady | Stage::FatalError)
    }
}

impl TryFrom<u32> for Stage {
    type Error = CodecError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => Stage::NamespaceSetReady,
            2 => Stage::NamespaceJoined,
            3 => Stage::MountSetupComplete,
            4 => Stage::ReadyToExec,
            5 => Stage::Ack,
            6 => Stage::FatalError,
            _ => return Err(CodecError::UnknownStage(code)),
        })
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::NamespaceSetReady => "namespace-set-ready",
            Stage::NamespaceJoined => "namespace-joined",
            Stage::MountSetupComplete => "mount-setup-complete",
            Stage::ReadyToExec => "ready-to-exec",
            Stage::Ack => "ack",
            Stage::FatalError => "fatal-error",
        })
    }
}

/// What the entering process reports when it gives up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// The stage that was being worked towards.
    pub stage: Stage,
    pub errno: i32,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceEntryMessage {
    /// Carries the JSON encoded plan.
    NamespaceSetReady(Vec<u8>),
    NamespaceJoined,
    MountSetupComplete,
    ReadyToExec,
    Ack,
    FatalError(Failure),
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("channel closed by the other end")]
    Closed,
    #[error("deadline expired")]
    Timeout,
    #[error("unknown stage code {0}")]
    UnknownStage(u32),
    #[error("payload of {0} bytes exceeds the limit")]
    PayloadTooLarge(usize),
    #[error("truncated fatal-error payload")]
    Truncated,
    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for CodecError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => CodecError::Closed,
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => CodecError::Timeout,
            _ => CodecError::Io(err),
        }
    }
}

impl NamespaceEntryMessage {
    pub fn stage(&self) -> Stage {
        match self {
            NamespaceEntryMessage::NamespaceSetReady(_) => Stage::NamespaceSetReady,
            NamespaceEntryMessage::NamespaceJoined => Stage::NamespaceJoined,
            NamespaceEntryMessage::MountSetupComplete => Stage::MountSetupComplete,
            NamespaceEntryMessage::ReadyToExec => Stage::ReadyToExec,
            NamespaceEntryMessage::Ack => Stage::Ack,
            NamespaceEntryMessage::FatalError(_) => Stage::FatalError,
        }
    }

    /// The message announcing that `stage` has been reached, for stages
    /// without a payload.
    pub fn reached(stage: Stage) -> Option<Self> {
        match stage {
            Stage::NamespaceJoined => Some(NamespaceEntryMessage::NamespaceJoined),
            Stage::MountSetupComplete => Some(NamespaceEntryMessage::MountSetupComplete),
            Stage::ReadyToExec => Some(NamespaceEntryMessage::ReadyToExec),
            Stage::Ack => Some(NamespaceEntryMessage::Ack),
            Stage::NamespaceSetReady | Stage::FatalError => None,
        }
    }

    pub fn encode<W: Write>(&self, w: &mut W) -> Result<(), CodecError> {
        let payload = match self {
            NamespaceEntryMessage::NamespaceSetReady(plan) => Some(plan.clone()),
            NamespaceEntryMessage::FatalError(failure) => {
                let mut buf = Vec::with_capacity(FAILURE_HEADER + failure.description.len());
                buf.extend_from_slice(&(failure.stage as u32).to_ne_bytes());
                buf.extend_from_slice(&failure.errno.to_ne_bytes());
                buf.extend_from_slice(failure.description.as_bytes());
                Some(buf)
            }
            _ => None,
        };

        let mut frame = Vec::with_capacity(8 + payload.as_ref().map_or(0, Vec::len));
        frame.extend_from_slice(&(self.stage() as u32).to_ne_bytes());
        if let Some(payload) = payload {
            if payload.len() > MAX_PAYLOAD {
                return Err(CodecError::PayloadTooLarge(payload.len()));
            }
            frame.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
            frame.extend_from_slice(&payload);
        }

        // One write per frame, so a reader never sees half a header.
        w.write_all(&frame)?;
        w.flush()?;
        Ok(())
    }

    pub fn decode<R: Read>(r: &mut R) -> Result<Self, CodecError> {
        let stage = Stage::try_from(read_u32(r)?)?;
        if !stage.has_payload() {
            return NamespaceEntryMessage::reached(stage).ok_or(CodecError::UnknownStage(stage as u32));
        }

        let len = read_u32(r)? as usize;
        if len > MAX_PAYLOAD {
            return Err(CodecError::PayloadTooLarge(len));
        }
        let mut payload = vec![0u8; len];
        r.read_exact(&mut payload)?;

        match stage {
            Stage::NamespaceSetReady => Ok(NamespaceEntryMessage::NamespaceSetReady(payload)),
            _ => decode_failure(&payload).map(NamespaceEntryMessage::FatalError),
        }
    }
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, CodecError> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_ne_bytes(buf))
}

fn decode_failure(payload: &[u8]) -> Result<Failure, CodecError> {
    if payload.len() < FAILURE_HEADER {
        return Err(CodecError::Truncated);
    }
    let (header, description) = payload.split_at(FAILURE_HEADER);
    let stage = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
    let errno = i32::from_ne_bytes([header[4], header[5], header[6], header[7]]);

    Ok(Failure {
        stage: Stage::try_from(stage)?,
        errno,
        description: String::from_utf8_lossy(description).into_owned(),
    })
}
