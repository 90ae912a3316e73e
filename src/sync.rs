//! The handshake that walks a freshly cloned process into its namespaces.
//!
//! The controller clones the entering process with a `CLONE_NEW*` flag for
//! every namespace the plan creates, sends it the plan and then waits, with a
//! deadline per stage, for it to report each stage in turn:
//!
//! ```text
//! controller                          entering process
//!     | -- namespace-set-ready(plan) -->  |  setns(2) every joined namespace
//!     | <-- namespace-joined ------------ |
//!     | -- ack -------------------------> |  build the mount tree
//!     | <-- mount-setup-complete -------- |
//!     | -- ack -------------------------> |  drop capabilities
//!     | <-- ready-to-exec --------------- |
//!     | -- ack (go-ahead) --------------> |  execve(2)
//! ```
//!
//! The entering process answers a failure at any point with a `fatal-error`
//! message and exits without doing anything further.  The controller kills
//! an entering process that misses a deadline.

use std::{
    ffi::CString,
    io::{self, Read},
    net::Shutdown,
    os::unix::net::UnixStream,
    process::Command,
    time::{Duration, Instant},
};

use caps::CapSet;
use log::{debug, info, warn};
use nix::{
    errno::Errno,
    libc, sched,
    sys::{
        prctl,
        signal::{self, Signal},
        wait::{self, WaitStatus},
    },
    unistd::{self, Pid},
};

use crate::{
    error::{Error, Result},
    message::{CodecError, Failure, NamespaceEntryMessage, Stage},
    mount::{self, MountTarget, MountTreeBuilder},
    namespace::{self, NamespaceKind},
    plan::{EntryPlan, DEFAULT_STAGE_TIMEOUT_MS},
};

/// The size of the stack of the entering process.
const STACK_SIZE: usize = 1000 * 1000 * 8;

/// Exit status of an entering process that gave up.
const FAILURE_STATUS: isize = 127;

/// One end of the socket pair shared by the controller and the entering
/// process of a single attempt.
#[derive(Debug)]
pub struct HandshakeChannel {
    stream: UnixStream,
}

impl HandshakeChannel {
    pub fn pair() -> io::Result<(Self, Self)> {
        let (controller, child) = UnixStream::pair()?;
        Ok((Self { stream: controller }, Self { stream: child }))
    }

    pub fn send(&mut self, msg: &NamespaceEntryMessage) -> Result<(), CodecError> {
        msg.encode(&mut self.stream)
    }

    /// Blocks until the next message arrives or `deadline` passes.
    pub fn recv(&mut self, deadline: Option<Instant>) -> Result<NamespaceEntryMessage, CodecError> {
        let mut reader = DeadlineReader {
            stream: &self.stream,
            deadline,
        };
        NamespaceEntryMessage::decode(&mut reader)
    }

    /// Signals end-of-stream to the other end.
    pub fn close(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("failed to shut down handshake channel: {e}");
        }
    }
}

/// Re-arms the socket timeout before every read, so a message split over
/// several reads still has to arrive before the one deadline.
struct DeadlineReader<'a> {
    stream: &'a UnixStream,
    deadline: Option<Instant>,
}

impl Read for DeadlineReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let timeout = match self.deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(io::ErrorKind::TimedOut.into());
                }
                Some(left)
            }
            None => None,
        };
        self.stream.set_read_timeout(timeout)?;

        let mut stream = self.stream;
        stream.read(buf)
    }
}

/// Where the entering process is in its walk towards exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Start,
    NamespacesJoined,
    MountTreeBuilt,
    ReadyToExec,
    Exec,
    Failed,
}

impl EntryState {
    /// The stage a failure in this state is reported against.
    fn pending(self) -> Stage {
        match self {
            EntryState::Start => Stage::NamespaceJoined,
            EntryState::NamespacesJoined => Stage::MountSetupComplete,
            _ => Stage::ReadyToExec,
        }
    }
}

/// The state machine run by the entering process, first thing after clone.
struct EnteringProcess {
    channel: HandshakeChannel,
    state: EntryState,
    timeout: Duration,
}

impl EnteringProcess {
    fn new(channel: HandshakeChannel) -> Self {
        Self {
            channel,
            state: EntryState::Start,
            timeout: Duration::from_millis(DEFAULT_STAGE_TIMEOUT_MS),
        }
    }

    /// Returns the exit status of the entering process.  Does not return at
    /// all once the entrypoint has been exec'd.
    fn run(mut self) -> isize {
        // The entering process must not outlive a controller that died.
        if let Err(errno) = prctl::set_pdeathsig(Signal::SIGKILL) {
            let err = Error::Process {
                op: "prctl(PR_SET_PDEATHSIG)",
                errno,
            };
            return self.fail(Stage::NamespaceSetReady, &err);
        }

        let plan = match self.receive_plan() {
            Ok(plan) => plan,
            Err(e) => return self.fail(Stage::NamespaceSetReady, &e),
        };
        match self.enter(&plan) {
            Ok(status) => status,
            Err(e) => {
                let stage = self.state.pending();
                self.fail(stage, &e)
            }
        }
    }

    fn receive_plan(&mut self) -> Result<EntryPlan> {
        let expected = Stage::NamespaceSetReady;
        let msg = self
            .channel
            .recv(Some(Instant::now() + self.timeout))
            .map_err(|source| Error::Handshake { expected, source })?;
        let NamespaceEntryMessage::NamespaceSetReady(payload) = msg else {
            return Err(Error::UnexpectedStage {
                expected,
                got: msg.stage(),
            });
        };

        let plan: EntryPlan =
            serde_json::from_slice(&payload).map_err(|e| Error::InvalidPlan(e.to_string()))?;
        plan.validate()?;
        self.timeout = plan.stage_timeout();
        debug!("received plan for {:?}", plan.command);

        Ok(plan)
    }

    fn enter(&mut self, plan: &EntryPlan) -> Result<isize> {
        if plan.creates(NamespaceKind::User) {
            namespace::write_id_maps(&plan.uid_map(), &plan.gid_map())?;
        }
        // Opened now, the path may be gone once the root has been pivoted.
        let deferred = match plan.deferred_join() {
            Some(spec) => namespace::open(spec)?,
            None => None,
        };
        for spec in plan.join_sequence() {
            namespace::enter(spec)?;
        }
        self.advance(
            NamespaceEntryMessage::NamespaceJoined,
            EntryState::NamespacesJoined,
            true,
        )?;

        if plan.creates(NamespaceKind::Mount) {
            mount::make_private()?;
        }
        MountTreeBuilder::new(plan.mount_api).build_all(&plan.mounts)?;
        if let Some(rootfs) = &plan.rootfs {
            mount::pivot_root(rootfs)?;
        }
        if let Some(ns) = deferred {
            ns.enter()?;
        }
        self.advance(
            NamespaceEntryMessage::MountSetupComplete,
            EntryState::MountTreeBuilt,
            true,
        )?;

        if plan.drop_capabilities {
            drop_capabilities()?;
        }
        // The go-ahead comes whenever the controller's caller is ready for
        // it, so there is no deadline on it.
        self.advance(
            NamespaceEntryMessage::ReadyToExec,
            EntryState::ReadyToExec,
            false,
        )?;

        self.state = EntryState::Exec;
        self.exec(plan)
    }

    /// Reports a stage and waits for it to be acknowledged.
    fn advance(
        &mut self,
        msg: NamespaceEntryMessage,
        next: EntryState,
        bounded: bool,
    ) -> Result<()> {
        let reached = msg.stage();
        self.channel
            .send(&msg)
            .map_err(|source| Error::Handshake {
                expected: Stage::Ack,
                source,
            })?;

        let deadline = bounded.then(|| Instant::now() + self.timeout);
        match self.channel.recv(deadline) {
            Ok(NamespaceEntryMessage::Ack) => {}
            Ok(other) => {
                return Err(Error::UnexpectedStage {
                    expected: Stage::Ack,
                    got: other.stage(),
                })
            }
            Err(CodecError::Timeout) => {
                return Err(Error::HandshakeTimeout {
                    expected: Stage::Ack,
                    timeout: self.timeout,
                })
            }
            Err(source) => {
                return Err(Error::Handshake {
                    expected: Stage::Ack,
                    source,
                })
            }
        }

        self.state = next;
        debug!("{reached} acknowledged");
        Ok(())
    }

    fn exec(&mut self, plan: &EntryPlan) -> Result<isize> {
        for (key, value) in &plan.env {
            std::env::set_var(key, value);
        }
        let program = &plan.command[0];

        if plan.spawns_entrypoint() {
            // A joined PID namespace only takes effect for children.
            let mut child = Command::new(program)
                .args(&plan.command[1..])
                .spawn()
                .map_err(|source| Error::Exec {
                    command: program.clone(),
                    source,
                })?;
            self.channel.close();
            info!("spawned {program} as {} inside the PID namespace", child.id());

            let status = child.wait().map_err(|source| Error::Exec {
                command: program.clone(),
                source,
            })?;
            return Ok(status.code().map_or(FAILURE_STATUS, |code| code as isize));
        }

        let args = plan
            .command
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::Exec {
                command: program.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, e),
            })?;
        info!("executing {:?}", plan.command);

        // The channel is close-on-exec; the controller sees it close once
        // execve(2) succeeds.
        match unistd::execvp(&args[0], &args) {
            Ok(never) => match never {},
            Err(errno) => Err(Error::Exec {
                command: program.clone(),
                source: errno.into(),
            }),
        }
    }

    fn fail(mut self, stage: Stage, err: &Error) -> isize {
        self.state = EntryState::Failed;
        warn!("entering process failed before {stage}: {err}");

        let failure = Failure {
            stage,
            errno: err.errno().map_or(0, |errno| errno as i32),
            description: err.to_string(),
        };
        if let Err(e) = self.channel.send(&NamespaceEntryMessage::FatalError(failure)) {
            debug!("could not report the failure: {e}");
        }

        FAILURE_STATUS
    }
}

/// Clears every capability set of the calling thread.
fn drop_capabilities() -> Result<()> {
    // Effective has to go before permitted, it may never exceed it.
    caps::clear(None, CapSet::Ambient)?;
    caps::clear(None, CapSet::Inheritable)?;
    caps::clear(None, CapSet::Effective)?;
    caps::clear(None, CapSet::Permitted)?;
    debug!("dropped all capabilities");

    Ok(())
}

/// The controller's side of one attempt.
#[derive(Debug)]
pub struct Controller {
    pid: Pid,
    channel: HandshakeChannel,
    timeout: Duration,
    /// Targets to unmount if the attempt is torn down.
    cleanup: Vec<MountTarget>,
    /// Set once the process has been reaped or handed to a
    /// [`RunningProcess`].
    settled: bool,
}

impl Controller {
    /// Validates `plan` and clones the entering process.
    pub fn spawn(plan: &EntryPlan) -> Result<Self> {
        plan.validate()?;
        let cleanup = cleanup_targets(plan);

        let (controller_end, child_end) = HandshakeChannel::pair().map_err(|e| Error::Process {
            op: "socketpair",
            errno: e.raw_os_error().map_or(Errno::UnknownErrno, Errno::from_raw),
        })?;
        let mut ends = (Some(controller_end), Some(child_end));

        let mut stack = vec![0u8; STACK_SIZE];
        // SAFETY: without CLONE_VM the child runs on a copy of our address
        // space, and only touches what the callback owns.
        let pid = unsafe {
            sched::clone(
                Box::new(|| {
                    drop(ends.0.take());
                    match ends.1.take() {
                        Some(channel) => EnteringProcess::new(channel).run(),
                        None => FAILURE_STATUS,
                    }
                }),
                &mut stack,
                plan.clone_flags(),
                Some(libc::SIGCHLD),
            )
        }
        .map_err(|errno| Error::Process { op: "clone", errno })?;
        info!(
            "cloned entering process {pid} with {:?}",
            plan.clone_flags()
        );

        let (controller_end, child_end) = ends;
        drop(child_end);
        let channel = controller_end.ok_or(Error::Process {
            op: "socketpair",
            errno: Errno::EBADF,
        })?;

        Ok(Self {
            pid,
            channel,
            timeout: plan.stage_timeout(),
            cleanup,
            settled: false,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Drives the entering process up to `ready-to-exec`.  Any failure kills
    /// it and tears down what it left behind.
    pub fn run(mut self, plan: &EntryPlan) -> Result<EnteredProcess> {
        match self.handshake(plan) {
            Ok(()) => {
                info!("entering process {} is ready to exec", self.pid);
                Ok(EnteredProcess(self))
            }
            Err(e) => {
                warn!("namespace entry of {} failed: {e}", self.pid);
                self.abort();
                Err(e)
            }
        }
    }

    fn handshake(&mut self, plan: &EntryPlan) -> Result<()> {
        let payload = serde_json::to_vec(plan).map_err(|e| Error::InvalidPlan(e.to_string()))?;
        self.channel
            .send(&NamespaceEntryMessage::NamespaceSetReady(payload))
            .map_err(|source| Error::Handshake {
                expected: Stage::NamespaceSetReady,
                source,
            })?;

        for stage in [Stage::NamespaceJoined, Stage::MountSetupComplete] {
            self.expect(stage)?;
            self.ack(stage)?;
        }
        self.expect(Stage::ReadyToExec)
    }

    fn expect(&mut self, expected: Stage) -> Result<()> {
        let timeout = self.timeout;
        let msg = self
            .channel
            .recv(Some(Instant::now() + timeout))
            .map_err(|source| match source {
                CodecError::Timeout => Error::HandshakeTimeout { expected, timeout },
                source => Error::Handshake { expected, source },
            })?;

        match msg {
            NamespaceEntryMessage::FatalError(failure) => Err(Error::ChildFailed(failure)),
            msg if msg.stage() == expected => {
                debug!("entering process {} reached {expected}", self.pid);
                Ok(())
            }
            msg => Err(Error::UnexpectedStage {
                expected,
                got: msg.stage(),
            }),
        }
    }

    fn ack(&mut self, stage: Stage) -> Result<()> {
        self.channel
            .send(&NamespaceEntryMessage::Ack)
            .map_err(|source| Error::Handshake {
                expected: stage,
                source,
            })
    }

    /// After the go-ahead the channel either closes, because execve(2)
    /// closed it, or carries the reason exec failed.
    fn confirm_exec(&mut self) -> Result<()> {
        let expected = Stage::ReadyToExec;
        let timeout = self.timeout;
        match self.channel.recv(Some(Instant::now() + timeout)) {
            Err(CodecError::Closed) => Ok(()),
            Err(CodecError::Timeout) => Err(Error::HandshakeTimeout { expected, timeout }),
            Err(source) => Err(Error::Handshake { expected, source }),
            Ok(NamespaceEntryMessage::FatalError(failure)) => Err(Error::ChildFailed(failure)),
            Ok(msg) => Err(Error::UnexpectedStage {
                expected,
                got: msg.stage(),
            }),
        }
    }

    /// Kills and reaps the entering process, then unmounts whatever it may
    /// have left in our mount namespace.
    fn abort(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;

        match signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("failed to kill entering process {}: {e}", self.pid),
        }
        match wait::waitpid(self.pid, None) {
            Ok(status) => debug!("entering process {} ended: {status:?}", self.pid),
            Err(e) => warn!("failed to reap entering process {}: {e}", self.pid),
        }
        self.channel.close();

        for target in self.cleanup.iter().rev() {
            match mount::teardown(target) {
                Ok(true) => info!("tore down {target}"),
                Ok(false) => {}
                Err(e) => warn!("failed to tear down {target}: {e}"),
            }
        }
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if !self.settled {
            debug!("entering process {} dropped before it was started", self.pid);
            self.abort();
        }
    }
}

/// Mount targets in the controller's own mount namespace that are not yet
/// mount points, and so may safely be unmounted on abort.
fn cleanup_targets(plan: &EntryPlan) -> Vec<MountTarget> {
    if !plan.shares_mount_namespace() {
        return Vec::new();
    }

    plan.mounts
        .iter()
        .filter(|spec| !spec.is_modification())
        .map(|spec| &spec.target)
        .filter(|target| matches!(mount::is_mount_point(target.resolved()), Ok(false)))
        .cloned()
        .collect()
}

/// An entering process that reached `ready-to-exec` and waits for the
/// go-ahead.
#[derive(Debug)]
pub struct EnteredProcess(Controller);

impl EnteredProcess {
    pub fn pid(&self) -> Pid {
        self.0.pid
    }

    /// Gives the go-ahead and returns once the entrypoint runs.
    pub fn start(mut self) -> Result<RunningProcess> {
        let controller = &mut self.0;
        let res = controller
            .ack(Stage::ReadyToExec)
            .and_then(|()| controller.confirm_exec());

        match res {
            Ok(()) => {
                controller.settled = true;
                info!("entrypoint of {} started", controller.pid);
                Ok(RunningProcess {
                    pid: controller.pid,
                })
            }
            Err(e) => {
                controller.abort();
                Err(e)
            }
        }
    }

    /// Kills the entering process instead of starting it.
    pub fn abort(mut self) {
        self.0.abort();
    }
}

/// The container entrypoint, running.
#[derive(Debug)]
pub struct RunningProcess {
    pid: Pid,
}

impl RunningProcess {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Waits for the entrypoint to end.  A signal `n` is reported as
    /// `128 + n`, like a shell does.
    pub fn wait(self) -> Result<i32> {
        loop {
            match wait::waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(errno) => return Err(Error::Process { op: "waitpid", errno }),
            }
        }
    }
}

/// Enters the namespaces of `plan` and builds its mount tree in a new
/// process, returning once that process is ready to exec.
pub fn attempt(plan: &EntryPlan) -> Result<EnteredProcess> {
    Controller::spawn(plan)?.run(plan)
}
