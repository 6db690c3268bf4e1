//! Re-executes the current binary as a detached process carrying a role marker.
use std::{
    env,
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    thread::JoinHandle,
};

use nix::{
    sys::signal::{Signal, killpg},
    unistd::Pid,
};
use tracing::{debug, warn};

use crate::{
    error::LaunchError,
    role::{ROLE_ENV_KEY, Role},
    sink::{Attachment, SharedWriter, Sink, spawn_forwarder},
};

/// Everything needed to start one more copy of a program.
///
/// The inherited environment never contains the role marker; it is appended
/// fresh by [`LaunchDescriptor::command`] on every launch.
#[derive(Debug, Clone)]
pub struct LaunchDescriptor {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    extra_env: Vec<(OsString, OsString)>,
}

impl LaunchDescriptor {
    /// Captures the running executable, its arguments, and its environment.
    pub fn current() -> Result<Self, LaunchError> {
        let program = env::current_exe().map_err(LaunchError::ExecutablePath)?;
        Ok(Self::new(program, env::args_os().skip(1), env::vars_os()))
    }

    /// Builds a descriptor for an arbitrary program.
    pub fn new<P, A, E>(program: P, args: A, env: E) -> Self
    where
        P: Into<PathBuf>,
        A: IntoIterator,
        A::Item: Into<OsString>,
        E: IntoIterator<Item = (OsString, OsString)>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: env
                .into_iter()
                .filter(|(key, _)| key != ROLE_ENV_KEY)
                .collect(),
            extra_env: Vec::new(),
        }
    }

    /// Adds a variable that is injected on top of the inherited environment.
    pub fn with_env<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<OsString>,
        V: Into<OsString>,
    {
        let key = key.into();
        if key == ROLE_ENV_KEY {
            warn!("Ignoring caller-supplied {ROLE_ENV_KEY}; the launcher owns it");
            return self;
        }
        self.extra_env.push((key, value.into()));
        self
    }

    /// Absolute path of the program to start.
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments passed after the program name.
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Builds the command that starts a copy playing `role`.
    ///
    /// Standard input is closed and the child is moved into a new session.
    pub fn command(&self, role: Role) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env_clear()
            .envs(self.env.iter().map(|(k, v)| (k.as_os_str(), v.as_os_str())))
            .envs(
                self.extra_env
                    .iter()
                    .map(|(k, v)| (k.as_os_str(), v.as_os_str())),
            )
            .env(ROLE_ENV_KEY, role.marker())
            .stdin(Stdio::null());
        detach(&mut cmd);
        cmd
    }

    /// Starts a detached copy playing `role` and returns without waiting for it.
    pub fn launch(
        &self,
        role: Role,
        stdout: &Sink,
        stderr: &Sink,
    ) -> Result<Launched, LaunchError> {
        let mut cmd = self.command(role);

        let stdout_forward = wire(stdout, &mut cmd, Stream::Stdout)?;
        let stderr_forward = wire(stderr, &mut cmd, Stream::Stderr)?;

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let mut forwarders = Vec::new();
        let pipes = [
            (stdout_forward, child.stdout.take().map(Pipe::Out)),
            (stderr_forward, child.stderr.take().map(Pipe::Err)),
        ];
        for (target, pipe) in pipes {
            let (Some(writer), Some(pipe)) = (target, pipe) else {
                continue;
            };
            let spawned = match pipe {
                Pipe::Out(out) => spawn_forwarder(out, writer, "stdout"),
                Pipe::Err(err) => spawn_forwarder(err, writer, "stderr"),
            };
            match spawned {
                Ok(handle) => forwarders.push(handle),
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(LaunchError::Sink(err));
                }
            }
        }

        debug!(
            "Launched {} copy of {:?} with pid {}",
            role,
            self.program,
            child.id()
        );

        Ok(Launched { child, forwarders })
    }
}

/// Re-executes the current binary in a new session with the marker for `role`.
pub fn launch_detached(
    stdout: &Sink,
    stderr: &Sink,
    role: Role,
) -> Result<Launched, LaunchError> {
    LaunchDescriptor::current()?.launch(role, stdout, stderr)
}

/// A process started by the launcher, plus the threads draining its pipes.
#[derive(Debug)]
pub struct Launched {
    child: Child,
    forwarders: Vec<JoinHandle<()>>,
}

impl Launched {
    /// Process id of the child.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Polls for exit without blocking; reaps the child when it has exited.
    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Sends `SIGKILL` to the child's process group, falling back to the child
    /// alone when the group cannot be signalled.
    ///
    /// Only valid while the child has not been reaped: an unreaped child keeps
    /// its pid, so the group id cannot have been recycled.
    pub fn kill(&mut self) -> io::Result<()> {
        let pgid = Pid::from_raw(self.child.id() as i32);
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => Ok(()),
            Err(errno) => {
                debug!("killpg({pgid}) failed: {errno}; signalling the child directly");
                self.child.kill()
            }
        }
    }

    /// Blocks until the child exits and its output has been drained.
    pub fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait()?;
        self.join_forwarders();
        Ok(status)
    }

    /// Waits for the output forwarders; call only after the child has exited.
    pub fn join_forwarders(&mut self) {
        for handle in self.forwarders.drain(..) {
            let _ = handle.join();
        }
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

enum Pipe {
    Out(std::process::ChildStdout),
    Err(std::process::ChildStderr),
}

fn wire(
    sink: &Sink,
    cmd: &mut Command,
    stream: Stream,
) -> Result<Option<SharedWriter>, LaunchError> {
    let (stdio, forward) = match sink.attach().map_err(LaunchError::Sink)? {
        Attachment::Direct(stdio) => (stdio, None),
        Attachment::Forward(writer) => (Stdio::piped(), Some(writer)),
    };
    match stream {
        Stream::Stdout => cmd.stdout(stdio),
        Stream::Stderr => cmd.stderr(stdio),
    };
    Ok(forward)
}

#[cfg(unix)]
fn detach(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| nix::unistd::setsid().map(|_| ()).map_err(io::Error::from));
    }
}
