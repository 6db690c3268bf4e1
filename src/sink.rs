//! Writable destinations for lifecycle lines and child output.
use std::{
    fmt,
    fs::File,
    io::{self, Read, Write},
    process::Stdio,
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

use tracing::debug;

pub(crate) type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// A cloneable handle to an output stream supplied by the embedding application.
///
/// The same sink is used for lifecycle lines written by the supervisor and for
/// the standard streams of every process it launches.
#[derive(Clone)]
pub struct Sink {
    kind: SinkKind,
}

#[derive(Clone)]
enum SinkKind {
    Null,
    Stdout,
    Stderr,
    File(Arc<File>),
    Writer(SharedWriter),
}

/// How a sink is wired into a child process.
pub(crate) enum Attachment {
    /// The child writes straight into this descriptor.
    Direct(Stdio),
    /// The child writes into a pipe that must be drained into the writer.
    Forward(SharedWriter),
}

impl Sink {
    /// Discards everything.
    pub fn null() -> Self {
        Self {
            kind: SinkKind::Null,
        }
    }

    /// Writes to this process's standard output.
    pub fn stdout() -> Self {
        Self {
            kind: SinkKind::Stdout,
        }
    }

    /// Writes to this process's standard error.
    pub fn stderr() -> Self {
        Self {
            kind: SinkKind::Stderr,
        }
    }

    /// Writes to an already opened file; children receive a duplicate descriptor.
    pub fn file(file: File) -> Self {
        Self {
            kind: SinkKind::File(Arc::new(file)),
        }
    }

    /// Writes to an arbitrary writer such as an in-memory buffer.
    ///
    /// Child output is piped and copied into the writer by a background thread.
    pub fn writer<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            kind: SinkKind::Writer(Arc::new(Mutex::new(Box::new(writer)))),
        }
    }

    /// Writes `line` followed by a newline in a single write call.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut payload = String::with_capacity(line.len() + 1);
        payload.push_str(line);
        payload.push('\n');

        match &self.kind {
            SinkKind::Null => Ok(()),
            SinkKind::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(payload.as_bytes())?;
                out.flush()
            }
            SinkKind::Stderr => io::stderr().lock().write_all(payload.as_bytes()),
            SinkKind::File(file) => {
                let mut file: &File = file;
                file.write_all(payload.as_bytes())
            }
            SinkKind::Writer(writer) => {
                let mut guard = lock_writer(writer);
                guard.write_all(payload.as_bytes())?;
                guard.flush()
            }
        }
    }

    pub(crate) fn attach(&self) -> io::Result<Attachment> {
        let stdio = match &self.kind {
            SinkKind::Null => Stdio::null(),
            SinkKind::Stdout => Stdio::from(io::stdout()),
            SinkKind::Stderr => Stdio::from(io::stderr()),
            SinkKind::File(file) => Stdio::from(file.try_clone()?),
            SinkKind::Writer(writer) => return Ok(Attachment::Forward(writer.clone())),
        };
        Ok(Attachment::Direct(stdio))
    }
}

impl Default for Sink {
    fn default() -> Self {
        Self::null()
    }
}

impl From<File> for Sink {
    fn from(file: File) -> Self {
        Sink::file(file)
    }
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            SinkKind::Null => "null",
            SinkKind::Stdout => "stdout",
            SinkKind::Stderr => "stderr",
            SinkKind::File(_) => "file",
            SinkKind::Writer(_) => "writer",
        };
        f.debug_struct("Sink").field("kind", &kind).finish()
    }
}

fn lock_writer(writer: &SharedWriter) -> std::sync::MutexGuard<'_, Box<dyn Write + Send>> {
    writer
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Copies a child's pipe into a shared writer until the child closes it.
pub(crate) fn spawn_forwarder<R>(
    mut reader: R,
    writer: SharedWriter,
    name: &str,
) -> io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("respawn-{name}"))
        .spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut guard = lock_writer(&writer);
                        if guard.write_all(&buf[..n]).and_then(|_| guard.flush()).is_err()
                        {
                            debug!("output forwarder lost its writer; draining");
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        debug!("output forwarder stopped: {err}");
                        break;
                    }
                }
            }
        })
}
