//! Launching, owning and killing the server process.

use std::env;
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::InstanceConfig;
use crate::error::{HarnessError, Result};

/// How long `terminate` waits for the stderr forwarder to hit EOF after the
/// process has been reaped.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long `kill_now` polls for the killed process to be reaped.
const DROP_REAP_TIMEOUT: Duration = Duration::from_millis(500);

/// A writer shared between the stderr forwarder and teardown notes.
pub type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Where the server's stderr goes. Its stdout is always discarded.
#[derive(Default)]
pub enum DiagnosticSink {
    /// Share the test process's own stderr.
    #[default]
    Inherit,
    /// Drop everything.
    Discard,
    /// Write straight into a file.
    File(File),
    /// Forward line by line into a caller-supplied writer.
    Writer(SharedWriter),
    /// Re-emit each line as a `tracing` event with target `etcd`.
    Tracing,
}

impl DiagnosticSink {
    /// Wrap any writer (a `Vec<u8>` buffer, a log file, ...).
    pub fn writer(writer: impl Write + Send + 'static) -> Self {
        DiagnosticSink::Writer(Arc::new(Mutex::new(Box::new(writer))))
    }

    /// A handle the harness writes its own teardown messages to. `None`
    /// when the sink discards output or is `tracing` itself.
    pub(crate) fn note_writer(&self) -> Option<SharedWriter> {
        let boxed = |w: Box<dyn Write + Send>| Arc::new(Mutex::new(w));
        match self {
            DiagnosticSink::Inherit => Some(boxed(Box::new(io::stderr()))),
            DiagnosticSink::Writer(writer) => Some(Arc::clone(writer)),
            DiagnosticSink::File(file) => file.try_clone().ok().map(|f| boxed(Box::new(f))),
            DiagnosticSink::Discard | DiagnosticSink::Tracing => None,
        }
    }

    fn into_stdio(self) -> (Stdio, Option<Forward>) {
        match self {
            DiagnosticSink::Inherit => (Stdio::inherit(), None),
            DiagnosticSink::Discard => (Stdio::null(), None),
            DiagnosticSink::File(file) => (Stdio::from(file), None),
            DiagnosticSink::Writer(writer) => (Stdio::piped(), Some(Forward::Writer(writer))),
            DiagnosticSink::Tracing => (Stdio::piped(), Some(Forward::Tracing)),
        }
    }
}

impl From<File> for DiagnosticSink {
    fn from(file: File) -> Self {
        DiagnosticSink::File(file)
    }
}

impl fmt::Debug for DiagnosticSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiagnosticSink::Inherit => f.write_str("Inherit"),
            DiagnosticSink::Discard => f.write_str("Discard"),
            DiagnosticSink::File(file) => f.debug_tuple("File").field(file).finish(),
            DiagnosticSink::Writer(_) => f.write_str("Writer(..)"),
            DiagnosticSink::Tracing => f.write_str("Tracing"),
        }
    }
}

/// Destination of piped stderr lines.
enum Forward {
    Writer(SharedWriter),
    Tracing,
}

impl Forward {
    fn emit(&self, pid: u32, line: &str) {
        match self {
            Forward::Writer(writer) => {
                if let Ok(mut w) = writer.lock() {
                    let _ = writeln!(w, "{line}");
                }
            }
            Forward::Tracing => tracing::info!(target: "etcd", pid, "{line}"),
        }
    }
}

fn forward_stderr(stderr: ChildStderr, pid: u32, target: Forward) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => target.emit(pid, &line),
                Ok(None) => break,
                Err(e) => {
                    warn!(pid, error = %e, "error reading server stderr");
                    break;
                }
            }
        }
    })
}

/// Returns `true` if `binary` resolves to an executable file.
pub fn binary_available(binary: &str) -> bool {
    resolve_executable(binary).is_ok()
}

/// Resolve a binary name or path to an executable file.
///
/// Anything containing a path separator is checked as given; a bare name is
/// searched for in each `PATH` directory in order.
pub fn resolve_executable(binary: &str) -> Result<PathBuf> {
    let not_found = || HarnessError::BinaryNotFound {
        binary: binary.to_owned(),
    };
    if binary.is_empty() {
        return Err(not_found());
    }

    let candidate = Path::new(binary);
    if candidate.components().count() > 1 {
        return if is_executable(candidate) {
            Ok(candidate.to_path_buf())
        } else {
            Err(not_found())
        };
    }

    let search_path = env::var_os("PATH").ok_or_else(not_found)?;
    env::split_paths(&search_path)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(binary))
        .find(|path| is_executable(path))
        .ok_or_else(not_found)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Outcome of [`ServerProcess::terminate`].
#[derive(Debug)]
pub struct Termination {
    /// Why the kill signal could not be sent, if it could not.
    pub kill_error: Option<io::Error>,
    /// Exit status from reaping the process.
    pub status: io::Result<ExitStatus>,
}

/// A running server process.
///
/// Owned by exactly one harness. [`ServerProcess::terminate`] consumes the
/// handle, so a process can only be killed and reaped once.
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    pid: u32,
    binary: PathBuf,
    forwarder: Option<JoinHandle<()>>,
}

impl ServerProcess {
    /// Start `binary` with the given command line. Returns as soon as the
    /// process exists; it is not waited on.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn launch(binary: &Path, config: &InstanceConfig, sink: DiagnosticSink) -> Result<Self> {
        let (stderr, forward) = sink.into_stdio();

        let mut cmd = Command::new(binary);
        cmd.args(config.args())
            .envs(config.env().iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(config.data_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| HarnessError::Launch {
            binary: binary.to_path_buf(),
            source,
        })?;

        let pid = child.id().ok_or_else(|| HarnessError::Launch {
            binary: binary.to_path_buf(),
            source: io::Error::other("process exited before reporting a pid"),
        })?;

        let forwarder = match (child.stderr.take(), forward) {
            (Some(pipe), Some(target)) => Some(forward_stderr(pipe, pid, target)),
            _ => None,
        };

        debug!(pid, binary = %binary.display(), "server process started");

        Ok(Self {
            child,
            pid,
            binary: binary.to_path_buf(),
            forwarder,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Non-blocking check whether the process has already exited.
    pub fn try_exit_status(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// SIGKILL the process and wait until the OS has reaped it.
    ///
    /// A failed kill does not skip the wait; both outcomes are returned for
    /// the caller to report. There is no timeout on the wait.
    pub async fn terminate(mut self) -> Termination {
        let pid = self.pid;
        let kill_error = self.child.start_kill().err();
        if let Some(e) = &kill_error {
            debug!(pid, error = %e, "kill signal not delivered");
        }

        let status = self.child.wait().await;

        if let Some(forwarder) = self.forwarder.take() {
            let abort = forwarder.abort_handle();
            if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, forwarder)
                .await
                .is_err()
            {
                debug!(pid, "stderr still open after exit, detaching forwarder");
                abort.abort();
            }
        }

        Termination { kill_error, status }
    }

    /// Synchronous kill used when a harness is dropped without `stop`.
    ///
    /// Polls for up to `DROP_REAP_TIMEOUT` and returns `true` only once the
    /// process has been reaped.
    pub(crate) fn kill_now(&mut self) -> bool {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Err(e) = self.child.start_kill() {
            debug!(pid = self.pid, error = %e, "kill on drop failed");
        }

        let deadline = Instant::now() + DROP_REAP_TIMEOUT;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return true,
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(None) => return false,
                Err(e) => {
                    warn!(pid = self.pid, error = %e, "failed reaping server process on drop");
                    return false;
                }
            }
        }
    }
}
