//! Process entity and lifecycle
//!
//! A [`Process`] is configured once and can be started any number of times,
//! one child at a time. Each run owns a post-start supervisor thread which
//! waits for the OS child, then for both capture workers, and only then
//! publishes the [`ExitStatus`]. Every captured line is therefore visible
//! once [`Process::wait`] returns.

use std::ffi::OsString;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::capture::{self, Stream};
use crate::error::{ProcessError, Result};
use crate::hub::{Hub, Line, Subscription};
use crate::status::ExitStatus;
use crate::stdin_forwarder::{self, InputPipe, PipeWriter, StdinForwarder};
use crate::stdio::{InputSource, OutputSink};

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub(crate) use unix::interrupt_pid;
#[cfg(unix)]
pub use unix::SpawnAttributes;
#[cfg(unix)]
use unix::{prepare_pipes, spawn, OsChild};

#[cfg(windows)]
pub(crate) mod windows;
#[cfg(windows)]
pub use self::windows::{
    SpawnAttributes, CREATE_NEW_CONSOLE, CREATE_NEW_PROCESS_GROUP, CREATE_SUSPENDED,
};
#[cfg(windows)]
use self::windows::{prepare_pipes, spawn, OsChild};

/// How one stdio slot is wired at the OS level.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StdioMode {
    Inherit,
    Null,
    Piped,
}

/// Everything the platform layer needs to create a child.
pub(crate) struct SpawnRequest<'a> {
    pub program: &'a Path,
    pub args: &'a [String],
    pub cwd: &'a Path,
    pub env: &'a [(OsString, OsString)],
    pub attrs: &'a SpawnAttributes,
    pub stdin: StdioMode,
    pub stdout: StdioMode,
    pub stderr: StdioMode,
}

/// A freshly created child and the parent ends of its pipes.
pub(crate) struct Spawned {
    pub child: OsChild,
    pub stdin: Option<PipeWriter>,
    pub stdout: Option<Box<dyn Read + Send>>,
    pub stderr: Option<Box<dyn Read + Send>>,
}

/// Lifecycle phase of a [`Process`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Never started.
    Configured,
    /// An OS child exists.
    Running,
    /// The last run finished and its status is recorded.
    Exited,
}

struct RunState {
    phase: Phase,
    child: Option<Arc<OsChild>>,
    /// Set by the supervisor right before the child is reaped. From then on
    /// the pid may be recycled, so no more signals go out.
    reaped: bool,
    input: Option<InputPipe>,
    stdout: Arc<Hub>,
    stderr: Arc<Hub>,
    last_status: ExitStatus,
}

struct Shared {
    state: Mutex<RunState>,
    exited: Condvar,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(RunState {
                phase: Phase::Configured,
                child: None,
                reaped: false,
                input: None,
                stdout: Arc::new(Hub::closed()),
                stderr: Arc::new(Hub::closed()),
                last_status: ExitStatus::default(),
            }),
            exited: Condvar::new(),
        }
    }
}

/// A configured external command, possibly running
pub struct Process {
    name: String,
    wd: PathBuf,
    exec_path: PathBuf,
    args: Vec<String>,
    env: Vec<(OsString, OsString)>,
    attrs: SpawnAttributes,
    shared: Arc<Shared>,
}

impl Process {
    /// Creates a process for `exec_path` run inside `wd`.
    ///
    /// A bare executable name is looked up in `PATH`; a path is made absolute
    /// against the current directory. An empty `wd` means the current
    /// directory.
    pub fn new<P, E, I, S>(wd: P, exec_path: E, args: I) -> Result<Self>
    where
        P: AsRef<Path>,
        E: AsRef<Path>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let wd = resolve_working_dir(wd.as_ref())?;
        let exec_path = resolve_executable(exec_path.as_ref())?;
        let name = exec_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| exec_path.display().to_string());

        Ok(Self {
            name,
            wd,
            exec_path,
            args: args.into_iter().map(Into::into).collect(),
            env: std::env::vars_os().collect(),
            attrs: SpawnAttributes::default(),
            shared: Arc::new(Shared::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the display name used in messages and `Display`.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn exec_path(&self) -> &Path {
        &self.exec_path
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> &Path {
        &self.wd
    }

    /// Environment passed to the child. Defaults to ours at construction.
    pub fn env(&self) -> &[(OsString, OsString)] {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut Vec<(OsString, OsString)> {
        &mut self.env
    }

    /// Sets (or replaces) one variable.
    pub fn set_env(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) {
        let key = key.into();
        let value = value.into();
        match self.env.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.env.push((key, value)),
        }
    }

    pub fn remove_env(&mut self, key: impl AsRef<std::ffi::OsStr>) {
        let key = key.as_ref();
        self.env.retain(|(k, _)| k.as_os_str() != key);
    }

    pub fn spawn_attributes(&self) -> &SpawnAttributes {
        &self.attrs
    }

    pub fn spawn_attributes_mut(&mut self) -> &mut SpawnAttributes {
        &mut self.attrs
    }

    /// Lets the child's console window show up (it starts hidden by default).
    #[cfg(windows)]
    pub fn show_window(&mut self, show: bool) {
        self.attrs.hide_window = !show;
    }

    /// Shares our console with the child instead of creating a new one.
    ///
    /// A child sharing our console cannot be stopped without the Ctrl-C also
    /// reaching every other process attached to it.
    #[cfg(windows)]
    pub fn inherit_console(&mut self, inherit: bool) {
        if inherit {
            self.attrs.creation_flags &= !CREATE_NEW_CONSOLE;
        } else {
            self.attrs.creation_flags |= CREATE_NEW_CONSOLE;
        }
    }

    /// Starts the child and returns once it exists.
    ///
    /// Captured output of the previous run is discarded.
    pub fn start(
        &self,
        stdin: impl Into<InputSource>,
        stdout: impl Into<OutputSink>,
        stderr: impl Into<OutputSink>,
    ) -> Result<()> {
        self.start_with(stdin.into(), stdout.into(), stderr.into(), |_| {})
    }

    /// Starts with a one-off adjustment of the spawn attributes.
    pub(crate) fn start_with(
        &self,
        stdin: InputSource,
        stdout: OutputSink,
        stderr: OutputSink,
        adjust: impl FnOnce(&mut SpawnAttributes),
    ) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.phase == Phase::Running {
            return Err(ProcessError::AlreadyRunning(self.name.clone()));
        }

        #[allow(unused_mut)]
        let mut attrs = self.attrs.clone();
        #[cfg(windows)]
        if matches!(stdin, InputSource::Parent) || stdout.is_parent() || stderr.is_parent() {
            // the caller wants to see output natively: share our console
            attrs.creation_flags &= !CREATE_NEW_CONSOLE;
        }
        adjust(&mut attrs);

        let req = SpawnRequest {
            program: &self.exec_path,
            args: &self.args,
            cwd: &self.wd,
            env: &self.env,
            attrs: &attrs,
            stdin: stdin_mode(&stdin),
            stdout: output_mode(&stdout),
            stderr: output_mode(&stderr),
        };

        let pipes = prepare_pipes(&req).map_err(|source| ProcessError::PipeSetup {
            name: self.name.clone(),
            source,
        })?;
        let spawned = spawn(&req, pipes).map_err(|source| ProcessError::SpawnFailure {
            name: self.name.clone(),
            source,
        })?;

        let child = Arc::new(spawned.child);
        let out_hub = Arc::new(if stdout.is_captured() {
            Hub::new()
        } else {
            Hub::closed()
        });
        let err_hub = Arc::new(if stderr.is_captured() {
            Hub::new()
        } else {
            Hub::closed()
        });
        let input = spawned.stdin.map(InputPipe::new);

        let threads = launch_threads(
            stdin,
            input.clone(),
            (spawned.stdout, stdout, Arc::clone(&out_hub)),
            (spawned.stderr, stderr, Arc::clone(&err_hub)),
        );
        let workers = match threads {
            Ok(workers) => workers,
            Err(e) => {
                abort_child(&child);
                return Err(ProcessError::SpawnFailure {
                    name: self.name.clone(),
                    source: e,
                });
            }
        };

        state.phase = Phase::Running;
        state.child = Some(Arc::clone(&child));
        state.reaped = false;
        state.input = input;
        state.stdout = out_hub;
        state.stderr = err_hub;

        let shared = Arc::clone(&self.shared);
        let supervisor = thread::Builder::new()
            .name("proctrl-supervisor".into())
            .spawn({
                let child = Arc::clone(&child);
                move || supervise(&shared, &child, workers)
            });
        if let Err(e) = supervisor {
            // no supervisor means nobody would ever publish the exit
            abort_child(&child);
            state.phase = Phase::Exited;
            state.child = None;
            return Err(ProcessError::SpawnFailure {
                name: self.name.clone(),
                source: e,
            });
        }

        info!("started {} (pid {})", self.name, child.pid());
        Ok(())
    }

    /// Blocks until the current run has exited, then returns its status.
    ///
    /// Returns the last recorded status right away when not running.
    pub fn wait(&self) -> ExitStatus {
        let mut state = self.shared.state.lock();
        while state.phase == Phase::Running {
            self.shared.exited.wait(&mut state);
        }
        state.last_status.clone()
    }

    /// Starts the child and waits for it.
    pub fn run(
        &self,
        stdin: impl Into<InputSource>,
        stdout: impl Into<OutputSink>,
        stderr: impl Into<OutputSink>,
    ) -> Result<ExitStatus> {
        self.start(stdin, stdout, stderr)?;
        self.wait().into_result()
    }

    /// Forcibly terminates the child.
    pub fn kill(&self) -> Result<()> {
        let state = self.shared.state.lock();
        let child = match (&state.phase, &state.child) {
            (Phase::Running, Some(child)) => child,
            _ => return Err(ProcessError::NotRunning(self.name.clone())),
        };
        if state.reaped {
            debug!("{} already exiting, kill skipped", self.name);
            return Ok(());
        }
        debug!("killing {} (pid {})", self.name, child.pid());
        child.kill()?;
        Ok(())
    }

    /// Asks the child to stop, like a Ctrl-C on its console.
    ///
    /// Does not wait for the child; call [`Process::wait`] afterwards. On unix
    /// stopping a process that is not running is a no-op.
    #[cfg(unix)]
    pub fn stop(&self) -> Result<()> {
        let state = self.shared.state.lock();
        let child = match (&state.phase, &state.child) {
            (Phase::Running, Some(child)) => child,
            _ => return Ok(()),
        };
        if state.reaped {
            return Ok(());
        }
        debug!("interrupting {} (pid {})", self.name, child.pid());
        child.interrupt()?;
        Ok(())
    }

    /// Asks the child to stop by delivering a Ctrl-C to its console.
    ///
    /// Does not wait for the child; call [`Process::wait`] afterwards.
    #[cfg(windows)]
    pub fn stop(&self) -> Result<()> {
        let pid = self
            .pid()
            .ok_or_else(|| ProcessError::NotRunning(self.name.clone()))?;
        debug!("sending Ctrl-C to {} (pid {})", self.name, pid);
        crate::signal::stop_process(pid)
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().phase == Phase::Running
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    /// OS pid of the running child.
    pub fn pid(&self) -> Option<u32> {
        let state = self.shared.state.lock();
        match state.phase {
            Phase::Running => state.child.as_ref().map(|c| c.pid()),
            _ => None,
        }
    }

    /// Writes `data` to the child's stdin pipe.
    ///
    /// Must not be called concurrently with itself on the same process.
    pub fn send_input(&self, data: &[u8]) -> Result<()> {
        let input = {
            let state = self.shared.state.lock();
            if state.phase != Phase::Running {
                return Err(ProcessError::NotRunning(self.name.clone()));
            }
            state
                .input
                .clone()
                .ok_or_else(|| ProcessError::NoInputPipe(self.name.clone()))?
        };
        input.write_all(data)?;
        Ok(())
    }

    /// Sends `text` followed by a newline.
    pub fn send_text(&self, text: &str) -> Result<()> {
        let mut data = Vec::with_capacity(text.len() + 1);
        data.extend_from_slice(text.as_bytes());
        data.push(b'\n');
        self.send_input(&data)
    }

    /// Closes the child's stdin pipe. Closing twice is harmless.
    pub fn close_input(&self) -> Result<()> {
        let input = self
            .shared
            .state
            .lock()
            .input
            .clone()
            .ok_or_else(|| ProcessError::NoInputPipe(self.name.clone()))?;
        if input.close() {
            debug!("closed stdin of {}", self.name);
        }
        Ok(())
    }

    fn hub(&self, stream: Stream) -> Arc<Hub> {
        let state = self.shared.state.lock();
        match stream {
            Stream::Stdout => Arc::clone(&state.stdout),
            Stream::Stderr => Arc::clone(&state.stderr),
        }
    }

    /// Captured stdout, lines joined with `\n`.
    pub fn stdout(&self) -> Vec<u8> {
        self.hub(Stream::Stdout).joined()
    }

    /// Captured stderr, lines joined with `\n`.
    pub fn stderr(&self) -> Vec<u8> {
        self.hub(Stream::Stderr).joined()
    }

    pub fn stdout_lines(&self) -> Vec<Line> {
        self.hub(Stream::Stdout).history()
    }

    pub fn stderr_lines(&self) -> Vec<Line> {
        self.hub(Stream::Stderr).history()
    }

    /// The last `n` captured stdout lines.
    pub fn last_stdout_lines(&self, n: usize) -> Vec<Line> {
        self.hub(Stream::Stdout).tail(n)
    }

    pub fn last_stderr_lines(&self, n: usize) -> Vec<Line> {
        self.hub(Stream::Stderr).tail(n)
    }

    /// Subscribes to stdout lines produced from now on.
    pub fn stdout_listener(&self, buf_size: usize) -> Subscription {
        self.hub(Stream::Stdout).register(buf_size)
    }

    pub fn stderr_listener(&self, buf_size: usize) -> Subscription {
        self.hub(Stream::Stderr).register(buf_size)
    }

    /// Returns stdout captured so far and a subscription continuing exactly
    /// where that history ends.
    pub fn connect_stdout(&self, buf_size: usize) -> (Vec<Line>, Subscription) {
        self.hub(Stream::Stdout).connect(buf_size)
    }

    pub fn connect_stderr(&self, buf_size: usize) -> (Vec<Line>, Subscription) {
        self.hub(Stream::Stderr).connect(buf_size)
    }
}

impl Clone for Process {
    /// A new, never started process with the same configuration.
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            wd: self.wd.clone(),
            exec_path: self.exec_path.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            attrs: self.attrs.clone(),
            shared: Arc::new(Shared::new()),
        }
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid() {
            Some(pid) => write!(f, "{} (Running - {})", self.name, pid),
            None => write!(f, "{} (Stopped)", self.name),
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.name)
            .field("exec_path", &self.exec_path)
            .field("args", &self.args)
            .field("wd", &self.wd)
            .field("phase", &self.phase())
            .finish()
    }
}

fn resolve_working_dir(wd: &Path) -> Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    let wd = if wd.as_os_str().is_empty() {
        cwd
    } else {
        cwd.join(wd)
    };
    match std::fs::metadata(&wd) {
        Ok(meta) if meta.is_dir() => Ok(wd),
        _ => Err(ProcessError::BadWorkingDirectory(wd)),
    }
}

fn resolve_executable(exec_path: &Path) -> Result<PathBuf> {
    let bare = exec_path
        .parent()
        .map_or(true, |p| p.as_os_str().is_empty());
    if bare {
        return which::which(exec_path)
            .map_err(|_| ProcessError::ExecutableNotFound(exec_path.display().to_string()));
    }
    if exec_path.is_absolute() {
        Ok(exec_path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(exec_path))
    }
}

fn stdin_mode(stdin: &InputSource) -> StdioMode {
    if stdin.has_pipe() {
        StdioMode::Piped
    } else if cfg!(windows) {
        StdioMode::Inherit
    } else {
        StdioMode::Null
    }
}

fn output_mode(sink: &OutputSink) -> StdioMode {
    if sink.is_captured() {
        StdioMode::Piped
    } else {
        StdioMode::Inherit
    }
}

type OutputWiring = (Option<Box<dyn Read + Send>>, OutputSink, Arc<Hub>);

/// Starts the stdin forwarder (if any) and the capture workers.
fn launch_threads(
    stdin: InputSource,
    input: Option<InputPipe>,
    stdout: OutputWiring,
    stderr: OutputWiring,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    if let Some(pipe) = input {
        match stdin {
            // detached: it may block on a reader that never ends
            InputSource::Reader(reader) => {
                StdinForwarder::spawn(reader, pipe)?;
            }
            InputSource::Parent => stdin_forwarder::parent_stdin()?.attach(pipe),
            InputSource::Inherit | InputSource::Null => {}
        }
    }

    let mut workers = Vec::with_capacity(2);
    for (stream, (pipe, sink, hub)) in [(Stream::Stdout, stdout), (Stream::Stderr, stderr)] {
        if let Some(pipe) = pipe {
            workers.push(capture::spawn_worker(stream, pipe, sink.into_mirror(), hub)?);
        }
    }
    Ok(workers)
}

fn abort_child(child: &OsChild) {
    if let Err(e) = child.kill() {
        warn!("failed to kill pid {} after setup error: {}", child.pid(), e);
    }
    let _ = child.wait_exit();
    let _ = child.reap();
}

/// Post-start supervisor: OS wait, then the capture barrier, then publish.
fn supervise(shared: &Shared, child: &OsChild, workers: Vec<JoinHandle<()>>) {
    let wait_error = child.wait_exit().err();
    shared.state.lock().reaped = true;
    let (code, reap_error) = child.reap();

    for worker in workers {
        if worker.join().is_err() {
            warn!("capture worker of pid {} panicked", child.pid());
        }
    }

    let status = ExitStatus {
        pid: child.pid(),
        code,
        os_error: wait_error.or(reap_error).map(Arc::new),
    };
    debug!("pid {} exited: {}", status.pid, status);

    let mut state = shared.state.lock();
    if let Some(input) = &state.input {
        input.close();
    }
    state.last_status = status;
    state.phase = Phase::Exited;
    state.child = None;
    shared.exited.notify_all();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_bare_name_is_resolved_in_path() {
        let p = Process::new(".", "sh", ["-c", "true"]).unwrap();
        assert!(p.exec_path().is_absolute());
        assert_eq!(p.name(), "sh");
        assert_eq!(p.phase(), Phase::Configured);
    }

    #[test]
    fn test_missing_executable() {
        let err = Process::new(".", "definitely-not-a-command-4711", Vec::<String>::new())
            .unwrap_err();
        assert!(matches!(err, ProcessError::ExecutableNotFound(_)));
    }

    #[test]
    fn test_bad_working_directory() {
        let err = Process::new("/does/not/exist", "echo", ["x"]).unwrap_err();
        assert!(matches!(err, ProcessError::BadWorkingDirectory(_)));
    }

    #[test]
    fn test_file_is_not_a_working_directory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = Process::new(file.path(), "echo", ["x"]).unwrap_err();
        assert!(matches!(err, ProcessError::BadWorkingDirectory(_)));
    }

    #[test]
    fn test_set_env_replaces() {
        let mut p = Process::new("", "sh", Vec::<String>::new()).unwrap();
        p.set_env("PROCTRL_TEST", "1");
        p.set_env("PROCTRL_TEST", "2");
        let matches: Vec<_> = p
            .env()
            .iter()
            .filter(|(k, _)| k == "PROCTRL_TEST")
            .collect();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].1, "2");
        p.remove_env("PROCTRL_TEST");
        assert!(p.env().iter().all(|(k, _)| k != "PROCTRL_TEST"));
    }

    #[test]
    fn test_clone_is_not_running() {
        let p = Process::new(".", "sleep", ["5"]).unwrap();
        p.start(None::<std::io::Empty>, OutputSink::Null, OutputSink::Null)
            .unwrap();
        let copy = p.clone();
        assert!(!copy.is_running());
        assert_eq!(copy.args(), p.args());
        p.kill().unwrap();
        p.wait();
    }

    #[test]
    fn test_display() {
        let p = Process::new(".", "sleep", ["5"]).unwrap();
        assert_eq!(p.to_string(), "sleep (Stopped)");
        p.start(InputSource::Null, OutputSink::Null, OutputSink::Null)
            .unwrap();
        let pid = p.pid().unwrap();
        assert_eq!(p.to_string(), format!("sleep (Running - {})", pid));
        p.kill().unwrap();
        p.wait();
        assert_eq!(p.to_string(), "sleep (Stopped)");
    }

    #[test]
    fn test_wait_before_start_returns_default() {
        let p = Process::new(".", "true", Vec::<String>::new()).unwrap();
        assert_eq!(p.wait(), ExitStatus::default());
    }
}
