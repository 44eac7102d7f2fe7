//! Unix child management
//!
//! Children are spawned with `std::process::Command` over pipes we create
//! ourselves, so pipe failures can be told apart from spawn failures. Waiting
//! happens in two steps: `waitid(WNOWAIT)` observes the exit while the pid is
//! still reserved, then `waitpid` reaps it. Signals are only sent before the
//! reap, so they can never hit a recycled pid. A child started in its own
//! session is signalled as a process group, like a terminal Ctrl-C.

use std::fs::File;
use std::io;
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
use nix::{fcntl::OFlag, unistd::pipe2};
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag},
    unistd::{close, pipe},
};
use nix::unistd::Pid;
use tracing::debug;

use super::{SpawnRequest, Spawned, StdioMode};
use crate::stdin_forwarder::PipeWriter;

/// Platform-specific spawn options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnAttributes {
    /// Run the child in a new session, detached from our controlling tty.
    pub new_session: bool,
}

impl Default for SpawnAttributes {
    fn default() -> Self {
        Self { new_session: true }
    }
}

/// A running (or exited but not yet reaped) child
#[derive(Debug)]
pub struct OsChild {
    pid: Pid,
    /// Signals go to the whole process group the child leads.
    group: bool,
}

impl OsChild {
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Blocks until the child has exited, without reaping it.
    pub fn wait_exit(&self) -> io::Result<()> {
        loop {
            // SAFETY: siginfo_t is plain data and waitid only writes into it.
            let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
            let rc = unsafe {
                libc::waitid(
                    libc::P_PID,
                    self.pid.as_raw() as libc::id_t,
                    &mut info,
                    libc::WEXITED | libc::WNOWAIT,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Reaps the child and returns its exit code.
    ///
    /// A child killed by a signal is reported as `128 + signal`.
    pub fn reap(&self) -> (i32, Option<io::Error>) {
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return (code, None),
                Ok(WaitStatus::Signaled(_, sig, _)) => return (128 + sig as i32, None),
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(e) => return (-1, Some(io::Error::from(e))),
            }
        }
    }

    pub fn kill(&self) -> io::Result<()> {
        self.signal(Signal::SIGKILL)
    }

    pub fn interrupt(&self) -> io::Result<()> {
        self.signal(Signal::SIGINT)
    }

    fn signal(&self, signal: Signal) -> io::Result<()> {
        let sent = if self.group {
            killpg(self.pid, signal)
        } else {
            kill(self.pid, signal)
        };
        match sent {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                debug!("process {} already gone, {:?} not delivered", self.pid, signal);
                Ok(())
            }
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

/// Pipe ends created for one stdio slot.
struct Slot {
    child_end: Stdio,
    parent_end: Option<File>,
}

fn slot(mode: StdioMode, child_reads: bool) -> io::Result<Slot> {
    match mode {
        StdioMode::Inherit => Ok(Slot {
            child_end: Stdio::inherit(),
            parent_end: None,
        }),
        StdioMode::Null => Ok(Slot {
            child_end: Stdio::null(),
            parent_end: None,
        }),
        StdioMode::Piped => {
            let (read, write) = anon_pipe()?;
            let (child, parent) = if child_reads {
                (read, write)
            } else {
                (write, read)
            };
            Ok(Slot {
                child_end: Stdio::from(child),
                parent_end: Some(parent),
            })
        }
    }
}

/// Pipe ends for all three slots, created before anything is spawned.
pub struct PreparedPipes {
    stdin: Slot,
    stdout: Slot,
    stderr: Slot,
}

pub(super) fn prepare_pipes(req: &SpawnRequest<'_>) -> io::Result<PreparedPipes> {
    Ok(PreparedPipes {
        stdin: slot(req.stdin, true)?,
        stdout: slot(req.stdout, false)?,
        stderr: slot(req.stderr, false)?,
    })
}

pub(super) fn spawn(req: &SpawnRequest<'_>, pipes: PreparedPipes) -> io::Result<Spawned> {
    let PreparedPipes {
        stdin,
        stdout,
        stderr,
    } = pipes;

    let mut command = Command::new(req.program);
    command
        .args(req.args)
        .current_dir(req.cwd)
        .env_clear()
        .envs(req.env.iter().map(|(k, v)| (k, v)))
        .stdin(stdin.child_end)
        .stdout(stdout.child_end)
        .stderr(stderr.child_end);

    if req.attrs.new_session {
        // Safety: setsid() is async-signal-safe and appropriate for use in pre_exec
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let child = command.spawn()?;
    // Drops our copies of the child's pipe ends so EOF propagates.
    drop(command);

    let pid = Pid::from_raw(child.id() as i32);
    debug!("spawned {} as pid {}", req.program.display(), pid);

    Ok(Spawned {
        child: OsChild {
            pid,
            group: req.attrs.new_session,
        },
        stdin: stdin.parent_end.map(|f| Box::new(f) as PipeWriter),
        stdout: stdout
            .parent_end
            .map(|f| Box::new(f) as Box<dyn io::Read + Send>),
        stderr: stderr
            .parent_end
            .map(|f| Box::new(f) as Box<dyn io::Read + Send>),
    })
}

/// Creates a close-on-exec pipe, returning `(read, write)`.
fn anon_pipe() -> io::Result<(File, File)> {
    let (read, write) = cloexec_pipe()?;
    // SAFETY: both descriptors are freshly created and owned by nobody else.
    let read = unsafe { File::from_raw_fd(read) };
    let write = unsafe { File::from_raw_fd(write) };
    Ok((read, write))
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn cloexec_pipe() -> nix::Result<(RawFd, RawFd)> {
    pipe2(OFlag::O_CLOEXEC)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn cloexec_pipe() -> nix::Result<(RawFd, RawFd)> {
    let (read, write) = pipe()?;
    for fd in [read, write] {
        if let Err(e) = fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)) {
            let _ = close(read);
            let _ = close(write);
            return Err(e);
        }
    }
    Ok((read, write))
}

/// Converts a caller-supplied pid into one that names a single process.
///
/// `0` and anything that does not fit a positive `pid_t` would make `kill`
/// address a process group (or every process we may signal).
pub fn target_pid(pid: u32) -> io::Result<Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a valid process id", pid),
        )),
    }
}

/// Sends an interrupt to an arbitrary pid.
pub fn interrupt_pid(pid: u32) -> io::Result<()> {
    OsChild {
        pid: target_pid(pid)?,
        group: false,
    }
    .interrupt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_anon_pipe_roundtrip() {
        let (mut r, mut w) = anon_pipe().unwrap();
        w.write_all(b"ping").unwrap();
        drop(w);
        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "ping");
    }

    #[test]
    fn test_pipe_fds_are_cloexec() {
        use std::os::unix::io::AsRawFd;
        let (r, w) = anon_pipe().unwrap();
        for fd in [r.as_raw_fd(), w.as_raw_fd()] {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert!(flags & libc::FD_CLOEXEC != 0);
        }
    }

    #[test]
    fn test_signal_exit_code() {
        let child = Command::new("sh")
            .args(["-c", "kill -9 $$"])
            .spawn()
            .unwrap();
        let os = OsChild {
            pid: Pid::from_raw(child.id() as i32),
            group: false,
        };
        os.wait_exit().unwrap();
        let (code, err) = os.reap();
        assert!(err.is_none());
        assert_eq!(code, 128 + libc::SIGKILL);
    }

    #[test]
    fn test_group_kill_reaches_grandchildren() {
        let (mut r, w) = anon_pipe().unwrap();
        let mut command = Command::new("sh");
        command.args(["-c", "sleep 30 & wait"]).stdout(Stdio::from(w));
        unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        let child = command.spawn().unwrap();
        drop(command);
        let os = OsChild {
            pid: Pid::from_raw(child.id() as i32),
            group: true,
        };
        os.kill().unwrap();
        os.wait_exit().unwrap();
        os.reap();
        // the pipe only reaches EOF once the backgrounded sleep is gone too
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_target_pid_rejects_group_addresses() {
        assert_eq!(target_pid(42).unwrap(), Pid::from_raw(42));
        for pid in [0, i32::MAX as u32 + 1, u32::MAX] {
            let err = target_pid(pid).unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        }
        assert!(interrupt_pid(0).is_err());
        assert!(interrupt_pid(u32::MAX).is_err());
    }

    #[test]
    fn test_interrupt_after_exit_is_silent() {
        let child = Command::new("true").spawn().unwrap();
        let os = OsChild {
            pid: Pid::from_raw(child.id() as i32),
            group: false,
        };
        os.wait_exit().unwrap();
        // exited but not reaped: the pid is still ours
        assert!(os.interrupt().is_ok());
        let (code, _) = os.reap();
        assert_eq!(code, 0);
    }
}
