//! Windows child management
//!
//! `std::process::Command` cannot hide the window of a console child nor
//! spawn with a caller-supplied token, so children are created directly with
//! `CreateProcessW` / `CreateProcessAsUserW`. The process handle is kept open
//! for the lifetime of the [`OsChild`], which makes wait and kill race-free.

use std::ffi::{c_void, OsStr, OsString};
use std::fs::File;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{FromRawHandle, RawHandle};
use std::path::Path;

use tracing::debug;
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, DuplicateHandle, SetHandleInformation, BOOL, DUPLICATE_SAME_ACCESS, HANDLE,
    HANDLE_FLAG_INHERIT, HANDLE_FLAGS,
};
use windows::Win32::Security::SECURITY_ATTRIBUTES;
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_GENERIC_READ, FILE_GENERIC_WRITE, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::System::Console::{
    GetStdHandle, STD_ERROR_HANDLE, STD_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
};
use windows::Win32::System::Pipes::CreatePipe;
use windows::Win32::System::Threading::{
    CreateProcessAsUserW, CreateProcessW, GetCurrentProcess, GetExitCodeProcess,
    TerminateProcess, WaitForSingleObject, CREATE_UNICODE_ENVIRONMENT, INFINITE,
    PROCESS_CREATION_FLAGS, PROCESS_INFORMATION, STARTF_USESHOWWINDOW, STARTF_USESTDHANDLES,
    STARTUPINFOW,
};
use windows::Win32::UI::WindowsAndMessaging::SW_HIDE;

use super::{SpawnRequest, Spawned, StdioMode};
use crate::stdin_forwarder::PipeWriter;
use crate::token::PrimaryToken;

pub const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;
pub const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
pub const CREATE_SUSPENDED: u32 = 0x0000_0004;

/// Platform-specific spawn options
#[derive(Debug, Clone)]
pub struct SpawnAttributes {
    /// `dwCreationFlags` passed to `CreateProcess*`.
    pub creation_flags: u32,
    /// Start the child's console window hidden.
    pub hide_window: bool,
    /// Spawn under this primary token instead of ours.
    pub token: Option<PrimaryToken>,
}

impl Default for SpawnAttributes {
    fn default() -> Self {
        Self {
            creation_flags: CREATE_NEW_CONSOLE | CREATE_NEW_PROCESS_GROUP,
            hide_window: true,
            token: None,
        }
    }
}

/// Owned kernel handle, closed on drop
#[derive(Debug)]
pub struct Handle(HANDLE);

impl Handle {
    /// # Safety
    /// `raw` must be a valid handle owned by nobody else.
    pub unsafe fn from_raw(raw: HANDLE) -> Self {
        Handle(raw)
    }

    pub fn raw(&self) -> HANDLE {
        self.0
    }

    fn into_file(self) -> File {
        let raw = self.0 .0 as RawHandle;
        std::mem::forget(self);
        // SAFETY: ownership moves from `self` into the File.
        unsafe { File::from_raw_handle(raw) }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

/// A spawned child, identified by its open process handle
#[derive(Debug)]
pub struct OsChild {
    pid: u32,
    process: Handle,
    _thread: Handle,
}

impl OsChild {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Blocks until the child has exited.
    pub fn wait_exit(&self) -> io::Result<()> {
        let rc = unsafe { WaitForSingleObject(self.process.raw(), INFINITE) };
        if rc.0 == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    /// Reads the exit code of an exited child.
    pub fn reap(&self) -> (i32, Option<io::Error>) {
        let mut code = 0u32;
        match unsafe { GetExitCodeProcess(self.process.raw(), &mut code) } {
            Ok(()) => (code as i32, None),
            Err(e) => (-1, Some(io::Error::from(e))),
        }
    }

    pub fn kill(&self) -> io::Result<()> {
        unsafe { TerminateProcess(self.process.raw(), 1) }.map_err(io::Error::from)
    }
}

fn inheritable_attributes() -> SECURITY_ATTRIBUTES {
    SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: std::ptr::null_mut(),
        bInheritHandle: BOOL(1),
    }
}

/// Pipe ends created for one stdio slot.
struct Slot {
    child_end: Handle,
    parent_end: Option<Handle>,
}

fn slot(mode: StdioMode, std: STD_HANDLE, child_reads: bool) -> io::Result<Slot> {
    match mode {
        StdioMode::Inherit => Ok(Slot {
            child_end: inheritable_std_handle(std)?,
            parent_end: None,
        }),
        StdioMode::Null => Ok(Slot {
            child_end: open_null()?,
            parent_end: None,
        }),
        StdioMode::Piped => {
            let attrs = inheritable_attributes();
            let mut read = HANDLE::default();
            let mut write = HANDLE::default();
            unsafe { CreatePipe(&mut read, &mut write, Some(&attrs), 0) }?;
            // SAFETY: CreatePipe just handed us both ends.
            let (read, write) = unsafe { (Handle::from_raw(read), Handle::from_raw(write)) };
            let (child, parent) = if child_reads {
                (read, write)
            } else {
                (write, read)
            };
            // our end must not leak into the child
            unsafe { SetHandleInformation(parent.raw(), HANDLE_FLAG_INHERIT.0, HANDLE_FLAGS(0)) }?;
            Ok(Slot {
                child_end: child,
                parent_end: Some(parent),
            })
        }
    }
}

fn inheritable_std_handle(std: STD_HANDLE) -> io::Result<Handle> {
    let source = unsafe { GetStdHandle(std) }?;
    if source.is_invalid() || source.0 == 0 {
        return open_null();
    }
    let mut dup = HANDLE::default();
    unsafe {
        let me = GetCurrentProcess();
        DuplicateHandle(me, source, me, &mut dup, 0, BOOL(1), DUPLICATE_SAME_ACCESS)?;
        Ok(Handle::from_raw(dup))
    }
}

fn open_null() -> io::Result<Handle> {
    let attrs = inheritable_attributes();
    let name = wide("NUL");
    let handle = unsafe {
        CreateFileW(
            PCWSTR(name.as_ptr()),
            (FILE_GENERIC_READ | FILE_GENERIC_WRITE).0,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            Some(&attrs),
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL,
            HANDLE::default(),
        )
    }?;
    // SAFETY: CreateFileW returned a fresh handle.
    Ok(unsafe { Handle::from_raw(handle) })
}

/// Pipe ends for all three slots, created before anything is spawned.
pub struct PreparedPipes {
    stdin: Slot,
    stdout: Slot,
    stderr: Slot,
}

pub(super) fn prepare_pipes(req: &SpawnRequest<'_>) -> io::Result<PreparedPipes> {
    Ok(PreparedPipes {
        stdin: slot(req.stdin, STD_INPUT_HANDLE, true)?,
        stdout: slot(req.stdout, STD_OUTPUT_HANDLE, false)?,
        stderr: slot(req.stderr, STD_ERROR_HANDLE, false)?,
    })
}

pub(super) fn spawn(req: &SpawnRequest<'_>, pipes: PreparedPipes) -> io::Result<Spawned> {
    let PreparedPipes {
        stdin,
        stdout,
        stderr,
    } = pipes;

    let mut startup = STARTUPINFOW {
        cb: std::mem::size_of::<STARTUPINFOW>() as u32,
        dwFlags: STARTF_USESTDHANDLES,
        hStdInput: stdin.child_end.raw(),
        hStdOutput: stdout.child_end.raw(),
        hStdError: stderr.child_end.raw(),
        ..Default::default()
    };
    if req.attrs.hide_window {
        startup.dwFlags |= STARTF_USESHOWWINDOW;
        startup.wShowWindow = SW_HIDE.0 as u16;
    }

    let application = wide_os(req.program.as_os_str());
    let mut command_line = command_line(req.program, req.args);
    let cwd = wide_os(req.cwd.as_os_str());
    let env = environment_block(req.env);
    let flags = PROCESS_CREATION_FLAGS(req.attrs.creation_flags) | CREATE_UNICODE_ENVIRONMENT;
    let mut info = PROCESS_INFORMATION::default();

    unsafe {
        match &req.attrs.token {
            Some(token) => CreateProcessAsUserW(
                token.raw(),
                PCWSTR(application.as_ptr()),
                PWSTR(command_line.as_mut_ptr()),
                None,
                None,
                BOOL(1),
                flags,
                Some(env.as_ptr() as *const c_void),
                PCWSTR(cwd.as_ptr()),
                &startup,
                &mut info,
            ),
            None => CreateProcessW(
                PCWSTR(application.as_ptr()),
                PWSTR(command_line.as_mut_ptr()),
                None,
                None,
                BOOL(1),
                flags,
                Some(env.as_ptr() as *const c_void),
                PCWSTR(cwd.as_ptr()),
                &startup,
                &mut info,
            ),
        }
    }?;

    // The child owns its copies now.
    drop(stdin.child_end);
    drop(stdout.child_end);
    drop(stderr.child_end);

    debug!("spawned {} as pid {}", req.program.display(), info.dwProcessId);

    // SAFETY: CreateProcess* returned these handles to us.
    let child = unsafe {
        OsChild {
            pid: info.dwProcessId,
            process: Handle::from_raw(info.hProcess),
            _thread: Handle::from_raw(info.hThread),
        }
    };

    Ok(Spawned {
        child,
        stdin: stdin
            .parent_end
            .map(|h| Box::new(h.into_file()) as PipeWriter),
        stdout: stdout
            .parent_end
            .map(|h| Box::new(h.into_file()) as Box<dyn io::Read + Send>),
        stderr: stderr
            .parent_end
            .map(|h| Box::new(h.into_file()) as Box<dyn io::Read + Send>),
    })
}

pub(crate) fn wide(s: &str) -> Vec<u16> {
    wide_os(OsStr::new(s))
}

pub(crate) fn wide_os(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

/// Builds a NUL-terminated command line quoted the way the MSVC runtime
/// splits it back into argv.
pub(crate) fn command_line(program: &Path, args: &[String]) -> Vec<u16> {
    let mut line = String::new();
    append_quoted(&mut line, &program.to_string_lossy(), true);
    for arg in args {
        line.push(' ');
        append_quoted(&mut line, arg, false);
    }
    wide(&line)
}

fn append_quoted(out: &mut String, arg: &str, force: bool) {
    let needs_quotes = force || arg.is_empty() || arg.contains([' ', '\t', '"']);
    if !needs_quotes {
        out.push_str(arg);
        return;
    }

    out.push('"');
    let mut backslashes = 0usize;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            _ => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }
    out.extend(std::iter::repeat('\\').take(backslashes * 2));
    out.push('"');
}

/// `KEY=VALUE\0...\0\0`, sorted case-insensitively as Windows expects.
fn environment_block(env: &[(OsString, OsString)]) -> Vec<u16> {
    let mut vars: Vec<&(OsString, OsString)> = env.iter().collect();
    vars.sort_by_key(|(k, _)| k.to_string_lossy().to_uppercase());

    let mut block = Vec::new();
    for (key, value) in vars {
        block.extend(key.encode_wide());
        block.push(b'=' as u16);
        block.extend(value.encode_wide());
        block.push(0);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(program: &str, args: &[&str]) -> String {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let wide = command_line(Path::new(program), &args);
        String::from_utf16_lossy(&wide[..wide.len() - 1])
    }

    #[test]
    fn test_command_line_quoting() {
        assert_eq!(line("C:\\a.exe", &["x", "y z"]), "\"C:\\a.exe\" x \"y z\"");
        assert_eq!(line("a", &[""]), "\"a\" \"\"");
        assert_eq!(line("a", &["say \"hi\""]), "\"a\" \"say \\\"hi\\\"\"");
        assert_eq!(line("a", &["dir\\ x\\"]), "\"a\" \"dir\\ x\\\\\"");
    }

    #[test]
    fn test_environment_block_layout() {
        let env = vec![
            (OsString::from("b"), OsString::from("2")),
            (OsString::from("A"), OsString::from("1")),
        ];
        let block = environment_block(&env);
        let text = String::from_utf16_lossy(&block);
        assert_eq!(text, "A=1\0b=2\0\0");
    }

    #[test]
    fn test_default_attributes() {
        let attrs = SpawnAttributes::default();
        assert_eq!(attrs.creation_flags, 0x210);
        assert!(attrs.hide_window);
        assert!(attrs.token.is_none());
    }
}
