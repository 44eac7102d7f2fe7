//! Windows elevation bridge

use std::ffi::c_void;
use std::path::Path;

use tracing::{debug, info, warn};
use windows::core::PCWSTR;
use windows::Wdk::System::Threading::{NtSetInformationProcess, PROCESSINFOCLASS};
use windows::Win32::Foundation::{BOOL, GENERIC_READ, GENERIC_WRITE, HANDLE};
use windows::Win32::Security::{
    DuplicateTokenEx, GetTokenInformation, SecurityImpersonation, TokenElevation, TokenPrimary,
    TOKEN_ACCESS_MASK, TOKEN_ELEVATION,
};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::System::Console::{
    SetStdHandle, STD_ERROR_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use windows::Win32::System::Threading::{
    GetCurrentProcess, GetExitCodeProcess, OpenProcess, OpenProcessToken, OpenThread,
    ResumeThread, WaitForSingleObject, INFINITE, PROCESS_SET_INFORMATION, THREAD_SUSPEND_RESUME,
};
use windows::Win32::UI::Shell::{ShellExecuteExW, SEE_MASK_NOCLOSEPROCESS, SHELLEXECUTEINFOW};
use windows::Win32::UI::WindowsAndMessaging::SW_HIDE;

use crate::error::{ElevationCode, HelperCode, ProcessError, Result};
use crate::helper::{ELEVATE_MARKER, SUDO_MARKER};
use crate::process::windows::{wide, wide_os, Handle};
use crate::process::{Process, CREATE_SUSPENDED};
use crate::signal;
use crate::status::ExitStatus;
use crate::stdio::{InputSource, OutputSink};

const MAXIMUM_ALLOWED: u32 = 0x0200_0000;
/// `ProcessAccessToken` information class.
const PROCESS_ACCESS_TOKEN_CLASS: PROCESSINFOCLASS = PROCESSINFOCLASS(9);

/// `PROCESS_ACCESS_TOKEN` as expected by `NtSetInformationProcess`.
#[repr(C)]
struct ProcessAccessToken {
    token: HANDLE,
    thread: HANDLE,
}

/// Whether we run with administrative rights.
///
/// Only administrators can open the first physical drive.
pub fn am_admin() -> bool {
    std::fs::File::open(r"\\.\PHYSICALDRIVE0").is_ok()
}

impl Process {
    /// Starts the child with administrative rights.
    ///
    /// The child is created suspended, then an elevated copy of this
    /// executable (UAC prompt) gives it an elevated token and resumes it.
    /// Pipes and capture work exactly as with [`Process::start`]. When we are
    /// already elevated this is a plain start.
    pub fn start_elevated(
        &self,
        stdin: impl Into<InputSource>,
        stdout: impl Into<OutputSink>,
        stderr: impl Into<OutputSink>,
    ) -> Result<()> {
        if am_admin() {
            debug!("already elevated, starting {} directly", self.name());
            return self.start(stdin, stdout, stderr);
        }

        self.start_with(stdin.into(), stdout.into(), stderr.into(), |attrs| {
            attrs.creation_flags |= CREATE_SUSPENDED
        })?;
        let pid = self
            .pid()
            .ok_or_else(|| ProcessError::NotRunning(self.name().to_string()))?;

        // From here on only the helper may resume the child.
        if let Err(e) = run_elevation_bridge(pid) {
            if let Err(kill_err) = self.kill() {
                warn!("failed to kill suspended {}: {}", self.name(), kill_err);
            }
            self.wait();
            return Err(e);
        }
        info!("{} (pid {}) is running elevated", self.name(), pid);
        Ok(())
    }

    /// [`Process::start_elevated`] followed by [`Process::wait`].
    pub fn run_elevated(
        &self,
        stdin: impl Into<InputSource>,
        stdout: impl Into<OutputSink>,
        stderr: impl Into<OutputSink>,
    ) -> Result<ExitStatus> {
        self.start_elevated(stdin, stdout, stderr)?;
        self.wait().into_result()
    }

    /// Creates a process that runs `exec_path` elevated through PowerShell.
    ///
    /// PowerShell relaunches this executable as administrator with
    /// `--nix-sudo`, and that copy runs the target on our console. Exit codes
    /// come back through PowerShell. When we are already elevated this is
    /// [`Process::new`].
    pub fn new_elevated<P, E, I, S>(wd: P, exec_path: E, args: I) -> Result<Self>
    where
        P: AsRef<Path>,
        E: AsRef<Path>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if am_admin() {
            return Process::new(wd, exec_path, args);
        }

        let exe = std::env::current_exe()?;
        let mut target = vec![exec_path.as_ref().display().to_string()];
        target.extend(args.into_iter().map(Into::into));
        let command = format!(
            "Start-Process -FilePath \"{}\" -ArgumentList \"{} {} {}\" -Verb RunAs -WindowStyle hidden -Wait",
            exe.display(),
            SUDO_MARKER,
            std::process::id(),
            target.join(" "),
        );
        Process::new(
            wd,
            "powershell.exe",
            ["-NoProfile".to_string(), "-Command".to_string(), command],
        )
    }
}

/// Launches `<current exe> --run-me-elevated <pid>` through the `runas` verb
/// and waits for it.
fn run_elevation_bridge(pid: u32) -> Result<()> {
    let exe = std::env::current_exe()?;
    let file = wide_os(exe.as_os_str());
    let params = wide(&format!("{} {}", ELEVATE_MARKER, pid));
    let verb = wide("runas");

    let mut info = SHELLEXECUTEINFOW {
        cbSize: std::mem::size_of::<SHELLEXECUTEINFOW>() as u32,
        fMask: SEE_MASK_NOCLOSEPROCESS,
        lpVerb: PCWSTR(verb.as_ptr()),
        lpFile: PCWSTR(file.as_ptr()),
        lpParameters: PCWSTR(params.as_ptr()),
        nShow: SW_HIDE.0 as i32,
        ..Default::default()
    };
    unsafe { ShellExecuteExW(&mut info) }
        .map_err(|e| ProcessError::ElevationDenied(e.message().to_string()))?;
    if info.hProcess.is_invalid() {
        return Err(ProcessError::ElevationDenied(
            "elevated helper did not start".into(),
        ));
    }
    // SAFETY: SEE_MASK_NOCLOSEPROCESS hands the helper handle to us.
    let helper = unsafe { Handle::from_raw(info.hProcess) };

    unsafe { WaitForSingleObject(helper.raw(), INFINITE) };
    let mut code = 0u32;
    unsafe { GetExitCodeProcess(helper.raw(), &mut code) }?;
    if code != 0 {
        return Err(ProcessError::ElevationInternal(ElevationCode(code as i32)));
    }
    Ok(())
}

/// Helper side of the elevation bridge, running elevated.
///
/// Gives a copy of our token to the suspended process `pid` and resumes its
/// first thread.
pub(crate) fn run_elevation_helper(pid: &str) -> std::result::Result<(), HelperCode> {
    let pid: u32 = pid.parse().map_err(|_| HelperCode::PidConv)?;
    if pid == 0 {
        return Err(HelperCode::InvalidPid);
    }

    let mut raw = HANDLE::default();
    unsafe {
        OpenProcessToken(
            GetCurrentProcess(),
            TOKEN_ACCESS_MASK(MAXIMUM_ALLOWED),
            &mut raw,
        )
    }
    .map_err(|_| HelperCode::GetCurrTok)?;
    // SAFETY: every handle below is returned fresh by the call before it.
    let current = unsafe { Handle::from_raw(raw) };

    let mut raw = HANDLE::default();
    unsafe {
        DuplicateTokenEx(
            current.raw(),
            TOKEN_ACCESS_MASK(MAXIMUM_ALLOWED),
            None,
            SecurityImpersonation,
            TokenPrimary,
            &mut raw,
        )
    }
    .map_err(|_| HelperCode::DupToken)?;
    let primary = unsafe { Handle::from_raw(raw) };

    let mut elevation = TOKEN_ELEVATION::default();
    let mut len = 0u32;
    unsafe {
        GetTokenInformation(
            primary.raw(),
            TokenElevation,
            Some(&mut elevation as *mut TOKEN_ELEVATION as *mut c_void),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut len,
        )
    }
    .map_err(|_| HelperCode::GetTokInfo)?;
    if elevation.TokenIsElevated == 0 {
        return Err(HelperCode::GetTokInfo);
    }

    let raw = unsafe { OpenProcess(PROCESS_SET_INFORMATION, BOOL(0), pid) }
        .map_err(|_| HelperCode::OpenProc)?;
    let process = unsafe { Handle::from_raw(raw) };

    let access = ProcessAccessToken {
        token: primary.raw(),
        thread: HANDLE::default(),
    };
    unsafe {
        NtSetInformationProcess(
            process.raw(),
            PROCESS_ACCESS_TOKEN_CLASS,
            &access as *const ProcessAccessToken as *const c_void,
            std::mem::size_of::<ProcessAccessToken>() as u32,
        )
    }
    .map_err(|_| HelperCode::SetTok)?;

    let thread_id = first_thread_of(pid)?;
    let raw = unsafe { OpenThread(THREAD_SUSPEND_RESUME, BOOL(0), thread_id) }
        .map_err(|_| HelperCode::OpenProcThread)?;
    let thread = unsafe { Handle::from_raw(raw) };

    if unsafe { ResumeThread(thread.raw()) } == u32::MAX {
        return Err(HelperCode::Resume);
    }
    Ok(())
}

fn first_thread_of(pid: u32) -> std::result::Result<u32, HelperCode> {
    let raw = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) }
        .map_err(|_| HelperCode::CreateProcSnap)?;
    let snapshot = unsafe { Handle::from_raw(raw) };

    let mut entry = THREADENTRY32 {
        dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
        ..Default::default()
    };
    unsafe { Thread32First(snapshot.raw(), &mut entry) }
        .map_err(|_| HelperCode::ReadThreadInfo)?;
    loop {
        if entry.th32OwnerProcessID == pid {
            return Ok(entry.th32ThreadID);
        }
        unsafe { Thread32Next(snapshot.raw(), &mut entry) }
            .map_err(|_| HelperCode::ReadThreadInfo)?;
    }
}

/// Helper side of [`Process::new_elevated`]: runs `command` on the console
/// of `ppid` and returns its exit code.
pub(crate) fn run_sudo_helper(ppid: &str, command: &[String]) -> i32 {
    if !am_admin() {
        eprintln!("{} requires administrative rights", SUDO_MARKER);
        return 1;
    }
    let ppid: u32 = match ppid.parse() {
        Ok(ppid) => ppid,
        Err(e) => {
            eprintln!("invalid parent pid {:?}: {}", ppid, e);
            return 1;
        }
    };
    let Some((exec, args)) = command.split_first() else {
        eprintln!("{}: missing command", SUDO_MARKER);
        return 1;
    };

    if let Err(e) = change_console(ppid) {
        eprintln!("attach to console of {}: {}", ppid, e);
        return 1;
    }

    let process = match Process::new("", exec, args.iter().cloned()) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };
    if let Err(e) = process.start(InputSource::stdin(), OutputSink::stdout(), OutputSink::stderr()) {
        eprintln!("{}", e);
        return 1;
    }
    process.wait().code
}

/// Moves to the console of `pid` and points our std handles at it.
fn change_console(pid: u32) -> Result<()> {
    signal::free_console()?;
    signal::attach_console(pid)?;

    let input = open_console("CONIN$")?;
    let output = open_console("CONOUT$")?;
    unsafe {
        SetStdHandle(STD_INPUT_HANDLE, input)?;
        SetStdHandle(STD_OUTPUT_HANDLE, output)?;
        SetStdHandle(STD_ERROR_HANDLE, output)?;
    }
    Ok(())
}

/// Opens a console buffer. The handle stays open for the rest of the process.
fn open_console(name: &str) -> Result<HANDLE> {
    let name = wide(name);
    let handle = unsafe {
        CreateFileW(
            PCWSTR(name.as_ptr()),
            (GENERIC_READ | GENERIC_WRITE).0,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            None,
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL,
            HANDLE::default(),
        )
    }?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_helper_pid() {
        assert_eq!(run_elevation_helper("x1"), Err(HelperCode::PidConv));
        assert_eq!(run_elevation_helper("0"), Err(HelperCode::InvalidPid));
    }

    #[test]
    fn test_sudo_helper_rejects_missing_command() {
        if am_admin() {
            assert_eq!(run_sudo_helper("1", &[]), 1);
        }
        assert_eq!(run_sudo_helper("not-a-pid", &["cmd.exe".to_string()]), 1);
    }

    #[test]
    fn test_new_elevated_wraps_powershell() {
        if am_admin() {
            return;
        }
        let p = Process::new_elevated("", "cmd.exe", ["/c", "exit 0"]).unwrap();
        assert_eq!(p.name(), "powershell");
        assert!(p.args()[2].contains(SUDO_MARKER));
        assert!(p.args()[2].contains("-Verb RunAs"));
    }
}
