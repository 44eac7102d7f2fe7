//! Windows console control events
//!
//! Thin wrappers around the console API plus the Ctrl-C helper protocol used
//! by [`stop_process`].

use std::os::windows::process::CommandExt;
use std::process::Command;
use std::sync::OnceLock;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, warn};
use windows::Win32::Foundation::BOOL;
use windows::Win32::System::Console::{
    AllocConsole, AttachConsole, FreeConsole, GenerateConsoleCtrlEvent, SetConsoleCtrlHandler,
    CTRL_BREAK_EVENT, CTRL_C_EVENT,
};

use super::{check_target, CTRL_C_BACKLOG};
use crate::error::{ProcessError, Result};
use crate::helper::SEND_CTRL_MARKER;

const CREATE_NO_WINDOW: u32 = 0x0800_0000;

static LISTENERS: OnceLock<Mutex<Vec<Sender<()>>>> = OnceLock::new();

pub fn attach_console(pid: u32) -> Result<()> {
    unsafe { AttachConsole(pid) }?;
    Ok(())
}

pub fn free_console() -> Result<()> {
    unsafe { FreeConsole() }?;
    Ok(())
}

pub fn alloc_console() -> Result<()> {
    unsafe { AllocConsole() }?;
    Ok(())
}

/// Raises Ctrl-C on every process attached to our console.
pub fn generate_console_ctrl_c_event() -> Result<()> {
    unsafe { GenerateConsoleCtrlEvent(CTRL_C_EVENT, 0) }?;
    Ok(())
}

pub fn generate_console_ctrl_break_event() -> Result<()> {
    unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, 0) }?;
    Ok(())
}

/// Makes this process ignore Ctrl-C.
pub fn remove_console_ctrl_handler() -> Result<()> {
    unsafe { SetConsoleCtrlHandler(None, BOOL(1)) }?;
    Ok(())
}

/// Restores the default Ctrl-C reaction.
pub fn restore_console_ctrl_handler() -> Result<()> {
    unsafe { SetConsoleCtrlHandler(None, BOOL(0)) }?;
    Ok(())
}

/// Raises Ctrl-C on our current console without reacting to it ourselves.
pub fn send_ctrl_c() -> Result<()> {
    remove_console_ctrl_handler()?;
    generate_console_ctrl_c_event()
}

/// Moves to the console of `pid` and raises Ctrl-C there.
///
/// This leaves the calling process detached from its own console, so it is
/// only meant to run inside the helper spawned by [`stop_process`].
pub fn send_ctrl_c_to(pid: u32) -> Result<()> {
    check_target(pid)?;
    if let Err(e) = free_console() {
        // spawned without a console: nothing to detach from
        debug!("free console: {}", e);
    }
    attach_console(pid)?;
    send_ctrl_c()
}

/// Delivers Ctrl-C to the console of `pid` through a helper copy of the
/// current executable.
///
/// The helper is `<current exe> --nix-send-ctrl <pid>`; the binary has to
/// call [`crate::intercept_helper_args`] first thing in `main`.
pub fn stop_process(pid: u32) -> Result<()> {
    check_target(pid)?;
    let exe = std::env::current_exe()?;
    let output = Command::new(&exe)
        .arg(SEND_CTRL_MARKER)
        .arg(pid.to_string())
        .creation_flags(CREATE_NO_WINDOW)
        .output()
        .map_err(|e| ProcessError::StopUnsupported(format!("{}: {}", exe.display(), e)))?;

    let mut reason = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !reason.is_empty() {
            reason.push_str("; ");
        }
        reason.push_str(stderr.trim());
    }

    if !output.status.success() || !reason.is_empty() {
        if reason.is_empty() {
            reason = format!("helper exited with {}", output.status);
        }
        return Err(ProcessError::StopFailed { pid, reason });
    }
    debug!("ctrl-c delivered to pid {}", pid);
    Ok(())
}

unsafe extern "system" fn console_handler(ctrl_type: u32) -> BOOL {
    if ctrl_type != CTRL_C_EVENT {
        return BOOL(0);
    }
    let Some(listeners) = LISTENERS.get() else {
        return BOOL(0);
    };
    let mut listeners = listeners.lock();
    listeners.retain(|tx| match tx.try_send(()) {
        Ok(()) | Err(TrySendError::Full(())) => true,
        Err(TrySendError::Disconnected(())) => false,
    });
    BOOL(1)
}

/// Returns a channel that receives `()` on every Ctrl-C of our console.
///
/// While at least one listener is registered the process no longer
/// terminates on Ctrl-C.
pub fn listen_for_ctrl_c() -> Result<Receiver<()>> {
    let (tx, rx) = bounded(CTRL_C_BACKLOG);
    let mut registered = false;
    let listeners = LISTENERS.get_or_init(|| {
        registered = true;
        Mutex::new(Vec::new())
    });
    if registered {
        if let Err(e) = unsafe { SetConsoleCtrlHandler(Some(console_handler), BOOL(1)) } {
            warn!("failed to register console control handler: {}", e);
            return Err(e.into());
        }
    }
    listeners.lock().push(tx);
    Ok(rx)
}
