//! Interrupt delivery and Ctrl-C notification
//!
//! On unix an interrupt is a plain `SIGINT`. On Windows a Ctrl-C addresses a
//! console rather than a process, so [`stop_process`] re-invokes the current
//! executable as a helper that borrows the target's console to raise it.

use crate::error::{ProcessError, Result};

/// Pending Ctrl-C notifications kept per listener.
const CTRL_C_BACKLOG: usize = 10;

/// Whether `pid` names a single process an interrupt may be sent to.
///
/// On unix `0` and values beyond `pid_t` address process groups (`u32::MAX`
/// wraps to `-1`, every process we may signal). On Windows `0` is the idle
/// process and `u32::MAX` is `ATTACH_PARENT_PROCESS`, our own console.
pub fn is_signalable_pid(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    if cfg!(windows) {
        pid != u32::MAX
    } else {
        i32::try_from(pid).is_ok()
    }
}

fn check_target(pid: u32) -> Result<()> {
    if is_signalable_pid(pid) {
        Ok(())
    } else {
        Err(ProcessError::StopFailed {
            pid,
            reason: "not a valid process id".into(),
        })
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use self::unix::{listen_for_ctrl_c, stop_process};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::{
    alloc_console, attach_console, free_console, generate_console_ctrl_break_event,
    generate_console_ctrl_c_event, listen_for_ctrl_c, remove_console_ctrl_handler,
    restore_console_ctrl_handler, send_ctrl_c, send_ctrl_c_to, stop_process,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signalable_pids() {
        assert!(is_signalable_pid(1));
        assert!(is_signalable_pid(std::process::id()));
        assert!(!is_signalable_pid(0));
        assert!(!is_signalable_pid(u32::MAX));
        #[cfg(unix)]
        assert!(!is_signalable_pid(i32::MAX as u32 + 1));
    }

    #[test]
    fn test_stop_process_rejects_group_addresses() {
        for pid in [0, u32::MAX] {
            match stop_process(pid) {
                Err(ProcessError::StopFailed { pid: got, .. }) => assert_eq!(got, pid),
                other => panic!("stop_process({}) returned {:?}", pid, other),
            }
        }
    }
}
