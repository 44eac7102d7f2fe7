//! Self-reinvocation helpers
//!
//! Stopping and elevating a Windows child both need a second copy of the
//! current executable. That copy is started with one of the marker arguments
//! below, and [`intercept_helper_args`] must run first thing in `main` so the
//! copy performs its routine and exits before any application code runs.

use std::ffi::OsString;

use crate::error::HelperCode;

/// `--nix-send-ctrl <pid>`: raise Ctrl-C on the console of `pid`.
pub const SEND_CTRL_MARKER: &str = "--nix-send-ctrl";
/// `--run-me-elevated <pid>`: hand our elevated token to the suspended `pid`.
pub const ELEVATE_MARKER: &str = "--run-me-elevated";
/// `--nix-sudo <ppid> <exec> [args...]`: run `exec` on the console of `ppid`.
pub const SUDO_MARKER: &str = "--nix-sudo";

/// A helper routine requested on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperCall {
    SendCtrl { pid: String },
    Elevate { pid: String },
    Sudo { ppid: String, command: Vec<String> },
}

/// Recognizes a helper invocation. `args[0]` is the program name.
pub fn parse_helper_args<S: AsRef<str>>(args: &[S]) -> Option<HelperCall> {
    let marker = args.get(1)?.as_ref();
    let arg = |i: usize| args.get(i).map(|s| s.as_ref().to_string()).unwrap_or_default();

    match marker {
        SEND_CTRL_MARKER => Some(HelperCall::SendCtrl { pid: arg(2) }),
        ELEVATE_MARKER => Some(HelperCall::Elevate { pid: arg(2) }),
        SUDO_MARKER => Some(HelperCall::Sudo {
            ppid: arg(2),
            command: args
                .iter()
                .skip(3)
                .map(|s| s.as_ref().to_string())
                .collect(),
        }),
        _ => None,
    }
}

impl HelperCall {
    /// Runs the routine and returns the exit code for the helper process.
    ///
    /// Failures print one line to stderr; success prints nothing.
    pub fn run(self) -> i32 {
        match self {
            HelperCall::SendCtrl { pid } => match pid.parse::<u32>() {
                Ok(pid) if !crate::signal::is_signalable_pid(pid) => {
                    eprintln!("invalid pid {}", pid);
                    HelperCode::InvalidPid.as_exit_code()
                }
                Ok(pid) => match send_ctrl(pid) {
                    Ok(()) => 0,
                    Err(e) => {
                        eprintln!("send ctrl-c to {}: {}", pid, e);
                        1
                    }
                },
                Err(e) => {
                    eprintln!("invalid pid {:?}: {}", pid, e);
                    HelperCode::PidConv.as_exit_code()
                }
            },
            HelperCall::Elevate { pid } => elevate(&pid),
            HelperCall::Sudo { ppid, command } => sudo(&ppid, &command),
        }
    }
}

/// Runs the helper routine named by our own arguments, if any, and exits.
///
/// Returns normally when the process was started without a helper marker.
pub fn intercept_helper_args() {
    let args: Vec<String> = std::env::args_os()
        .map(|a: OsString| a.to_string_lossy().into_owned())
        .collect();
    if let Some(call) = parse_helper_args(&args) {
        std::process::exit(call.run());
    }
}

#[cfg(unix)]
fn send_ctrl(pid: u32) -> crate::Result<()> {
    crate::signal::stop_process(pid)
}

#[cfg(windows)]
fn send_ctrl(pid: u32) -> crate::Result<()> {
    crate::signal::send_ctrl_c_to(pid)
}

#[cfg(windows)]
fn elevate(pid: &str) -> i32 {
    match crate::elevation::run_elevation_helper(pid) {
        Ok(()) => 0,
        Err(code) => {
            eprintln!("elevation helper: {}", code);
            code.as_exit_code()
        }
    }
}

#[cfg(unix)]
fn elevate(_pid: &str) -> i32 {
    eprintln!("{} is only supported on windows", ELEVATE_MARKER);
    1
}

#[cfg(windows)]
fn sudo(ppid: &str, command: &[String]) -> i32 {
    crate::elevation::run_sudo_helper(ppid, command)
}

#[cfg(unix)]
fn sudo(_ppid: &str, _command: &[String]) -> i32 {
    eprintln!("{} is only supported on windows", SUDO_MARKER);
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_marker() {
        assert_eq!(parse_helper_args(&["app", "run", "x"]), None);
        assert_eq!(parse_helper_args(&["app"]), None);
        assert_eq!(parse_helper_args::<&str>(&[]), None);
    }

    #[test]
    fn test_send_ctrl_marker() {
        assert_eq!(
            parse_helper_args(&["app", "--nix-send-ctrl", "42"]),
            Some(HelperCall::SendCtrl { pid: "42".into() })
        );
    }

    #[test]
    fn test_elevate_marker_without_pid() {
        assert_eq!(
            parse_helper_args(&["app", "--run-me-elevated"]),
            Some(HelperCall::Elevate { pid: String::new() })
        );
    }

    #[test]
    fn test_sudo_marker() {
        assert_eq!(
            parse_helper_args(&["app", "--nix-sudo", "7", "cmd.exe", "/c", "dir"]),
            Some(HelperCall::Sudo {
                ppid: "7".into(),
                command: vec!["cmd.exe".into(), "/c".into(), "dir".into()],
            })
        );
    }

    #[test]
    fn test_bad_pid_exit_code() {
        let code = HelperCall::SendCtrl { pid: "abc".into() }.run();
        assert_eq!(code, HelperCode::PidConv.as_exit_code());
    }

    #[test]
    fn test_group_pids_are_refused() {
        for pid in ["0", "4294967295"] {
            let code = HelperCall::SendCtrl { pid: pid.into() }.run();
            assert_eq!(code, HelperCode::InvalidPid.as_exit_code());
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_send_ctrl_interrupts_on_unix() {
        let mut child = std::process::Command::new("sleep").arg("10").spawn().unwrap();
        let code = HelperCall::SendCtrl {
            pid: child.id().to_string(),
        }
        .run();
        assert_eq!(code, 0);
        assert!(!child.wait().unwrap().success());
    }
}
