//! Child process control with captured output and graceful stop
//!
//! [`Process`] wraps one external command: start it with any combination of
//! inherited, captured or mirrored stdio, feed its stdin, follow its output
//! line by line, and stop it with a Ctrl-C that behaves the same on unix and
//! on the Windows console.
//!
//! Binaries using this crate on Windows must call [`intercept_helper_args`]
//! first thing in `main`: stopping and elevating children re-invoke the
//! current executable as a helper.

pub mod args;
pub mod capture;
pub mod elevation;
pub mod error;
pub mod helper;
pub mod hub;
pub mod process;
pub mod signal;
pub mod status;
pub mod stdin_forwarder;
pub mod stdio;
#[cfg(windows)]
pub mod token;

pub use args::{parse_command_args, split_command};
pub use elevation::am_admin;
pub use error::{ElevationCode, HelperCode, ProcessError, Result};
pub use helper::intercept_helper_args;
pub use hub::{Hub, Line, Subscription};
pub use process::{Phase, Process, SpawnAttributes};
pub use signal::{is_signalable_pid, listen_for_ctrl_c, stop_process};
pub use status::{ExitStatus, INTERRUPTED_EXIT_CODE};
pub use stdio::{dev_null, DevNull, InputSource, OutputSink, ParentStream};
#[cfg(windows)]
pub use token::{lower_privilege_token, PrimaryToken};
