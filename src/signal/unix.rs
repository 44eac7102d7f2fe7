//! Unix signal handling

use std::thread;

use crossbeam_channel::{bounded, Receiver, TrySendError};
use signal_hook::consts::signal::SIGINT;
use signal_hook::iterator::Signals;
use tracing::{debug, trace};

use super::{check_target, CTRL_C_BACKLOG};
use crate::error::Result;

/// Returns a channel that receives `()` every time we get `SIGINT`.
///
/// Registering a listener replaces the default "terminate" reaction to
/// Ctrl-C for the whole process. Notifications beyond the backlog of an
/// unread channel are dropped.
pub fn listen_for_ctrl_c() -> Result<Receiver<()>> {
    let mut signals = Signals::new([SIGINT])?;
    let handle = signals.handle();
    let (tx, rx) = bounded(CTRL_C_BACKLOG);

    thread::Builder::new()
        .name("proctrl-ctrl-c".into())
        .spawn(move || {
            for signal in signals.forever() {
                trace!("received signal {}", signal);
                match tx.try_send(()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(())) => debug!("ctrl-c listener backlog full"),
                    Err(TrySendError::Disconnected(())) => {
                        handle.close();
                        break;
                    }
                }
            }
        })?;

    Ok(rx)
}

/// Sends `SIGINT` to `pid`. A pid that no longer exists is not an error.
///
/// Pids that would address a process group are refused with `StopFailed`.
pub fn stop_process(pid: u32) -> Result<()> {
    check_target(pid)?;
    crate::process::interrupt_pid(pid)?;
    Ok(())
}
