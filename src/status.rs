//! Exit status of a finished child

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::error::ProcessError;

/// Exit code recorded when the child ended because of a user interrupt.
///
/// On unix a child killed by `SIGINT` is recorded as `128 + SIGINT`.
#[cfg(unix)]
pub const INTERRUPTED_EXIT_CODE: i32 = 128 + libc::SIGINT;

/// `STATUS_CONTROL_C_EXIT`
#[cfg(windows)]
pub const INTERRUPTED_EXIT_CODE: i32 = 0xC000013Au32 as i32;

/// Status of a process after it has exited
///
/// Every waiter receives its own copy; the OS wait error, if any, is shared.
#[derive(Debug, Clone, Default)]
pub struct ExitStatus {
    pub pid: u32,
    pub code: i32,
    pub os_error: Option<Arc<io::Error>>,
}

impl ExitStatus {
    /// `None` when the child exited with 0 or with the interrupted sentinel,
    /// otherwise an error describing the status.
    pub fn error(&self) -> Option<ProcessError> {
        if self.success() {
            None
        } else {
            Some(ProcessError::Exit(self.clone()))
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0 || self.interrupted()
    }

    pub fn interrupted(&self) -> bool {
        self.code == INTERRUPTED_EXIT_CODE
    }

    /// Same as [`ExitStatus::error`], shaped as a `Result`.
    pub fn into_result(self) -> crate::Result<ExitStatus> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

impl PartialEq for ExitStatus {
    fn eq(&self, other: &Self) -> bool {
        let same_error = match (&self.os_error, &other.os_error) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a.to_string() == b.to_string(),
            _ => false,
        };
        self.pid == other.pid && self.code == other.code && same_error
    }
}

impl Eq for ExitStatus {}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.os_error {
            Some(err) => write!(f, "exit status (code {}): {}", self.code, err),
            None => write!(f, "exit status (code {})", self.code),
        }
    }
}

/// The OS wait error, when there was one, is the source.
impl std::error::Error for ExitStatus {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.os_error
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: i32) -> ExitStatus {
        ExitStatus {
            pid: 42,
            code,
            os_error: None,
        }
    }

    #[test]
    fn test_zero_is_not_an_error() {
        assert!(status(0).error().is_none());
        assert!(status(0).into_result().is_ok());
    }

    #[test]
    fn test_interrupted_is_not_an_error() {
        let s = status(INTERRUPTED_EXIT_CODE);
        assert!(s.interrupted());
        assert!(s.error().is_none());
    }

    #[test]
    fn test_interrupted_ignores_os_error() {
        let s = ExitStatus {
            pid: 1,
            code: INTERRUPTED_EXIT_CODE,
            os_error: Some(Arc::new(io::Error::new(io::ErrorKind::Other, "wait"))),
        };
        assert!(s.error().is_none());
    }

    #[test]
    fn test_nonzero_is_an_error() {
        let err = status(1).error().expect("code 1 must be an error");
        assert_eq!(err.to_string(), "exit status (code 1)");
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_error_message_includes_os_error() {
        let s = ExitStatus {
            pid: 1,
            code: 2,
            os_error: Some(Arc::new(io::Error::new(io::ErrorKind::Other, "boom"))),
        };
        assert_eq!(s.to_string(), "exit status (code 2): boom");
    }

    #[test]
    fn test_exit_error_wraps_os_error() {
        use std::error::Error;

        let s = ExitStatus {
            pid: 1,
            code: 2,
            os_error: Some(Arc::new(io::Error::new(io::ErrorKind::Other, "boom"))),
        };
        let err = s.error().expect("code 2 must be an error");
        let source = err.source().expect("os error must be reachable");
        assert_eq!(source.to_string(), "boom");
        let io_err = source.downcast_ref::<io::Error>().unwrap();
        assert_eq!(io_err.kind(), io::ErrorKind::Other);

        assert!(status(3).error().unwrap().source().is_none());
    }

    #[test]
    fn test_clones_compare_equal() {
        let s = ExitStatus {
            pid: 7,
            code: 9,
            os_error: Some(Arc::new(io::Error::new(io::ErrorKind::Other, "x"))),
        };
        assert_eq!(s.clone(), s);
        assert_ne!(s, status(9));
    }
}
