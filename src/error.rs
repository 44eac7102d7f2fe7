use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::status::ExitStatus;

/// Exit codes of the elevation helper routine (`--run-me-elevated`).
///
/// The helper runs in a separate, elevated process, so the only channel back
/// to the parent is its exit code.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HelperCode {
    PidConv = 1,
    InvalidPid = 2,
    GetCurrTok = 3,
    DupToken = 4,
    OpenProc = 5,
    GetTokInfo = 6,
    SetTok = 7,
    CreateProcSnap = 8,
    ReadThreadInfo = 9,
    OpenProcThread = 10,
    Resume = 11,
}

impl HelperCode {
    const ALL: [HelperCode; 11] = [
        HelperCode::PidConv,
        HelperCode::InvalidPid,
        HelperCode::GetCurrTok,
        HelperCode::DupToken,
        HelperCode::OpenProc,
        HelperCode::GetTokInfo,
        HelperCode::SetTok,
        HelperCode::CreateProcSnap,
        HelperCode::ReadThreadInfo,
        HelperCode::OpenProcThread,
        HelperCode::Resume,
    ];

    pub fn as_exit_code(self) -> i32 {
        self as i32
    }

    pub fn from_exit_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_exit_code() == code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HelperCode::PidConv => "pid_conv_error",
            HelperCode::InvalidPid => "invalid_pid_error",
            HelperCode::GetCurrTok => "get_curr_tok_error",
            HelperCode::DupToken => "dup_token_error",
            HelperCode::OpenProc => "open_proc_error",
            HelperCode::GetTokInfo => "get_tok_info_error",
            HelperCode::SetTok => "set_tok_error",
            HelperCode::CreateProcSnap => "create_proc_snap",
            HelperCode::ReadThreadInfo => "read_thread_info",
            HelperCode::OpenProcThread => "open_proc_thread",
            HelperCode::Resume => "resume_error",
        }
    }
}

impl fmt::Display for HelperCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw exit code of a failed elevation helper, decoded when it is a known one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElevationCode(pub i32);

impl ElevationCode {
    pub fn helper_code(self) -> Option<HelperCode> {
        HelperCode::from_exit_code(self.0)
    }
}

impl fmt::Display for ElevationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.helper_code() {
            Some(code) => write!(f, "{} ({})", code, self.0),
            None => write!(f, "unknown helper exit code {}", self.0),
        }
    }
}

/// Main error type for process operations
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("directory \"{}\" not found or not a directory", .0.display())]
    BadWorkingDirectory(PathBuf),

    #[error("executable \"{0}\" not found")]
    ExecutableNotFound(String),

    #[error("process \"{0}\" is already running")]
    AlreadyRunning(String),

    #[error("process \"{0}\" is not running")]
    NotRunning(String),

    #[error("process \"{name}\" pipe error: {source}")]
    PipeSetup {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process \"{name}\" startup error: {source}")]
    SpawnFailure {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process \"{0}\" has no input pipe")]
    NoInputPipe(String),

    #[error("graceful stop is not supported: {0}")]
    StopUnsupported(String),

    #[error("failed to stop process {pid}: {reason}")]
    StopFailed { pid: u32, reason: String },

    #[error("elevation was denied: {0}")]
    ElevationDenied(String),

    #[error("elevation helper failed: {0}")]
    ElevationInternal(ElevationCode),

    #[error("failed to issue lower privilege token: {0}")]
    TokenIssuance(String),

    #[error(transparent)]
    Exit(ExitStatus),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(unix)]
    #[error("System error: {0}")]
    System(#[from] nix::Error),

    #[cfg(windows)]
    #[error("Windows error: {0}")]
    Windows(#[from] windows::core::Error),
}

impl ProcessError {
    /// Exit code the `drop` binary reports for this error.
    ///
    /// A failed child propagates its own code; everything else is 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProcessError::Exit(status) if status.code != 0 => status.code,
            _ => 1,
        }
    }

    /// Whether the error is a lifecycle precondition failure.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ProcessError::AlreadyRunning(_)
                | ProcessError::NotRunning(_)
                | ProcessError::NoInputPipe(_)
        )
    }
}

/// Result type alias for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;

impl From<ProcessError> for i32 {
    fn from(error: ProcessError) -> Self {
        error.exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_code_roundtrip() {
        for code in HelperCode::ALL {
            assert_eq!(HelperCode::from_exit_code(code.as_exit_code()), Some(code));
        }
        assert_eq!(HelperCode::from_exit_code(0), None);
        assert_eq!(HelperCode::from_exit_code(12), None);
    }

    #[test]
    fn test_elevation_code_display() {
        assert_eq!(
            ElevationCode(HelperCode::Resume.as_exit_code()).to_string(),
            "resume_error (11)"
        );
        assert_eq!(
            ElevationCode(42).to_string(),
            "unknown helper exit code 42"
        );
    }

    #[test]
    fn test_exit_code_mapping() {
        let err = ProcessError::NotRunning("sleep".into());
        assert_eq!(err.exit_code(), 1);
        assert!(err.is_precondition());

        let status = ExitStatus {
            pid: 10,
            code: 3,
            os_error: None,
        };
        assert_eq!(ProcessError::Exit(status).exit_code(), 3);
    }
}
