//! Running children with other privileges than our own
//!
//! On Windows a non-elevated parent can start a child with administrative
//! rights while keeping its stdio pipes: the child is created suspended and
//! an elevated helper copy of this executable swaps its token and resumes
//! it. See [`crate::helper`] for the helper side.

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::am_admin;
#[cfg(windows)]
pub(crate) use self::windows::{run_elevation_helper, run_sudo_helper};

/// Whether we run with administrative rights.
#[cfg(unix)]
pub fn am_admin() -> bool {
    nix::unistd::geteuid().is_root()
}
