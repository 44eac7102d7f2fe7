//! Lowered-integrity primary tokens for Windows children

use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

use tracing::debug;
use windows::Win32::Foundation::{HANDLE, PSID};
use windows::Win32::Security::AppLocker::{
    SaferCloseLevel, SaferComputeTokenFromLevel, SaferCreateLevel,
    SAFER_COMPUTE_TOKEN_FROM_LEVEL_FLAGS, SAFER_LEVELID_NORMALUSER, SAFER_LEVEL_HANDLE,
    SAFER_LEVEL_OPEN, SAFER_SCOPEID_USER,
};
use windows::Win32::Security::{
    SetTokenInformation, TokenIntegrityLevel, SID_AND_ATTRIBUTES, TOKEN_MANDATORY_LABEL,
};
use windows::Win32::System::SystemServices::SE_GROUP_INTEGRITY;

use crate::error::{ProcessError, Result};
use crate::process::windows::Handle;

/// `S-1-16-8192`, the Medium mandatory level, in binary SID form.
const MEDIUM_INTEGRITY_SID: [u8; 12] = [
    0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x20, 0x00, 0x00,
];

/// A primary access token a child can be spawned with
///
/// Cloning shares the underlying handle, which is closed with the last clone.
#[derive(Clone)]
pub struct PrimaryToken(Arc<Handle>);

impl PrimaryToken {
    /// # Safety
    /// `raw` must be a primary token handle owned by nobody else.
    pub unsafe fn from_raw(raw: HANDLE) -> Self {
        PrimaryToken(Arc::new(Handle::from_raw(raw)))
    }

    pub fn raw(&self) -> HANDLE {
        self.0.raw()
    }
}

impl fmt::Debug for PrimaryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrimaryToken({:?})", self.raw().0)
    }
}

fn issuance(step: &str, e: windows::core::Error) -> ProcessError {
    ProcessError::TokenIssuance(format!("{}: {}", step, e))
}

/// Computes a "normal user" token from ours and labels it Medium integrity.
///
/// Attach it with `spawn_attributes_mut().token` to start a child without our
/// administrative rights.
pub fn lower_privilege_token() -> Result<PrimaryToken> {
    let mut level = SAFER_LEVEL_HANDLE::default();
    unsafe {
        SaferCreateLevel(
            SAFER_SCOPEID_USER,
            SAFER_LEVELID_NORMALUSER,
            SAFER_LEVEL_OPEN,
            &mut level,
            None,
        )
    }
    .map_err(|e| issuance("SaferCreateLevel", e))?;

    let mut raw = HANDLE::default();
    let computed = unsafe {
        SaferComputeTokenFromLevel(
            level,
            HANDLE::default(),
            &mut raw,
            SAFER_COMPUTE_TOKEN_FROM_LEVEL_FLAGS(0),
            None,
        )
    };
    unsafe {
        let _ = SaferCloseLevel(level);
    }
    computed.map_err(|e| issuance("SaferComputeTokenFromLevel", e))?;
    // SAFETY: the computed token is ours to close.
    let token = unsafe { PrimaryToken::from_raw(raw) };

    let mut sid = MEDIUM_INTEGRITY_SID;
    let label = TOKEN_MANDATORY_LABEL {
        Label: SID_AND_ATTRIBUTES {
            Sid: PSID(sid.as_mut_ptr() as *mut c_void),
            Attributes: SE_GROUP_INTEGRITY as u32,
        },
    };
    unsafe {
        SetTokenInformation(
            token.raw(),
            TokenIntegrityLevel,
            &label as *const TOKEN_MANDATORY_LABEL as *const c_void,
            std::mem::size_of::<TOKEN_MANDATORY_LABEL>() as u32,
        )
    }
    .map_err(|e| issuance("SetTokenInformation", e))?;

    debug!("issued medium integrity token {:?}", token);
    Ok(token)
}
