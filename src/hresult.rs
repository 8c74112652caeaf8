use std::fmt::{Debug, Display, Formatter};

use crate::error::Error;

/// Signed status code shared with the native side. Non-negative values are
/// successes (0 is full success, small positive values are qualified
/// successes), negative values encode a failure as a facility/code pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HResult(pub i32);

impl HResult {
    pub const OK: HResult = HResult(0);
    pub const FALSE: HResult = HResult(1);

    pub const E_NOTIMPL: HResult = HResult(0x8000_4001u32 as i32);
    /// Universal meaning: QueryInterface does not recognize the IID.
    pub const E_NOINTERFACE: HResult = HResult(0x8000_4002u32 as i32);
    pub const E_POINTER: HResult = HResult(0x8000_4003u32 as i32);
    pub const E_FAIL: HResult = HResult(0x8000_4005u32 as i32);
    /// Universal meaning: generic fallback when an implementation error is
    /// converted to a status code without a more specific mapping.
    pub const E_UNEXPECTED: HResult = HResult(0x8000_FFFFu32 as i32);
    pub const E_OUTOFMEMORY: HResult = HResult(0x8007_000Eu32 as i32);
    pub const E_INVALIDARG: HResult = HResult(0x8007_0057u32 as i32);
    pub const E_BOUNDS: HResult = HResult(0x8000_000Bu32 as i32);
    /// Reached the end of the stream; distinct from a zero-length read.
    pub const E_EOF: HResult = HResult(0x8007_0026u32 as i32);
    pub const E_UNINITIALIZED: HResult = HResult(0x8004_0007u32 as i32);

    pub fn succeeded(self) -> bool {
        self.0 >= 0
    }

    pub fn failed(self) -> bool {
        self.0 < 0
    }

    /// Message for the handful of codes this library assigns fixed meaning.
    pub fn message(self) -> Option<&'static str> {
        let msg = match self {
            Self::OK => "The operation completed successfully",
            Self::FALSE => "The operation completed with a qualified success",
            Self::E_NOTIMPL => "Not implemented",
            Self::E_NOINTERFACE => "No such interface supported",
            Self::E_POINTER => "Invalid pointer",
            Self::E_FAIL => "Unspecified error",
            Self::E_UNEXPECTED => "Unexpected failure",
            Self::E_OUTOFMEMORY => "Not enough memory",
            Self::E_INVALIDARG => "The parameter is incorrect",
            Self::E_BOUNDS => "Bounds of the operation were exceeded",
            Self::E_EOF => "Reached the end of the file",
            Self::E_UNINITIALIZED => "Uninitialized object",
            _ => return None,
        };
        Some(msg)
    }

    /// Do nothing for successes, produce the error for failures, carrying
    /// the original code for programmatic inspection.
    pub fn check(self) -> Result<(), Error> {
        if self.succeeded() {
            Ok(())
        } else {
            Err(Error::Com(self))
        }
    }

    /// Boolean-as-status decoding: 0 means true, any other non-negative
    /// value means false, negative values are failures.
    pub fn check_bool(self) -> Result<bool, Error> {
        self.check()?;
        Ok(self == Self::OK)
    }
}

impl From<i32> for HResult {
    fn from(code: i32) -> Self {
        HResult(code)
    }
}

impl Display for HResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{msg} (0x{:08x})", self.0 as u32),
            // facility + code render for codes outside the fixed table
            None if self.failed() => write!(
                f,
                "Error 0x{:08x} (facility 0x{:03x}, code 0x{:04x})",
                self.0 as u32,
                (self.0 as u32 >> 16) & 0x7ff,
                self.0 as u32 & 0xffff,
            ),
            None => write!(f, "Success 0x{:08x}", self.0 as u32),
        }
    }
}

impl Debug for HResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "HResult(0x{:08x})", self.0 as u32)
    }
}
