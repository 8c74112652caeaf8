use std::fmt::{Display, Formatter};

use crate::hresult::HResult;

/// Everything that can go wrong across the bridge.
///
/// Contract and marshaling problems are raised while building descriptors,
/// proxies, or wrappers, never at call time. Call-time native failures carry
/// the original status code. Lifetime errors are loud by design: they
/// indicate a tracking bug upstream, not a recoverable condition.
#[derive(Debug, Clone)]
pub enum Error {
    /// The interface description is not usable for interop.
    Contract { context: String, detail: String },
    /// A marshaler was applied to a parameter shape it does not support.
    Marshal { context: String, detail: String },
    /// The underlying object does not support the requested interface.
    InvalidCast { context: String, detail: String },
    /// A native call returned a failure status code.
    Com(HResult),
    /// The pointer handed to the reference-bump operation is not tracked by
    /// the live object cache.
    UntrackedPointer(usize),
    /// Wrapping was attempted outside the interface's declared direction.
    DirectionNotSupported {
        interface: String,
        attempted: &'static str,
    },
    /// A call was issued on a proxy whose native reference was released.
    UseAfterRelease { interface: String },
    /// A shared library or entry point could not be loaded.
    Library(String),
}

impl Error {
    pub fn contract(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Contract {
            context: context.into(),
            detail: detail.into(),
        }
    }

    pub fn marshal(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::Marshal {
            context: context.into(),
            detail: detail.into(),
        }
    }

    pub fn invalid_cast(context: impl Into<String>, detail: impl Into<String>) -> Self {
        Error::InvalidCast {
            context: context.into(),
            detail: detail.into(),
        }
    }

    /// Status code reported to native callers when this error crosses the
    /// boundary. This is the single point where implementation errors turn
    /// into status codes; no managed detail survives the conversion.
    pub fn hresult(&self) -> HResult {
        match self {
            Error::Com(hr) => *hr,
            Error::InvalidCast { .. } => HResult::E_NOINTERFACE,
            Error::UntrackedPointer(_) | Error::UseAfterRelease { .. } => HResult::E_POINTER,
            Error::DirectionNotSupported { .. } => HResult::E_NOTIMPL,
            Error::Marshal { .. } | Error::Contract { .. } => HResult::E_INVALIDARG,
            Error::Library(_) => HResult::E_FAIL,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Contract { context, detail } => {
                write!(f, "interface contract violation in {context}: {detail}")
            }
            Error::Marshal { context, detail } => {
                write!(f, "marshaling error in {context}: {detail}")
            }
            Error::InvalidCast { context, detail } => {
                write!(f, "invalid cast to {context}: {detail}")
            }
            Error::Com(hr) => write!(f, "native call failed: {hr}"),
            Error::UntrackedPointer(p) => {
                write!(f, "native pointer {p:#x} is not on the live objects cache")
            }
            Error::DirectionNotSupported {
                interface,
                attempted,
            } => write!(
                f,
                "interface {interface} does not permit {attempted} wrapping"
            ),
            Error::UseAfterRelease { interface } => {
                write!(f, "proxy for {interface} was already released")
            }
            Error::Library(detail) => write!(f, "native library error: {detail}"),
        }
    }
}

impl std::error::Error for Error {}
