use std::{convert, fmt, result, str};

/// Failures of the Windows introspection layer.
///
/// Most snapshot builders never surface these to callers — a failed
/// build publishes an empty map instead (so "no data" and "genuinely
/// empty" read identically). Errors are reserved for conditions the
/// caller must react to, like unlocatable EPROCESS offsets.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Error {
    /// Anything without a more precise variant.
    Other(&'static str),
    /// A bounds constraint on guest data did not hold.
    Bounds,
    /// The target architecture is not supported by this code path.
    InvalidArchitecture,
    /// Context setup could not complete.
    Initialization(&'static str),
    /// Neither the pattern locators nor debug symbols produced usable
    /// EPROCESS field offsets.
    Offsets(&'static str),
    /// Process lookup or enumeration failed.
    ProcessInfo,
    /// Module lookup failed.
    ModuleInfo,
    /// Error bubbled up from the memory-access substrate.
    Core(memscope_core::Error),
    /// PE image data failed validation.
    PE(&'static str),
    /// A required external engine (symbols, registry, ...) is not
    /// attached to the context.
    Provider(&'static str),
    /// Guest string data did not decode.
    Encoding,
    /// A guest `UNICODE_STRING` was malformed.
    Unicode(&'static str),
}

impl convert::From<&'static str> for Error {
    fn from(error: &'static str) -> Self {
        Error::Other(error)
    }
}

impl From<memscope_core::Error> for Error {
    fn from(error: memscope_core::Error) -> Error {
        Error::Core(error)
    }
}

impl From<str::Utf8Error> for Error {
    fn from(_err: str::Utf8Error) -> Error {
        Error::Encoding
    }
}

impl Error {
    /// Splits the error into a static description and an optional
    /// detail string.
    pub fn to_str_pair(self) -> (&'static str, Option<&'static str>) {
        match self {
            Error::Other(e) => ("error", Some(e)),
            Error::Bounds => ("bounds check failed", None),
            Error::InvalidArchitecture => ("unsupported architecture", None),
            Error::Initialization(e) => ("initialization failed", Some(e)),
            Error::Offsets(e) => ("eprocess offsets not located", Some(e)),
            Error::ProcessInfo => ("process information unavailable", None),
            Error::ModuleInfo => ("module information unavailable", None),
            Error::Core(e) => e.to_str_pair(),
            Error::PE(e) => ("pe validation failed", Some(e)),
            Error::Provider(e) => ("external provider not attached", Some(e)),
            Error::Encoding => ("string decoding failed", None),
            Error::Unicode(e) => ("unicode string malformed", Some(e)),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.to_str_pair() {
            (desc, Some(detail)) => write!(f, "{}: {}", desc, detail),
            (desc, None) => f.write_str(desc),
        }
    }
}

impl std::error::Error for Error {}

/// Result alias used throughout the win32 crate.
pub type Result<T> = result::Result<T, Error>;
