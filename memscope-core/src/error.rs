/*!
Error type of the memory-access substrate.
*/

use std::{convert, fmt, result, str};

/// Failures the memory-access layer can produce.
///
/// The set is deliberately small: a read either fails at the device,
/// fails to translate, or fails a sanity constraint. Higher layers
/// attach their own richer error types and wrap this one.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Error {
    /// Anything without a more precise variant.
    Other(&'static str),
    /// The physical backend could not satisfy a read.
    PhysicalMemory(&'static str),
    /// No physical address exists for the requested virtual address
    /// under the given page table root.
    VirtualTranslate,
    /// A virtual read resolved but could not be completed.
    VirtualMemory(&'static str),
    /// Guest string data did not decode.
    Encoding,
}

impl convert::From<&'static str> for Error {
    fn from(error: &'static str) -> Self {
        Error::Other(error)
    }
}

impl From<str::Utf8Error> for Error {
    fn from(_err: str::Utf8Error) -> Error {
        Error::Encoding
    }
}

impl Error {
    /// Splits the error into a static description and an optional
    /// detail string, for embedding into downstream error types.
    pub fn to_str_pair(self) -> (&'static str, Option<&'static str>) {
        match self {
            Error::Other(e) => ("error", Some(e)),
            Error::PhysicalMemory(e) => ("physical memory read failed", Some(e)),
            Error::VirtualTranslate => ("virtual address translation failed", None),
            Error::VirtualMemory(e) => ("virtual memory read failed", Some(e)),
            Error::Encoding => ("string decoding failed", None),
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

/// Result alias used throughout the core crate.
pub type Result<T> = result::Result<T, Error>;
