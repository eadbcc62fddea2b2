use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Engine errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Cell bytes were truncated or carried an unknown type code.
    CorruptEncoding(String),
    /// A block's stored checksum did not match the recomputed one.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// A sorted file failed trailer, index, or bloom validation. The file is
    /// quarantined and must not be reopened.
    CorruptFile(String),
    /// The requested file id does not exist.
    NotFound(String),
    /// A snapshot manifest failed verification during clone or restore.
    CorruptedSnapshot(String),
    /// The addressed region is not in the OPEN state.
    RegionNotOnline(String),
    /// The region name does not resolve to a known region.
    UnknownRegion(String),
    /// Merge preconditions failed: offline, identical, or unknown inputs.
    MergeRegion(String),
    /// A mutation addressed a column family the region does not carry.
    NoSuchFamily(String),
    /// A degenerate range (start > end) was given to a containment check.
    InvalidRange(String),
    /// Invalid user input, typically malformed arguments or config values.
    InvalidInput(String),
    /// Invalid data, typically decoding errors or unexpected internal values.
    InvalidData(String),
    /// An IO error.
    Io(String),
    /// A write was attempted on a read-only structure (flush snapshot,
    /// finished file, closed scanner).
    ReadOnly,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CorruptEncoding(msg) => write!(f, "corrupt cell encoding: {msg}"),
            Error::ChecksumMismatch { expected, actual } => {
                write!(
                    f,
                    "checksum mismatch: expected {expected:#010x}, got {actual:#010x}"
                )
            }
            Error::CorruptFile(msg) => write!(f, "corrupt sorted file: {msg}"),
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::CorruptedSnapshot(msg) => write!(f, "corrupted snapshot: {msg}"),
            Error::RegionNotOnline(name) => write!(f, "region not online: {name}"),
            Error::UnknownRegion(name) => write!(f, "unknown region: {name}"),
            Error::MergeRegion(msg) => write!(f, "merge rejected: {msg}"),
            Error::NoSuchFamily(name) => write!(f, "no such column family: {name}"),
            Error::InvalidRange(msg) => write!(f, "invalid range: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// An engine Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(err.to_string())
    }
}
