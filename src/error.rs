use std::fmt::Display;

/// Plasma errors.
#[derive(Debug)]
pub enum Error {
    /// An LSS read or write failed. Once a write fails the store is degraded:
    /// further reservations are refused, already-acknowledged data stays
    /// readable until the process exits.
    Io(std::io::Error),
    /// Checksum mismatch or an impossible header while reading the log.
    /// During recovery the offending record and everything after it are
    /// treated as truncated.
    Corruption(String),
    /// Invalid configuration, rejected at store construction.
    InvalidConfig(String),
    /// Resident memory cannot be brought under the quota by eviction.
    QuotaExceeded,
    /// Operation on a store after `close()`.
    Closed,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Error::QuotaExceeded => write!(f, "memory quota exceeded"),
            Error::Closed => write!(f, "store is closed"),
        }
    }
}

/// Constructs an Error::Corruption from a format string.
#[macro_export]
macro_rules! corruption {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}

/// A plasma Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}
