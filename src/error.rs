use std::fmt::Display;

/// Errors surfaced by the storage engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A filesystem or syscall failure.
    Io(String),
    /// Invalid on-disk data: a bad checksum, a malformed block, a bad magic
    /// number, or an undecodable record.
    Corruption(String),
    /// The key is absent or shadowed by a deletion.
    NotFound,
    /// Invalid caller input, typically a bad option or range.
    InvalidArgument(String),
    /// The database is shutting down; no further writes are accepted.
    ShuttingDown,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::NotFound => write!(f, "not found"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::ShuttingDown => write!(f, "database is shutting down"),
        }
    }
}

/// Constructs an Error::Corruption from the given format string.
#[macro_export]
macro_rules! corruption {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}

/// An engine Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Error::NotFound.to_string(), "not found");
        assert_eq!(
            Error::Corruption("bad magic".to_string()).to_string(),
            "corruption: bad magic"
        );
        assert_eq!(
            Error::Io("disk gone".to_string()).to_string(),
            "io error: disk gone"
        );
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
