use std::fmt;

/// Result type alias for trivdb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for trivdb operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// On-disk structures failed validation
    #[error("corrupt database: {message}")]
    Corrupt { message: String },

    /// Short reads/writes, flush and truncate failures
    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A byte-range lock could not be taken, or locks were mixed illegally
    #[error("locking error: {message}")]
    Lock { message: String },

    /// An in-process buffer could not be allocated
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory { requested: usize },

    /// Insert against a key that is already present
    #[error("record exists")]
    Exists,

    /// A non-blocking lock attempt found the region held by someone else
    #[error("lock at offset {offset} is held by another handle")]
    NoLock { offset: u32 },

    /// Bad parameter or an operation the handle's mode forbids
    #[error("invalid parameter: {message}")]
    InvalidArgument { message: String },

    /// Lookup against a key that is absent
    #[error("record does not exist")]
    NotFound,

    /// Mutation on a read-only handle or during a read-only traversal
    #[error("write not permitted")]
    ReadOnly,
}

impl Error {
    /// Create a corruption error
    #[must_use]
    pub fn corrupt(message: impl Into<String>) -> Self {
        Error::Corrupt {
            message: message.into(),
        }
    }

    /// Create an I/O error tagged with the failing operation
    #[must_use]
    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        Error::Io { operation, source }
    }

    /// Create an I/O error for an access reaching past `size`
    #[must_use]
    pub fn short_io(operation: &'static str, end: u64, size: u32) -> Self {
        Error::Io {
            operation,
            source: std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("offset {end} beyond end of file ({size} bytes)"),
            ),
        }
    }

    /// Create a locking error
    #[must_use]
    pub fn lock(message: impl Into<String>) -> Self {
        Error::Lock {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    /// The stable code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Corrupt { .. } => ErrorCode::Corrupt,
            Error::Io { .. } => ErrorCode::Io,
            Error::Lock { .. } => ErrorCode::Lock,
            Error::OutOfMemory { .. } => ErrorCode::OutOfMemory,
            Error::Exists => ErrorCode::Exists,
            Error::NoLock { .. } => ErrorCode::NoLock,
            Error::InvalidArgument { .. } => ErrorCode::InvalidArgument,
            Error::NotFound => ErrorCode::NotFound,
            Error::ReadOnly => ErrorCode::ReadOnly,
        }
    }

    /// True for both flavours of lock failure
    pub fn is_lock_error(&self) -> bool {
        matches!(self, Error::Lock { .. } | Error::NoLock { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }
}

/// Flat error codes, kept for callers that track the last failure of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success,
    Corrupt,
    Io,
    Lock,
    OutOfMemory,
    Exists,
    NoLock,
    InvalidArgument,
    NotFound,
    ReadOnly,
}

impl ErrorCode {
    /// Human readable rendering, for diagnostics only
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Success => "Success",
            ErrorCode::Corrupt => "Corrupt database",
            ErrorCode::Io => "IO Error",
            ErrorCode::Lock => "Locking error",
            ErrorCode::OutOfMemory => "Out of memory",
            ErrorCode::Exists => "Record exists",
            ErrorCode::NoLock => "Lock exists on other keys",
            ErrorCode::InvalidArgument => "Invalid parameter",
            ErrorCode::NotFound => "Record does not exist",
            ErrorCode::ReadOnly => "write not permitted",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_variants() {
        assert_eq!(Error::Exists.code(), ErrorCode::Exists);
        assert_eq!(Error::corrupt("bad magic").code(), ErrorCode::Corrupt);
        assert_eq!(Error::NoLock { offset: 8 }.code(), ErrorCode::NoLock);
        assert_eq!(ErrorCode::NotFound.as_str(), "Record does not exist");
    }

    #[test]
    fn test_lock_error_classification() {
        assert!(Error::lock("mixed").is_lock_error());
        assert!(Error::NoLock { offset: 172 }.is_lock_error());
        assert!(!Error::ReadOnly.is_lock_error());
    }

    #[test]
    fn test_short_io_message() {
        let err = Error::short_io("read", 4096, 24);
        assert!(err.to_string().contains("offset 4096 beyond end of file (24 bytes)"));
        assert_eq!(err.code(), ErrorCode::Io);
    }
}
