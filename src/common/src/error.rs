//! System-wide error and status types for Vali.

use core::fmt;

/// Recoverable error returned by kernel services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum OsError {
    /// A parameter was out of range or inconsistent with the object.
    InvalidParameters,
    /// The id does not name a live object.
    NotFound,
    /// A path or id is already registered.
    AlreadyExists,
    /// An allocation failed.
    OutOfMemory,
    /// The deadline passed before the operation could complete.
    Timeout,
    /// The wait was cut short, or the watched value changed before blocking.
    Interrupted,
    /// The object is held by someone else.
    Busy,
    /// The pipe was destroyed while the call was in flight.
    PipeClosed,
    /// The object does not support the requested operation.
    NotSupported,
}

/// Result alias used throughout the kernel.
pub type OsResult<T> = Result<T, OsError>;

impl OsError {
    /// Status code handed back to userspace. Always negative.
    pub const fn code(self) -> i32 {
        match self {
            OsError::InvalidParameters => -1,
            OsError::NotFound => -2,
            OsError::AlreadyExists => -3,
            OsError::OutOfMemory => -4,
            OsError::Timeout => -5,
            OsError::Interrupted => -6,
            OsError::Busy => -7,
            OsError::PipeClosed => -8,
            OsError::NotSupported => -9,
        }
    }

    /// Maps a status code back to an error. Zero and positive codes are not errors.
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(OsError::InvalidParameters),
            -2 => Some(OsError::NotFound),
            -3 => Some(OsError::AlreadyExists),
            -4 => Some(OsError::OutOfMemory),
            -5 => Some(OsError::Timeout),
            -6 => Some(OsError::Interrupted),
            -7 => Some(OsError::Busy),
            -8 => Some(OsError::PipeClosed),
            -9 => Some(OsError::NotSupported),
            _ => None,
        }
    }
}

impl fmt::Display for OsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsError::InvalidParameters => write!(f, "invalid parameters"),
            OsError::NotFound => write!(f, "object not found"),
            OsError::AlreadyExists => write!(f, "entry already exists"),
            OsError::OutOfMemory => write!(f, "out of memory"),
            OsError::Timeout => write!(f, "operation timed out"),
            OsError::Interrupted => write!(f, "operation interrupted"),
            OsError::Busy => write!(f, "object busy"),
            OsError::PipeClosed => write!(f, "pipe closed"),
            OsError::NotSupported => write!(f, "operation not supported"),
        }
    }
}

/// Outcome of a thread sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SleepResult {
    /// The full interval elapsed.
    Ok,
    /// The sleeper was woken early.
    Interrupted,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [OsError; 9] = [
        OsError::InvalidParameters,
        OsError::NotFound,
        OsError::AlreadyExists,
        OsError::OutOfMemory,
        OsError::Timeout,
        OsError::Interrupted,
        OsError::Busy,
        OsError::PipeClosed,
        OsError::NotSupported,
    ];

    #[test]
    fn test_codes_are_negative_and_distinct() {
        for (i, a) in ALL.iter().enumerate() {
            assert!(a.code() < 0);
            for b in &ALL[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }

    #[test]
    fn test_code_mapping() {
        for err in ALL {
            assert_eq!(OsError::from_code(err.code()), Some(err));
        }
        assert_eq!(OsError::from_code(0), None);
        assert_eq!(OsError::from_code(42), None);
    }
}
