// SPDX-License-Identifier: MIT

use core::fmt;

/// Result type for block device operations.
pub type DevResult<T = ()> = core::result::Result<T, DevError>;

/// Error type for block device operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevError {
    /// Underlying device I/O error.
    Io(&'static str),

    /// Attempted to access a block or offset out of bounds.
    OutOfBounds,

    /// Unsupported operation for this backend.
    Unsupported,
}

impl DevError {
    pub fn msg(&self) -> &'static str {
        match self {
            DevError::Io(msg) => msg,
            DevError::OutOfBounds => "Out of bounds",
            DevError::Unsupported => "Unsupported operation",
        }
    }
}

impl fmt::Display for DevError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg())
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DevError {}
