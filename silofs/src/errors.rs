// SPDX-License-Identifier: MIT

use core::fmt;

pub use siloio::error::*;

/// Top-level error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// Underlying block device failure.
    Dev(DevError),
    /// No free block is left to allocate.
    Full,
    /// The requested object has no first block on the medium.
    NotFound,
    /// A forward seek ran past the end of the object.
    OutOfRange,
    Invalid(&'static str),
    Other(&'static str),
}

impl StoreError {
    pub fn msg(&self) -> &'static str {
        match self {
            StoreError::Dev(_) => "Device IO error",
            StoreError::Full => "Storage full",
            StoreError::NotFound => "Object not found",
            StoreError::OutOfRange => "Seek past end of object",
            StoreError::Invalid(msg) => msg,
            StoreError::Other(msg) => msg,
        }
    }

    pub fn source(&self) -> Option<DevError> {
        match self {
            StoreError::Dev(e) => Some(*e),
            _ => None,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg())?;
        if let Some(src) = self.source() {
            write!(f, "\n  caused by: {}", src.msg())?;
        }
        Ok(())
    }
}

// === impl From ===

impl From<DevError> for StoreError {
    fn from(e: DevError) -> Self {
        StoreError::Dev(e)
    }
}

// === type StoreResult ===

pub type StoreResult<T = ()> = Result<T, StoreError>;

#[cfg(feature = "std")]
impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Dev(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn test_error_chain_display() {
        let low = DevError::Unsupported;
        let top = StoreError::Dev(low);

        let rendered = alloc::format!("{top}");
        assert!(rendered.contains("caused by: Unsupported operation"));
    }

    #[test]
    fn test_plain_display() {
        assert_eq!(alloc::format!("{}", StoreError::Full), "Storage full");
    }
}
