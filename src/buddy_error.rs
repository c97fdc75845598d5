use std::fmt;

/// Enum representing some possible errors that can occur in the Buddy Memory Allocator.
#[derive(PartialEq)]
pub enum BuddyError {
    /// The request was well formed but no free block of sufficient size exists.
    NoMemory,
    /// A decoded header did not carry the expected tag, e.g. a pointer that was
    /// never issued by this pool or whose header has been overwritten.
    CorruptedMemoryPool,
    /// The caller passed a zero-byte request. No pool state is touched and no
    /// out-of-memory indicator is set.
    InvalidArgument,
}

impl fmt::Debug for BuddyError {
    /// Formats the error message for debugging purposes.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            BuddyError::NoMemory => write!(f, "Insufficient memory available"),
            BuddyError::CorruptedMemoryPool => write!(f, "Memory pool is corrupted or invalid"),
            BuddyError::InvalidArgument => write!(f, "Invalid argument (zero-byte request)"),
        }
    }
}

impl fmt::Display for BuddyError {
    /// Formats the error message for display purposes.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for BuddyError {}
