/// The error type for fallible [`Dict`][crate::Dict] operations.
///
/// Misuse of the API (reading the value of an entry in a no-value dict,
/// resuming a rehash that was never paused, releasing an unsafe iterator
/// after a forbidden mutation) is a programming error and panics instead
/// of returning one of these variants.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An entry with an equal key is already stored in the dict.
    #[error("an entry with an equal key already exists")]
    AlreadyExists,

    /// No entry with an equal key is stored in the dict.
    #[error("no entry was found for the key")]
    NotFound,

    /// Allocating a new bucket array failed. Only the `try_` entry points
    /// report this; the plain ones abort the process on allocation failure,
    /// which the host treats as a fatal out-of-memory signal.
    #[error("allocating the new bucket array failed")]
    AllocationFailed,

    /// The requested resize was rejected: a rehash is already in progress,
    /// the target size cannot hold the current entries, the target equals
    /// the current size, or the resize policy forbids it.
    #[error("the requested resize was rejected")]
    ResizeRejected,
}

/// A `Result` specialized for dict operations.
pub type Result<T> = std::result::Result<T, Error>;
