/// Failure kinds reported by the allocator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PmaError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// Neither the OS nor eviction could satisfy the request.
    #[error("out of memory")]
    NoMemory,
    /// Pages were obtained but could not be zeroed.
    #[error("scrubber could not keep up")]
    InsufficientResources,
    #[error("object not found")]
    ObjectNotFound,
}

pub type Result<T, E = PmaError> = core::result::Result<T, E>;
