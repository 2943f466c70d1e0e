//! Allocation errors
//!
//! The runtime has exactly one recoverable failure: the host refuses to give
//! us memory for a new page block. Everything else (misbound ownership,
//! exhausted layout slots) is a contract violation and panics.

use core::fmt;

/// Failed to reserve backing memory for a page block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("page block allocation failed")
    }
}

impl std::error::Error for AllocError {}

pub type AllocResult<T> = Result<T, AllocError>;
