//! Status codes returned by engine operations
//!
//! This module defines the status codes surfaced by checkpoint, durability
//! and paging operations.

use std::fmt;

/// Status code returned by engine operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully
    #[default]
    Success = 0,
    /// Sync write accepted; the client must wait for async completion
    WouldBlock = 1,
    /// Key was not found
    KeyNotFound = 2,
    /// Vbucket is not active / not owned by this node
    NotMyVbucket = 3,
    /// Malformed input (bad durability level, unknown cursor, ...)
    InvalidArgument = 4,
    /// Replication topology cannot satisfy the requested durability level
    DurabilityImpossible = 5,
    /// Durability level not supported by the bucket type
    DurabilityInvalidLevel = 6,
    /// Prepare neither confirmed committed nor aborted (timeout, state change)
    SyncWriteAmbiguous = 7,
    /// A cursor with the requested name is already registered
    CursorNameInUse = 8,
    /// Invariant violation; fatal for the vbucket
    Internal = 9,
}

impl Status {
    /// Check if the status indicates success
    #[inline]
    pub const fn is_success(&self) -> bool {
        matches!(self, Status::Success)
    }

    /// Check if the client must wait for an async completion
    #[inline]
    pub const fn is_would_block(&self) -> bool {
        matches!(self, Status::WouldBlock)
    }

    /// Check if the outcome of a sync write is ambiguous
    #[inline]
    pub const fn is_ambiguous(&self) -> bool {
        matches!(self, Status::SyncWriteAmbiguous)
    }

    /// Check if the status indicates an error
    #[inline]
    pub const fn is_error(&self) -> bool {
        !matches!(self, Status::Success | Status::WouldBlock)
    }

    /// Get the status as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "Success",
            Status::WouldBlock => "WouldBlock",
            Status::KeyNotFound => "KeyNotFound",
            Status::NotMyVbucket => "NotMyVbucket",
            Status::InvalidArgument => "InvalidArgument",
            Status::DurabilityImpossible => "DurabilityImpossible",
            Status::DurabilityInvalidLevel => "DurabilityInvalidLevel",
            Status::SyncWriteAmbiguous => "SyncWriteAmbiguous",
            Status::CursorNameInUse => "CursorNameInUse",
            Status::Internal => "Internal",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
