//! Durability: prepared sync writes, acknowledgement tracking and completion
//!
//! A prepare moves `queued → tracked → resolved → completed`: the
//! [`DurabilityMonitor`] tracks it per vbucket, the engine-wide
//! [`DurabilityCompletionTask`] drains resolved prepares and queues the
//! commit/abort items into the checkpoint manager.

mod completion;
mod monitor;
mod topology;

pub use completion::{DurabilityCompletionTask, SyncWriteTimeoutTask};
pub use monitor::{DurabilityMonitor, Resolution, ResolvedSyncWrite, SyncWriteCookie};
pub use topology::ReplicationTopology;
