//! Item paging: histogram-driven eviction of cold values under memory
//! pressure
//!
//! The [`PagingVisitor`] walks vbucket hash tables, learning frequency and
//! age thresholds from what it sees so each pass evicts approximately the
//! configured share of items. The [`ItemPagerTask`] schedules passes while
//! the bucket is over its high watermark, alternating between replica and
//! active vbuckets.

mod freq_decayer;
mod item_eviction;
mod visitor;

pub use freq_decayer::ItemFreqDecayerTask;
pub use item_eviction::{ItemEviction, LEARNING_POPULATION};
pub use visitor::{
    ItemPagerTask, PagerPhase, PagingVisitor, SharedPagerPhase, MAX_PERSISTENCE_QUEUE_SIZE,
};
