//! Region-based heap bookkeeping with concurrent snapshot-at-the-beginning marking.
//!
//! The heap is split into equally sized [`HeapRegion`]s that are committed, deactivated and
//! uncommitted on demand. Mutators bump-allocate from an [`AllocRegion`]; a
//! [`ConcurrentMark`] cycle marks live objects with a pool of parallel workers and reclaims
//! regions that hold none.

pub mod heap;
pub mod sync;
pub mod utils;

pub use heap::{
    alloc_region::{AllocRegion, AllocRegionBackend},
    concurrent_mark::{ConcurrentMark, MarkPhase},
    heap::Heap,
    mark_stack::MarkStack,
    object_model::ObjectModel,
    options::{HeapOptions, MarkingOptions},
    region::{HeapRegion, RegionKind},
    MemRegion,
};
