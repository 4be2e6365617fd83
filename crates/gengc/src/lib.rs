//! A generational, region-based garbage-collected heap core.
//!
//! The heap manages memory in 256 KiB aligned regions grouped into spaces:
//! a copying young generation (two semi-space halves), a free-list old
//! generation, mark-in-place spaces for pinned and machine-code objects,
//! immortal read-only and app-spawn spaces, and a huge space mapping one
//! region per oversized object. Collections come in three flavors — young
//! evacuation, old (young evacuation plus lazy sweeping driven by a
//! concurrent full trace), and stop-the-world full compaction — selected by
//! throughput and survival-rate heuristics.
//!
//! Object layout is external: the embedder supplies a `'static`
//! [`TypeDescriptor`] per type, giving the object's size and a callback that
//! enumerates its reference fields to a [`SlotVisitor`]. The collector's
//! only per-object state is the first word, the mark word, which holds the
//! descriptor pointer or (transiently, during a cycle) a forwarding address.
//!
//! Reference stores must go through [`Heap::write_field`] (or
//! [`Heap::write_root`] for registered roots) so the generational and
//! concurrent-marking write barriers observe every mutation. Collections
//! assume a stopped mutator; marking and sweeping can overlap it.
//!
//! ```
//! use gengc::{Address, GcType, Heap, HeapConfig, SlotVisitor, TypeDescriptor};
//!
//! fn no_refs(_: Address, _: &mut dyn SlotVisitor) {}
//!
//! static POINT: TypeDescriptor = TypeDescriptor {
//!     size: 3 * gengc::SLOT_SIZE,
//!     flags: 0,
//!     visit_refs: no_refs,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let heap = Heap::new(HeapConfig::default().gc_thread_num(2))?;
//! let point = heap.allocate_young(&POINT)?;
//!
//! let root = Box::leak(Box::new(0usize)) as *mut usize as Address;
//! heap.add_root(root);
//! heap.write_root(root, point);
//!
//! heap.collect_garbage(GcType::Young);
//! assert_ne!(heap.read_field(root), 0); // survived, possibly moved
//! # Ok(())
//! # }
//! ```

mod bitset;
mod concurrent_marker;
mod config;
mod error;
mod free_list;
mod heap;
mod mark;
mod mem_controller;
mod object;
mod region;
mod remembered_set;
mod space;
mod sweeper;
mod taskpool;
mod verification;
mod work;

pub use config::HeapConfig;
pub use error::{AllocError, ConfigError};
pub use heap::{GcStats, GcType, Heap, MAX_REGULAR_OBJECT_SIZE, MemGrowingType};
pub use object::{
    Address, HEADER_SIZE, NULL_ADDRESS, SLOT_SIZE, SlotVisitor, TypeDescriptor,
};
pub use region::{REGION_SIZE, Region, RegionKind};
