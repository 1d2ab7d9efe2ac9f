//! In-place memory allocators over caller-provided byte regions.
//!
//! This crate carves a contiguous region of caller-owned memory into typed
//! sub-allocations and serves allocation and release requests from inside
//! that region, without ever calling back into the host allocator. Two
//! algorithms are available behind one façade, and every instance tracks
//! lifetime statistics for its region.
//!
//! # Available allocators
//!
//! ## [`SegregatedFreelistAllocator`](segregated_freelist::SegregatedFreelistAllocator)
//!
//! Eight fixed size classes (16–2048 bytes) with one free list each, plus a
//! large-fragment list that seeds the classes and serves bigger requests
//! first-fit. Released blocks are never merged. Best suited for:
//!
//! - workloads dominated by small, recurring allocation sizes
//! - paths where O(1) class-hit allocation matters more than fragmentation
//!
//! ## [`BuddyAllocator`](buddy::BuddyAllocator)
//!
//! Power-of-two blocks split on demand and re-merged with their buddies on
//! release via XOR offset arithmetic. Best suited for:
//!
//! - mixed-size workloads that must not fragment over time
//! - callers that can tolerate up to 50% internal fragmentation
//!
//! | Allocator | Alloc | Release | Coalescing | Payload alignment |
//! |-----------|-------|---------|------------|-------------------|
//! | Segregated free-list | O(1) class hit, O(n) large walk | O(1) | none | 8 bytes |
//! | Buddy | O(log n) | O(log n) | buddy merge | 16 bytes |
//!
//! # Usage
//!
//! The façade places all of its state inside the region it is given:
//!
//! ```
//! use region_alloc::region::{Algorithm, RegionAllocator};
//!
//! let mut backing = vec![0u8; 1024 * 1024];
//! let mut allocator =
//!     RegionAllocator::create(Algorithm::SegregatedFreelist, &mut backing).unwrap();
//!
//! let ptr = allocator.alloc(100);
//! assert!(!ptr.is_null());
//!
//! unsafe { allocator.free(ptr) };
//!
//! let stats = allocator.stats();
//! assert_eq!(stats.total_allocations, 1);
//! assert_eq!(stats.total_frees, 1);
//! ```
//!
//! A convenience constructor obtains the region from the host allocator
//! and releases it when the handle drops:
//!
//! ```
//! use region_alloc::region::{Algorithm, RegionAllocator};
//!
//! let mut allocator =
//!     RegionAllocator::with_platform_backing(Algorithm::Buddy, 1024 * 1024).unwrap();
//! let ptr = allocator.alloc(4096);
//! assert!(!ptr.is_null());
//! unsafe { allocator.free(ptr) };
//! ```
//!
//! # Design considerations
//!
//! ## Memory safety
//!
//! Allocation hands out raw pointers into the region; using them is as
//! unsafe as using any raw allocation. Release validates the hidden block
//! header before touching any free list and leaks blocks that fail the
//! check, reporting them through an injectable
//! [`DiagnosticSink`](diag::DiagnosticSink) instead of corrupting state.
//!
//! ## Thread safety
//!
//! Handles are `Send` but not `Sync`. Every operation takes `&mut self`;
//! sharing an instance across threads requires external synchronization.
//!
//! ## Reallocation
//!
//! The façade keeps no per-block size metadata of its own, so
//! [`realloc`](region::RegionAllocator::realloc) allocates a new block and
//! releases the old one **without copying the payload**. Callers needing a
//! copying realloc must track sizes themselves or use an engine directly,
//! where the committed size is known.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod buddy;
pub mod diag;
pub mod region;
pub mod segregated_freelist;
pub mod stats;
