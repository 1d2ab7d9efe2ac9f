//! Segregated free-list allocator engine.
//!
//! The engine keeps one free list per fixed size class plus a list of large
//! free fragments, all carved out of a single caller-provided memory region.
//!
//! # Algorithm
//!
//! - **Size classes**: eight compile-time classes from 16 to 2048 bytes.
//!   A request is served from the smallest class whose size can hold the
//!   payload plus the block header, rounded up to 8 bytes.
//! - **Large list**: free fragments that are not exactly class-sized live on
//!   a separate list. It is searched first-fit both to replenish empty class
//!   lists and to serve requests beyond the largest class. The initial state
//!   is one large-list node covering the whole heap.
//! - **No coalescing**: released blocks go back on a list as-is. Neighbouring
//!   free blocks are never merged, so fragmentation can accumulate over a
//!   long workload.
//!
//! # Memory layout
//!
//! Every live allocation is preceded by a hidden [`BlockHeader`] recording
//! the committed block size, the caller's requested size, and a magic word
//! that release validates before touching any list. A free block reuses its
//! own first bytes as the [`FreeBlock`] list node; header and node overlay
//! the same memory in different lifecycle states.
//!
//! ```text
//! Live block:                          Free block:
//! ┌────────────────┬─────────────┐     ┌──────────────────┬──────────┐
//! │ BlockHeader    │ payload     │     │ FreeBlock node   │ (unused) │
//! │ committed      │             │     │ next, size       │          │
//! │ requested      │             │     └──────────────────┴──────────┘
//! │ magic          │             │
//! └────────────────┴─────────────┘
//!                  ▲
//!                  └── pointer returned to the caller
//! ```
//!
//! Returned pointers are aligned to 8 bytes. The engine is `Send` but not
//! `Sync`; concurrent use requires external synchronization.

use core::ptr::{self, NonNull};

use crate::{diag::DiagnosticSink, stats::AllocatorStats};

/// Number of fixed size classes.
pub const NUM_SIZE_CLASSES: usize = 8;

/// The fixed block sizes served by the class free lists, in bytes.
///
/// Requests whose total block size exceeds the largest class are served
/// from the large-fragment list instead.
pub const SIZE_CLASSES: [usize; NUM_SIZE_CLASSES] = [16, 32, 64, 128, 256, 512, 1024, 2048];

/// Internal alignment of the engine: block sizes, the heap base, and
/// returned payload pointers are all multiples of this.
const ALIGN_SIZE: usize = 8;

/// Marker stored in every live block header; release rejects blocks that
/// do not carry it.
const BLOCK_MAGIC: u32 = 0xDEAD_BEEF;

/// Bytes occupied by the hidden header in front of every live payload.
const HEADER_SIZE: usize = size_of::<BlockHeader>();
const _: () = assert!(HEADER_SIZE % ALIGN_SIZE == 0);
const _: () = assert!(size_of::<FreeBlock>() <= SIZE_CLASSES[0]);

/// Hidden prefix of every live allocation.
struct BlockHeader {
    /// Bytes this block consumes inside the heap, header and rounding
    /// included. For class-served blocks this is exactly the class size.
    committed_size: usize,
    /// Bytes of payload the caller asked for.
    requested_size: usize,
    magic: u32,
}

/// List node overlaid on the first bytes of a free block.
struct FreeBlock {
    next: *mut FreeBlock,
    size: usize,
}

/// Chooses the smallest class able to hold a block of `total` bytes.
fn size_class(total: usize) -> Option<usize> {
    SIZE_CLASSES.iter().position(|&class| total <= class)
}

/// A segregated free-list allocator living inside a caller-provided region.
///
/// The engine state itself is placed at the start of the region by
/// [`init`](Self::init); the rest of the region becomes the managed heap.
/// Statistics are not stored here; every operation updates the
/// [`AllocatorStats`] block the façade passes in.
///
/// # Examples
///
/// ```
/// use region_alloc::segregated_freelist::SegregatedFreelistAllocator;
/// use region_alloc::stats::AllocatorStats;
///
/// let mut backing = vec![0u8; 64 * 1024];
/// let mut stats = AllocatorStats::default();
///
/// let (mut engine, heap_size) = unsafe {
///     SegregatedFreelistAllocator::init(backing.as_mut_ptr(), backing.len())
/// }
/// .unwrap();
/// stats.heap_size = heap_size as u64;
///
/// let ptr = unsafe { engine.as_mut().alloc(100, &mut stats) };
/// assert!(!ptr.is_null());
/// assert_eq!(ptr.addr() % 8, 0);
/// ```
pub struct SegregatedFreelistAllocator {
    /// Base of the managed heap, immediately after this struct.
    heap: *mut u8,
    heap_size: usize,
    /// One free-list head per entry of [`SIZE_CLASSES`].
    free_lists: [*mut FreeBlock; NUM_SIZE_CLASSES],
    /// Free fragments that are not exactly class-sized, including the
    /// initial whole-heap block.
    large_blocks: *mut FreeBlock,
}

unsafe impl Send for SegregatedFreelistAllocator {}

impl SegregatedFreelistAllocator {
    /// Places an engine at the start of `region` and hands the remainder to
    /// it as heap.
    ///
    /// The region start is aligned up to 8 bytes, the engine state struct
    /// is written there, and the rest (re-aligned to 8) becomes the heap,
    /// installed as a single node on the large-fragment list. Returns the
    /// engine pointer and the heap size, or `None` if the region cannot
    /// hold the state struct plus one block of the smallest class.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - the memory range `region..region + region_size` is valid for reads
    ///   and writes and not used by anything else;
    /// - the region stays valid and untouched by other code for the entire
    ///   lifetime of the returned engine.
    pub unsafe fn init(region: *mut u8, region_size: usize) -> Option<(NonNull<Self>, usize)> {
        if region.is_null() || region_size < size_of::<Self>() + SIZE_CLASSES[0] {
            return None;
        }

        let state_align = region.align_offset(ALIGN_SIZE);
        if state_align >= region_size {
            return None;
        }
        let usable = region_size - state_align;
        if usable < size_of::<Self>() + SIZE_CLASSES[0] {
            return None;
        }
        let state_ptr = unsafe { region.add(state_align) };

        let heap_align = unsafe { state_ptr.add(size_of::<Self>()) }.align_offset(ALIGN_SIZE);
        let heap_prefix = size_of::<Self>() + heap_align;
        if heap_prefix >= usable {
            return None;
        }
        let heap = unsafe { state_ptr.add(heap_prefix) };
        let heap_size = usable - heap_prefix;
        if heap_size < SIZE_CLASSES[0] {
            return None;
        }

        // The whole heap starts out as one node on the large-fragment list.
        #[expect(clippy::cast_ptr_alignment)]
        let initial = heap.cast::<FreeBlock>();
        unsafe {
            initial.write(FreeBlock {
                next: ptr::null_mut(),
                size: heap_size,
            });
        }

        #[expect(clippy::cast_ptr_alignment)]
        let state = state_ptr.cast::<Self>();
        unsafe {
            state.write(Self {
                heap,
                heap_size,
                free_lists: [ptr::null_mut(); NUM_SIZE_CLASSES],
                large_blocks: initial,
            });
        }

        NonNull::new(state).map(|state| (state, heap_size))
    }

    /// Allocates a block able to hold `size` payload bytes.
    ///
    /// Class-sized requests are served from the matching class list, which
    /// is replenished by carving class-sized blocks off the large-fragment
    /// list. Requests beyond the largest class are served first-fit from
    /// the large-fragment list directly. Returns a pointer to the payload,
    /// or null if `size` is zero or no free block fits; only the latter
    /// counts as a failed allocation in `stats`.
    ///
    /// # Safety
    ///
    /// `stats` must be the statistics block this engine has been updating
    /// since [`init`](Self::init), and the engine's region must still be
    /// valid.
    pub unsafe fn alloc(&mut self, size: usize, stats: &mut AllocatorStats) -> *mut u8 {
        if size == 0 {
            return ptr::null_mut();
        }

        let Some(total) = size
            .checked_add(HEADER_SIZE)
            .and_then(|total| total.checked_next_multiple_of(ALIGN_SIZE))
        else {
            stats.failed_allocations += 1;
            return ptr::null_mut();
        };

        let (block, committed) = match size_class(total) {
            Some(class) => {
                let class_size = SIZE_CLASSES[class];
                debug_assert!(total <= class_size);
                let block = if self.free_lists[class].is_null() {
                    // Class list empty: carve a class-sized block off a
                    // large fragment.
                    unsafe { self.carve_from_large(class_size) }
                } else {
                    let block = self.free_lists[class];
                    self.free_lists[class] = unsafe { (*block).next };
                    block
                };
                (block, class_size)
            }
            None => (unsafe { self.carve_from_large(total) }, total),
        };

        if block.is_null() {
            stats.failed_allocations += 1;
            return ptr::null_mut();
        }

        let header = block.cast::<BlockHeader>();
        unsafe {
            header.write(BlockHeader {
                committed_size: committed,
                requested_size: size,
                magic: BLOCK_MAGIC,
            });
        }
        stats.record_alloc(committed as u64, size as u64);

        unsafe { block.cast::<u8>().add(HEADER_SIZE) }
    }

    /// Releases a block previously returned by [`alloc`](Self::alloc).
    ///
    /// The hidden header in front of `ptr` is validated first; a block
    /// whose magic does not match is reported to `sink` and leaked rather
    /// than risking the free lists. Blocks whose committed size equals a
    /// class size return to that class's list, everything else goes back
    /// on the large-fragment list. Freed blocks are never merged with
    /// their neighbours.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer obtained from [`alloc`](Self::alloc)
    /// on this engine that has not been released since, and `stats` must be
    /// the statistics block this engine has been updating.
    pub unsafe fn free(
        &mut self,
        ptr: *mut u8,
        stats: &mut AllocatorStats,
        sink: &mut dyn DiagnosticSink,
    ) {
        if ptr.is_null() {
            return;
        }

        #[expect(clippy::cast_ptr_alignment)]
        let header_ptr = unsafe { ptr.sub(HEADER_SIZE) }.cast::<BlockHeader>();
        let header = unsafe { header_ptr.read() };
        if header.magic != BLOCK_MAGIC {
            sink.report(format_args!("invalid pointer or corrupted block: {ptr:p}"));
            return;
        }

        let committed = header.committed_size;
        debug_assert!(
            header_ptr.addr() >= self.heap.addr()
                && header_ptr.addr() + committed <= self.heap.addr() + self.heap_size
        );
        stats.record_free(committed as u64, header.requested_size as u64);

        let block = header_ptr.cast::<FreeBlock>();
        match size_class(committed) {
            // Only an exact class-size match may rejoin a class list; free
            // reconstructs class membership from the size alone.
            Some(class) if committed == SIZE_CLASSES[class] => unsafe {
                block.write(FreeBlock {
                    next: self.free_lists[class],
                    size: committed,
                });
                self.free_lists[class] = block;
            },
            _ => unsafe {
                block.write(FreeBlock {
                    next: self.large_blocks,
                    size: committed,
                });
                self.large_blocks = block;
            },
        }
    }

    /// Removes the first large fragment of at least `want` bytes, carves
    /// `want` bytes off its front, and pushes any remainder that can still
    /// hold the smallest class back onto the head of the large list.
    ///
    /// Returns null if no fragment is big enough.
    unsafe fn carve_from_large(&mut self, want: usize) -> *mut FreeBlock {
        let mut prev: *mut *mut FreeBlock = &raw mut self.large_blocks;
        let mut curr = self.large_blocks;

        while !curr.is_null() {
            unsafe {
                if (*curr).size >= want {
                    *prev = (*curr).next;

                    let remaining = (*curr).size - want;
                    if remaining >= SIZE_CLASSES[0] {
                        #[expect(clippy::cast_ptr_alignment)]
                        let remainder = curr.cast::<u8>().add(want).cast::<FreeBlock>();
                        remainder.write(FreeBlock {
                            next: self.large_blocks,
                            size: remaining,
                        });
                        self.large_blocks = remainder;
                    }

                    return curr;
                }
                prev = &raw mut (*curr).next;
                curr = (*curr).next;
            }
        }

        ptr::null_mut()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::{
        alloc::Layout,
        fmt,
        sync::{Arc, Mutex},
    };

    use super::*;

    #[derive(Clone, Default)]
    struct CollectSink(Arc<Mutex<Vec<String>>>);

    impl DiagnosticSink for CollectSink {
        fn report(&mut self, message: fmt::Arguments<'_>) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    struct TestEngine {
        engine: NonNull<SegregatedFreelistAllocator>,
        stats: AllocatorStats,
        sink: CollectSink,
    }

    impl TestEngine {
        fn alloc(&mut self, size: usize) -> *mut u8 {
            let ptr = unsafe { self.engine.as_mut().alloc(size, &mut self.stats) };
            if !ptr.is_null() {
                unsafe {
                    ptr.write_bytes(0x33, size);
                }
            }
            ptr
        }

        unsafe fn free(&mut self, ptr: *mut u8) {
            unsafe {
                self.engine
                    .as_mut()
                    .free(ptr, &mut self.stats, &mut self.sink);
            }
        }

        fn reports(&self) -> Vec<String> {
            self.sink.0.lock().unwrap().clone()
        }
    }

    fn with_test_heap<F>(heap_size: usize, test_fn: F)
    where
        F: FnOnce(*mut u8, usize),
    {
        unsafe {
            let layout = Layout::from_size_align(heap_size, 16).unwrap();
            let heap_start = std::alloc::alloc(layout);
            heap_start.write_bytes(0x11, heap_size);
            test_fn(heap_start, heap_size);
            std::alloc::dealloc(heap_start, layout);
        }
    }

    fn with_test_engine<F>(size: usize, test_fn: F)
    where
        F: FnOnce(&mut TestEngine),
    {
        with_test_heap(size, |heap_start, heap_size| unsafe {
            let (engine, managed) =
                SegregatedFreelistAllocator::init(heap_start, heap_size).unwrap();
            let stats = AllocatorStats {
                heap_size: managed as u64,
                ..AllocatorStats::default()
            };
            test_fn(&mut TestEngine {
                engine,
                stats,
                sink: CollectSink::default(),
            });
        });
    }

    #[test]
    fn test_size_class_selection() {
        assert_eq!(size_class(1), Some(0));
        assert_eq!(size_class(16), Some(0));
        assert_eq!(size_class(17), Some(1));
        assert_eq!(size_class(64), Some(2));
        assert_eq!(size_class(2048), Some(7));
        assert_eq!(size_class(2049), None);
        assert_eq!(size_class(usize::MAX), None);
    }

    #[test]
    fn test_init_rejects_tiny_region() {
        with_test_heap(32, |heap_start, heap_size| {
            let engine = unsafe { SegregatedFreelistAllocator::init(heap_start, heap_size) };
            assert!(engine.is_none());
        });
    }

    #[test]
    fn test_init_rejects_null_region() {
        let engine = unsafe { SegregatedFreelistAllocator::init(ptr::null_mut(), 1024) };
        assert!(engine.is_none());
    }

    #[test]
    fn test_basic_alloc_free() {
        with_test_engine(64 * 1024, |engine| unsafe {
            let ptr = engine.alloc(100);
            assert!(!ptr.is_null());
            assert_eq!(ptr.addr() % ALIGN_SIZE, 0);

            engine.free(ptr);
            assert_eq!(engine.stats.total_allocations, 1);
            assert_eq!(engine.stats.total_frees, 1);
            assert_eq!(engine.stats.current_allocated, 0);
            assert_eq!(engine.stats.current_requested, 0);
        });
    }

    #[test]
    fn test_committed_size_is_class_size() {
        with_test_engine(64 * 1024, |engine| unsafe {
            // 1 + 24-byte header rounds to 32: the 32-byte class.
            let small = engine.alloc(1);
            assert_eq!(engine.stats.current_allocated, 32);

            // 100 + header rounds to 128.
            let medium = engine.alloc(100);
            assert_eq!(engine.stats.current_allocated, 32 + 128);

            // Exactly filling a class keeps the class size.
            let exact = engine.alloc(SIZE_CLASSES[2] - HEADER_SIZE);
            assert_eq!(engine.stats.current_allocated, 32 + 128 + 64);

            engine.free(small);
            engine.free(medium);
            engine.free(exact);
            assert_eq!(engine.stats.current_allocated, 0);
        });
    }

    #[test]
    fn test_large_path_commits_rounded_total() {
        with_test_engine(64 * 1024, |engine| unsafe {
            // Beyond the largest class: committed is header + payload
            // rounded to 8, not a class size.
            let ptr = engine.alloc(3000);
            assert!(!ptr.is_null());
            let expected = (3000 + HEADER_SIZE).next_multiple_of(ALIGN_SIZE);
            assert_eq!(engine.stats.current_allocated, expected as u64);

            engine.free(ptr);
            assert_eq!(engine.stats.current_allocated, 0);
        });
    }

    #[test]
    fn test_class_block_is_reused() {
        with_test_engine(64 * 1024, |engine| unsafe {
            let first = engine.alloc(100);
            engine.free(first);

            // The freed block sits on its class list and is handed back
            // before the large fragment is carved again.
            let second = engine.alloc(100);
            assert_eq!(first, second);

            engine.free(second);
        });
    }

    #[test]
    fn test_distinct_live_pointers() {
        with_test_engine(64 * 1024, |engine| unsafe {
            let mut ptrs = Vec::new();
            for _ in 0..32 {
                let ptr = engine.alloc(48);
                assert!(!ptr.is_null());
                assert!(!ptrs.contains(&ptr));
                ptrs.push(ptr);
            }
            for ptr in ptrs {
                engine.free(ptr);
            }
        });
    }

    #[test]
    fn test_zero_size_is_rejected_without_counting() {
        with_test_engine(64 * 1024, |engine| {
            let ptr = engine.alloc(0);
            assert!(ptr.is_null());
            assert_eq!(engine.stats.failed_allocations, 0);
            assert_eq!(engine.stats.total_allocations, 0);
        });
    }

    #[test]
    fn test_out_of_memory_counts_failure() {
        with_test_engine(4 * 1024, |engine| {
            let ptr = engine.alloc(64 * 1024);
            assert!(ptr.is_null());
            assert_eq!(engine.stats.failed_allocations, 1);
        });
    }

    #[test]
    fn test_heap_exhaustion_and_recovery() {
        with_test_engine(8 * 1024, |engine| unsafe {
            let mut ptrs = Vec::new();
            loop {
                let ptr = engine.alloc(240);
                if ptr.is_null() {
                    break;
                }
                ptrs.push(ptr);
            }
            assert!(!ptrs.is_empty());
            assert_eq!(engine.stats.failed_allocations, 1);

            for ptr in ptrs {
                engine.free(ptr);
            }
            assert_eq!(engine.stats.current_allocated, 0);

            let ptr = engine.alloc(240);
            assert!(!ptr.is_null());
            engine.free(ptr);
        });
    }

    #[test]
    fn test_corrupted_header_is_reported_and_leaked() {
        with_test_engine(64 * 1024, |engine| unsafe {
            let ptr = engine.alloc(100);
            let before = engine.stats;

            // Clobber the hidden header in front of the payload.
            ptr.sub(HEADER_SIZE).write_bytes(0x00, HEADER_SIZE);
            engine.free(ptr);

            assert_eq!(engine.reports().len(), 1);
            assert_eq!(engine.stats, before);
        });
    }

    #[test]
    fn test_free_null_is_noop() {
        with_test_engine(64 * 1024, |engine| unsafe {
            engine.free(ptr::null_mut());
            assert_eq!(engine.stats.total_frees, 0);
            assert!(engine.reports().is_empty());
        });
    }

    #[test]
    fn test_varied_sizes() {
        with_test_engine(1024 * 1024, |engine| unsafe {
            let sizes = [8, 16, 32, 64, 128, 256, 512, 1024, 4096];
            let mut ptrs = Vec::new();
            for size in sizes {
                let ptr = engine.alloc(size);
                assert!(!ptr.is_null());
                ptrs.push(ptr);
            }
            for ptr in ptrs {
                engine.free(ptr);
            }
            assert_eq!(engine.stats.current_allocated, 0);
            assert_eq!(engine.stats.total_allocations, engine.stats.total_frees);
        });
    }
}
