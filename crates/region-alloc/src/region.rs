//! Region carving and the allocator façade.
//!
//! [`RegionAllocator`] turns a caller-provided byte region into a live
//! allocator: the façade control block is placed at the first 16-byte
//! aligned address inside the region, the rest of the region (re-aligned
//! to 16 bytes) is handed to the chosen engine, and every subsequent
//! operation dispatches on the engine stored in the control block. All
//! allocator state lives inside the region; the handle itself only carries
//! the pointer to the control block and the diagnostic sink.
//!
//! ```text
//! caller region
//! ┌─────────┬──────────────────┬───────────────────────────────────────┐
//! │ (slack) │ ControlBlock     │ engine sub-region                     │
//! │         │ tag, sizes,      │ ┌──────────────┬────────────────────┐ │
//! │         │ engine, stats    │ │ engine state │ managed heap       │ │
//! │         │                  │ └──────────────┴────────────────────┘ │
//! └─────────┴──────────────────┴───────────────────────────────────────┘
//! ```
//!
//! The two engines are dispatched through a closed sum type rather than a
//! table of function pointers; the set of algorithms is fixed, so the
//! compiler checks exhaustiveness at every call site.

use core::{fmt, marker::PhantomData, ptr, ptr::NonNull};
use std::alloc::{self, Layout};

use snafu::{OptionExt as _, Snafu, ensure};

use crate::{
    buddy::BuddyAllocator,
    diag::{DiagnosticSink, StderrSink},
    segregated_freelist::SegregatedFreelistAllocator,
    stats::AllocatorStats,
};

/// Alignment of the control block and of the engine sub-region.
const ALLOCATOR_ALIGN: usize = 16;

/// Selects the allocation algorithm backing a [`RegionAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    /// Eight fixed size classes plus a large-fragment list; no coalescing.
    SegregatedFreelist,
    /// Power-of-two blocks with buddy coalescing on release.
    Buddy,
}

/// Reasons a [`RegionAllocator`] could not be created.
#[derive(Debug, Snafu)]
pub enum CreateError {
    /// The region cannot hold the façade control block.
    #[snafu(display("region of {region_size} bytes cannot hold the allocator control block"))]
    RegionTooSmall {
        /// Size of the rejected region.
        region_size: usize,
        /// Where the failure was raised.
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// Alignment padding consumed the whole region.
    #[snafu(display("alignment padding leaves no usable space in a {region_size} byte region"))]
    AlignmentExhausted {
        /// Size of the rejected region.
        region_size: usize,
        /// Where the failure was raised.
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// The chosen engine rejected its sub-region.
    #[snafu(display("{algorithm:?} engine rejected its {impl_region_size} byte sub-region"))]
    EngineInit {
        /// The algorithm whose engine failed to initialize.
        algorithm: Algorithm,
        /// Size of the sub-region offered to the engine.
        impl_region_size: usize,
        /// Where the failure was raised.
        #[snafu(implicit)]
        location: snafu::Location,
    },
    /// The host allocator refused to provide a backing buffer.
    #[snafu(display("failed to obtain {memory_size} bytes of backing from the host allocator"))]
    Backing {
        /// Requested backing size, before the alignment slack.
        memory_size: usize,
        /// Where the failure was raised.
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// The engine actually serving requests, stored in the control block.
///
/// Both variants point at engine state placed inside the engine sub-region.
enum Engine {
    Segregated(NonNull<SegregatedFreelistAllocator>),
    Buddy(NonNull<BuddyAllocator>),
}

/// The façade control block, written at the aligned start of the region.
///
/// It never moves after creation; the handle addresses it by pointer.
struct ControlBlock {
    algorithm: Algorithm,
    /// The raw region exactly as the caller provided it.
    region: *mut u8,
    region_size: usize,
    /// Sub-region handed to the engine, after the control block.
    impl_region: *mut u8,
    impl_region_size: usize,
    engine: Engine,
    /// Whether the façade obtained `region` from the host allocator and
    /// must release it on destruction.
    owns_region: bool,
    stats: AllocatorStats,
}

/// An in-place allocator over a caller-provided memory region.
///
/// All allocator state (the control block, the engine state, and the
/// managed heap) lives inside the region; creation writes it in place and
/// no operation ever touches the host allocator (except
/// [`with_platform_backing`](Self::with_platform_backing), which obtains
/// the region itself from it).
///
/// Dropping the handle destroys the allocator. Memory still allocated at
/// that point is simply gone with the region; there is nothing to leak to.
///
/// The handle is `Send` but not `Sync`: all operations take `&mut self`
/// and the underlying state is unsynchronized.
///
/// # Examples
///
/// ```
/// use region_alloc::region::{Algorithm, RegionAllocator};
///
/// let mut backing = vec![0u8; 1024 * 1024];
/// let mut allocator = RegionAllocator::create(Algorithm::Buddy, &mut backing).unwrap();
///
/// let ptr = allocator.alloc(256);
/// assert!(!ptr.is_null());
///
/// unsafe { allocator.free(ptr) };
/// assert_eq!(allocator.stats().current_allocated, 0);
/// ```
pub struct RegionAllocator<'region> {
    ctrl: NonNull<ControlBlock>,
    sink: Box<dyn DiagnosticSink>,
    _region: PhantomData<&'region mut [u8]>,
}

unsafe impl Send for RegionAllocator<'_> {}

impl<'region> RegionAllocator<'region> {
    /// Creates an allocator in place inside `region`.
    ///
    /// The caller keeps ownership of the region's storage; the allocator
    /// borrows it for the lifetime of the handle and writes all of its
    /// state into it. On error nothing observable persists and the region
    /// is immediately reusable.
    ///
    /// # Errors
    ///
    /// Returns an error if the region cannot hold the control block once
    /// aligned, or if the engine rejects the remaining sub-region.
    pub fn create(
        algorithm: Algorithm,
        region: &'region mut [u8],
    ) -> Result<Self, CreateError> {
        let region_size = region.len();
        let region = region.as_mut_ptr();
        // SAFETY: the slice borrow guarantees the range is valid, exclusive
        // and outlives the returned handle.
        unsafe { Self::create_in(algorithm, region, region_size, false) }
    }

    /// Creates an allocator on a buffer obtained from the host allocator.
    ///
    /// The buffer is `memory_size` bytes plus alignment slack; the returned
    /// handle owns it and releases it on drop.
    ///
    /// # Errors
    ///
    /// Returns an error if the host allocator refuses the buffer or if
    /// creation on the fresh buffer fails; the buffer is released before
    /// the error is returned.
    pub fn with_platform_backing(
        algorithm: Algorithm,
        memory_size: usize,
    ) -> Result<RegionAllocator<'static>, CreateError> {
        let layout = backing_layout(memory_size).context(BackingSnafu { memory_size })?;
        // SAFETY: `layout` has non-zero size.
        let backing = unsafe { alloc::alloc(layout) };
        ensure!(!backing.is_null(), BackingSnafu { memory_size });

        // SAFETY: the fresh buffer is valid, exclusive, and lives until
        // the owning handle is dropped.
        match unsafe { RegionAllocator::create_in(algorithm, backing, memory_size, true) } {
            Ok(allocator) => Ok(allocator),
            Err(err) => {
                // SAFETY: allocated above with this exact layout.
                unsafe { alloc::dealloc(backing, layout) };
                Err(err)
            }
        }
    }

    /// Carves `region` and writes the control block and engine state.
    ///
    /// # Safety
    ///
    /// `region..region + region_size` must be valid for reads and writes,
    /// not aliased by anything else, and must stay valid for the lifetime
    /// of the returned handle.
    unsafe fn create_in(
        algorithm: Algorithm,
        region: *mut u8,
        region_size: usize,
        owns_region: bool,
    ) -> Result<Self, CreateError> {
        ensure!(
            !region.is_null() && region_size >= size_of::<ControlBlock>(),
            RegionTooSmallSnafu { region_size }
        );

        let prefix = region.align_offset(ALLOCATOR_ALIGN);
        ensure!(prefix < region_size, AlignmentExhaustedSnafu { region_size });
        let usable = region_size - prefix;
        ensure!(
            usable >= size_of::<ControlBlock>(),
            RegionTooSmallSnafu { region_size }
        );
        let base = unsafe { region.add(prefix) };

        let impl_align =
            unsafe { base.add(size_of::<ControlBlock>()) }.align_offset(ALLOCATOR_ALIGN);
        let impl_prefix = size_of::<ControlBlock>() + impl_align;
        ensure!(impl_prefix <= usable, AlignmentExhaustedSnafu { region_size });
        let impl_region = unsafe { base.add(impl_prefix) };
        let impl_region_size = usable - impl_prefix;

        // The engine lays its own state and heap inside the sub-region and
        // reports back how much heap it actually manages.
        let (engine, heap_size) = match algorithm {
            Algorithm::SegregatedFreelist => {
                unsafe { SegregatedFreelistAllocator::init(impl_region, impl_region_size) }
                    .map(|(engine, heap_size)| (Engine::Segregated(engine), heap_size))
            }
            Algorithm::Buddy => unsafe { BuddyAllocator::init(impl_region, impl_region_size) }
                .map(|(engine, heap_size)| (Engine::Buddy(engine), heap_size)),
        }
        .context(EngineInitSnafu {
            algorithm,
            impl_region_size,
        })?;

        #[expect(clippy::cast_ptr_alignment)]
        let ctrl_ptr = base.cast::<ControlBlock>();
        unsafe {
            ctrl_ptr.write(ControlBlock {
                algorithm,
                region,
                region_size,
                impl_region,
                impl_region_size,
                engine,
                owns_region,
                stats: AllocatorStats {
                    heap_size: heap_size as u64,
                    ..AllocatorStats::default()
                },
            });
        }
        let ctrl = NonNull::new(ctrl_ptr)
            .expect("control block address is derived from a non-null region");

        Ok(Self {
            ctrl,
            sink: Box::new(StderrSink),
            _region: PhantomData,
        })
    }

    /// Allocates `size` payload bytes from the managed region.
    ///
    /// Returns null if `size` is zero or the engine cannot serve the
    /// request; the latter is counted in
    /// [`failed_allocations`](AllocatorStats::failed_allocations).
    #[must_use]
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        // SAFETY: control block and engine state are valid for the whole
        // lifetime of the handle.
        let ctrl = unsafe { self.ctrl.as_mut() };
        match &mut ctrl.engine {
            Engine::Segregated(engine) => unsafe {
                engine.as_mut().alloc(size, &mut ctrl.stats)
            },
            Engine::Buddy(engine) => unsafe { engine.as_mut().alloc(size, &mut ctrl.stats) },
        }
    }

    /// Releases a block previously returned by [`alloc`](Self::alloc).
    ///
    /// A null `ptr` is a no-op. A pointer whose block header fails
    /// validation is reported through the diagnostic sink and leaked.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer obtained from [`alloc`](Self::alloc)
    /// on this allocator that has not been released since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let sink = self.sink.as_mut();
        // SAFETY: as in `alloc`.
        let ctrl = unsafe { self.ctrl.as_mut() };
        match &mut ctrl.engine {
            Engine::Segregated(engine) => unsafe {
                engine.as_mut().free(ptr, &mut ctrl.stats, sink);
            },
            Engine::Buddy(engine) => unsafe {
                engine.as_mut().free(ptr, &mut ctrl.stats, sink);
            },
        }
    }

    /// Re-allocates `ptr` to `new_size` bytes without copying the payload.
    ///
    /// `realloc(null, n)` behaves like [`alloc`](Self::alloc); a zero
    /// `new_size` behaves like [`free`](Self::free) and returns null.
    /// Otherwise a new block is allocated and, on success, the old block is
    /// released. The façade keeps no per-block size metadata, so **payload
    /// bytes are not carried over**; callers that need a copying realloc
    /// must track sizes themselves or use an engine directly.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free) for `ptr`.
    #[must_use = "the old pointer is released; only the returned pointer stays valid"]
    pub unsafe fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(new_size);
        }
        if new_size == 0 {
            // SAFETY: forwarded caller contract.
            unsafe { self.free(ptr) };
            return ptr::null_mut();
        }

        let new_ptr = self.alloc(new_size);
        if !new_ptr.is_null() {
            // SAFETY: forwarded caller contract.
            unsafe { self.free(ptr) };
        }
        new_ptr
    }

    /// Returns a copy of the statistics block.
    #[must_use]
    pub fn stats(&self) -> AllocatorStats {
        // SAFETY: as in `alloc`.
        unsafe { self.ctrl.as_ref() }.stats
    }

    /// Zeros all statistics except
    /// [`heap_size`](AllocatorStats::heap_size).
    pub fn reset_stats(&mut self) {
        // SAFETY: as in `alloc`.
        unsafe { self.ctrl.as_mut() }.stats.reset();
    }

    /// The algorithm chosen at creation.
    #[must_use]
    pub fn algorithm(&self) -> Algorithm {
        // SAFETY: as in `alloc`.
        unsafe { self.ctrl.as_ref() }.algorithm
    }

    /// Routes future corruption reports to `sink` instead of standard
    /// error.
    pub fn set_diagnostic_sink(&mut self, sink: Box<dyn DiagnosticSink>) {
        self.sink = sink;
    }
}

impl fmt::Debug for RegionAllocator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SAFETY: control block is valid for the lifetime of the handle.
        let ctrl = unsafe { self.ctrl.as_ref() };
        f.debug_struct("RegionAllocator")
            .field("algorithm", &ctrl.algorithm)
            .field("region", &ctrl.region)
            .field("region_size", &ctrl.region_size)
            .field("impl_region", &ctrl.impl_region)
            .field("impl_region_size", &ctrl.impl_region_size)
            .field("owns_region", &ctrl.owns_region)
            .field("stats", &ctrl.stats)
            .finish_non_exhaustive()
    }
}

impl Drop for RegionAllocator<'_> {
    fn drop(&mut self) {
        // SAFETY: the control block was written by `create_in` and the
        // region has not moved since.
        let ctrl = unsafe { self.ctrl.as_ref() };
        if !ctrl.owns_region {
            return;
        }
        let Some(layout) = backing_layout(ctrl.region_size) else {
            return;
        };
        // SAFETY: an owned region was allocated by `with_platform_backing`
        // with exactly this layout.
        unsafe { alloc::dealloc(ctrl.region, layout) };
    }
}

/// Layout of the buffer backing [`RegionAllocator::with_platform_backing`]:
/// the requested size plus slack for the initial alignment step.
fn backing_layout(memory_size: usize) -> Option<Layout> {
    let padded = memory_size.checked_add(ALLOCATOR_ALIGN)?;
    Layout::from_size_align(padded, ALLOCATOR_ALIGN).ok()
}
