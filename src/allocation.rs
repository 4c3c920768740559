//! Host allocation instrumentation for Vulkan objects.
//!
//! [`AllocationTracker::callbacks`] returns `VkAllocationCallbacks` that
//! route host allocations through the global allocator and count them. The
//! counters are atomics because drivers call these from their own threads.
use ash::vk;
use std::{
    alloc::{self, Layout},
    ffi::c_void,
    mem, ptr,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

const SCOPE_COUNT: usize = 5;

#[inline]
fn scope_slot(scope: vk::SystemAllocationScope) -> usize {
    (scope.as_raw().max(0) as usize).min(SCOPE_COUNT - 1)
}

/// Stored in front of every allocation handed to the driver.
#[repr(C)]
struct Header {
    size: usize,
    align: usize,
    scope: usize,
}

impl Header {
    #[inline]
    fn layout(size: usize, alignment: usize) -> Option<(Layout, usize)> {
        let align = alignment.max(mem::align_of::<Header>());
        let offset = mem::size_of::<Header>().next_multiple_of(align);
        let layout = Layout::from_size_align(offset.checked_add(size)?, align).ok()?;
        Some((layout, offset))
    }

    /// # Safety
    /// `memory` must come from [`AllocationTracker::allocate`].
    #[inline]
    unsafe fn read(memory: *mut c_void) -> (*mut u8, Header) {
        let header = (memory as *mut Header).sub(1).read();
        let offset = mem::size_of::<Header>().next_multiple_of(header.align);
        ((memory as *mut u8).sub(offset), header)
    }
}

#[derive(Debug, Default)]
struct ScopeCounters {
    live: AtomicUsize,
    bytes: AtomicUsize,
}

/// Live host allocations of one `VkSystemAllocationScope`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ScopeStats {
    /// Allocations not yet freed.
    pub live: usize,
    /// Bytes held by those allocations.
    pub bytes: usize,
}

/// Point-in-time copy of an [`AllocationTracker`]'s counters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct AllocationStats {
    /// Per scope counts, indexed by `VkSystemAllocationScope`.
    pub scopes: [ScopeStats; SCOPE_COUNT],
    /// Bytes currently held across every scope.
    pub live_bytes: usize,
    /// Highest `live_bytes` observed.
    pub peak_bytes: usize,
    /// Successful allocations and reallocations since creation.
    pub total_allocations: u64,
    /// Requests the host allocator could not serve.
    pub failed_allocations: u64,
    /// Bytes the driver reports as allocated internally.
    pub internal_bytes: usize,
    /// Internal allocations the driver reports as live.
    pub internal_allocations: usize,
}

impl AllocationStats {
    /// Counts for `scope`.
    #[inline]
    pub fn scope(&self, scope: vk::SystemAllocationScope) -> ScopeStats {
        self.scopes[scope_slot(scope)]
    }
}

/// Counts host allocations made by the driver on behalf of one device.
#[derive(Debug, Default)]
pub struct AllocationTracker {
    scopes: [ScopeCounters; SCOPE_COUNT],
    live_bytes: AtomicUsize,
    peak_bytes: AtomicUsize,
    total_allocations: AtomicU64,
    failed_allocations: AtomicU64,
    internal_bytes: AtomicUsize,
    internal_allocations: AtomicUsize,
}

impl AllocationTracker {
    /// Create a tracker with every counter at zero.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocation callbacks reporting into this tracker. They borrow the
    /// tracker, which must outlive every object created with them.
    pub fn callbacks(&self) -> vk::AllocationCallbacks<'_> {
        let mut callbacks = vk::AllocationCallbacks::default();
        callbacks.p_user_data = self as *const AllocationTracker as *mut c_void;
        callbacks.pfn_allocation = Some(allocation);
        callbacks.pfn_reallocation = Some(reallocation);
        callbacks.pfn_free = Some(free);
        callbacks.pfn_internal_allocation = Some(internal_allocation);
        callbacks.pfn_internal_free = Some(internal_free);
        callbacks
    }

    /// Copies the current counters.
    pub fn snapshot(&self) -> AllocationStats {
        let mut scopes = [ScopeStats::default(); SCOPE_COUNT];
        for (stats, counters) in scopes.iter_mut().zip(&self.scopes) {
            stats.live = counters.live.load(Ordering::Relaxed);
            stats.bytes = counters.bytes.load(Ordering::Relaxed);
        }

        AllocationStats {
            scopes,
            live_bytes: self.live_bytes.load(Ordering::Relaxed),
            peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
            total_allocations: self.total_allocations.load(Ordering::Relaxed),
            failed_allocations: self.failed_allocations.load(Ordering::Relaxed),
            internal_bytes: self.internal_bytes.load(Ordering::Relaxed),
            internal_allocations: self.internal_allocations.load(Ordering::Relaxed),
        }
    }

    fn record_alloc(&self, size: usize, scope: usize) {
        let counters = &self.scopes[scope];
        counters.live.fetch_add(1, Ordering::Relaxed);
        counters.bytes.fetch_add(size, Ordering::Relaxed);
        self.total_allocations.fetch_add(1, Ordering::Relaxed);
        let live = self.live_bytes.fetch_add(size, Ordering::Relaxed) + size;
        self.peak_bytes.fetch_max(live, Ordering::Relaxed);
    }

    fn record_free(&self, size: usize, scope: usize) {
        let counters = &self.scopes[scope];
        counters.live.fetch_sub(1, Ordering::Relaxed);
        counters.bytes.fetch_sub(size, Ordering::Relaxed);
        self.live_bytes.fetch_sub(size, Ordering::Relaxed);
    }

    unsafe fn allocate(&self, size: usize, alignment: usize, scope: usize) -> *mut c_void {
        let Some((layout, offset)) = Header::layout(size, alignment) else {
            self.failed_allocations.fetch_add(1, Ordering::Relaxed);
            return ptr::null_mut();
        };

        let base = alloc::alloc(layout);
        if base.is_null() {
            self.failed_allocations.fetch_add(1, Ordering::Relaxed);
            return ptr::null_mut();
        }

        let memory = base.add(offset);
        (memory as *mut Header).sub(1).write(Header {
            size,
            align: layout.align(),
            scope,
        });
        self.record_alloc(size, scope);
        memory as *mut c_void
    }

    unsafe fn deallocate(&self, memory: *mut c_void) {
        if memory.is_null() {
            return;
        }

        let (base, header) = Header::read(memory);
        self.record_free(header.size, header.scope);
        if let Some((layout, _)) = Header::layout(header.size, header.align) {
            alloc::dealloc(base, layout);
        }
    }
}

#[inline]
unsafe fn tracker<'a>(p_user_data: *mut c_void) -> &'a AllocationTracker {
    &*(p_user_data as *const AllocationTracker)
}

unsafe extern "system" fn allocation(
    p_user_data: *mut c_void,
    size: usize,
    alignment: usize,
    allocation_scope: vk::SystemAllocationScope,
) -> *mut c_void {
    if size == 0 {
        return ptr::null_mut();
    }

    tracker(p_user_data).allocate(size, alignment, scope_slot(allocation_scope))
}

unsafe extern "system" fn reallocation(
    p_user_data: *mut c_void,
    p_original: *mut c_void,
    size: usize,
    alignment: usize,
    allocation_scope: vk::SystemAllocationScope,
) -> *mut c_void {
    let tracker = tracker(p_user_data);
    if p_original.is_null() {
        return allocation(p_user_data, size, alignment, allocation_scope);
    }
    if size == 0 {
        tracker.deallocate(p_original);
        return ptr::null_mut();
    }

    let (_, original) = Header::read(p_original);
    // the alignment of a reallocation must match the original
    let memory = tracker.allocate(size, original.align, original.scope);
    if memory.is_null() {
        return memory;
    }

    ptr::copy_nonoverlapping(
        p_original as *const u8,
        memory as *mut u8,
        original.size.min(size),
    );
    tracker.deallocate(p_original);
    memory
}

unsafe extern "system" fn free(p_user_data: *mut c_void, p_memory: *mut c_void) {
    tracker(p_user_data).deallocate(p_memory);
}

unsafe extern "system" fn internal_allocation(
    p_user_data: *mut c_void,
    size: usize,
    _allocation_type: vk::InternalAllocationType,
    _allocation_scope: vk::SystemAllocationScope,
) {
    let tracker = tracker(p_user_data);
    tracker.internal_bytes.fetch_add(size, Ordering::Relaxed);
    tracker.internal_allocations.fetch_add(1, Ordering::Relaxed);
}

unsafe extern "system" fn internal_free(
    p_user_data: *mut c_void,
    size: usize,
    _allocation_type: vk::InternalAllocationType,
    _allocation_scope: vk::SystemAllocationScope,
) {
    let tracker = tracker(p_user_data);
    tracker.internal_bytes.fetch_sub(size, Ordering::Relaxed);
    tracker.internal_allocations.fetch_sub(1, Ordering::Relaxed);
}
