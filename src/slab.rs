//! C1: lock-free fixed-size-block (slab) allocator.
//!
//! Requests are quantized into one of three geometric size-class bands —
//! 16 B–512 B in 16 B steps, 512 B–~16 KiB in 512 B steps, 16 KiB–512 KiB in
//! 16 KiB steps — each owning its own lock-free `freeList`. A freelist miss
//! grows the class by one OS page, carved into units that are threaded onto
//! the freelist; the first carved unit is returned directly without a
//! second round trip through the list.
//!
//! The freelist is an intrusive lock-free stack: a free unit's own first
//! eight bytes hold the "next" link, so freeing never needs a separate
//! control-block allocation (the bootstrap problem the original source
//! solves with a dedicated control-block pool doesn't arise here). ABA
//! safety for this pointer-based stack comes from a 16-bit generation tag
//! packed into the unused top bits of each 64-bit pointer word — x86-64 and
//! AArch64 canonical addresses use at most 48 bits, leaving 16 bits free.
//! This is a different ABA defense than C2/C3's pool-and-index tagging
//! (there is no fixed-size pool here; units are carved from however many
//! pages have been grown), but the same invariant holds: a repeated pointer
//! value must carry a different tag before it can be CAS-matched again.
//!
//! Page bookkeeping (`systemMemoryList`) is a plain `Mutex<Vec<_>>` — it is
//! touched only on growth and at teardown, never on the `alloc`/`free` hot
//! path, so it does not need to be lock-free.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crossbeam_utils::CachePadded;

use crate::backoff::Backoff;
use crate::error::SlabError;

const TAG_BITS: u32 = 16;
const PTR_MASK: u64 = (1u64 << (64 - TAG_BITS)) - 1;

/// Alignment guaranteed for every allocation this slab hands out. The
/// Michael-Scott queue (C3) relies on this to size its node layout.
pub(crate) const UNIT_ALIGN_GUARANTEE: usize = UNIT_ALIGN;

/// A raw pointer with a generation tag packed into its unused high bits.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct TaggedRawPtr(u64);

impl TaggedRawPtr {
    const NULL: Self = Self(0);

    fn new(ptr: *mut u8, tag: u16) -> Self {
        Self((ptr as u64 & PTR_MASK) | ((tag as u64) << (64 - TAG_BITS)))
    }

    fn ptr(self) -> *mut u8 {
        (self.0 & PTR_MASK) as *mut u8
    }

    fn tag(self) -> u16 {
        (self.0 >> (64 - TAG_BITS)) as u16
    }

    fn is_null(self) -> bool {
        self.ptr().is_null()
    }

    fn with_ptr(self, ptr: *mut u8) -> Self {
        Self::new(ptr, self.tag().wrapping_add(1))
    }
}

struct FreeListHead(AtomicU64);

impl FreeListHead {
    const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    fn load(&self, order: Ordering) -> TaggedRawPtr {
        TaggedRawPtr(self.0.load(order))
    }

    fn compare_exchange_weak(
        &self,
        current: TaggedRawPtr,
        new: TaggedRawPtr,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaggedRawPtr, TaggedRawPtr> {
        self.0
            .compare_exchange_weak(current.0, new.0, success, failure)
            .map(TaggedRawPtr)
            .map_err(TaggedRawPtr)
    }
}

/// The four OS page sizes below are not exposed; growth always carves
/// whichever page size fits at least one unit of the class.
const MIN_PAGE_BYTES: usize = 4096;
/// All unit sizes in every band are multiples of 16; 16-byte alignment is
/// therefore sufficient for every class without inspecting its exact size.
const UNIT_ALIGN: usize = 16;

struct SizeClass {
    unit_size: usize,
    free_head: CachePadded<FreeListHead>,
    page_layout: Layout,
    units_per_page: usize,
    pages: Mutex<Vec<NonNull<u8>>>,
}

unsafe impl Send for SizeClass {}
unsafe impl Sync for SizeClass {}

impl SizeClass {
    fn new(unit_size: usize) -> Self {
        let page_bytes = if unit_size >= MIN_PAGE_BYTES {
            unit_size
        } else {
            MIN_PAGE_BYTES
        };
        let units_per_page = page_bytes / unit_size;
        let page_layout = Layout::from_size_align(page_bytes, UNIT_ALIGN)
            .expect("page layout for slab size class is always valid");

        Self {
            unit_size,
            free_head: CachePadded::new(FreeListHead::new()),
            page_layout,
            units_per_page,
            pages: Mutex::new(Vec::new()),
        }
    }

    fn push_unit(&self, ptr: *mut u8) {
        let mut backoff = Backoff::new();
        loop {
            let observed = self.free_head.load(Ordering::Acquire);
            unsafe {
                (ptr as *mut u64).write(observed.ptr() as u64);
            }
            let new = observed.with_ptr(ptr);
            match self
                .free_head
                .compare_exchange_weak(observed, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(_) => backoff.spin(),
            }
        }
    }

    fn pop_unit(&self) -> Option<*mut u8> {
        let mut backoff = Backoff::new();
        loop {
            let observed = self.free_head.load(Ordering::Acquire);
            if observed.is_null() {
                return None;
            }
            let next = unsafe { *(observed.ptr() as *mut u64) } as *mut u8;
            let new = observed.with_ptr(next);
            match self
                .free_head
                .compare_exchange_weak(observed, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(observed.ptr()),
                Err(_) => backoff.spin(),
            }
        }
    }

    /// Grows by one page, threading all but the first unit onto the
    /// freelist, and returns the first unit directly.
    fn grow(&self) -> Result<NonNull<u8>, SlabError> {
        let page = unsafe { alloc::alloc(self.page_layout) };
        let page = NonNull::new(page).ok_or(SlabError::GrowthFailed)?;

        self.pages
            .lock()
            .expect("slab page registry mutex poisoned")
            .push(page);

        for i in (1..self.units_per_page).rev() {
            let unit = unsafe { page.as_ptr().add(i * self.unit_size) };
            self.push_unit(unit);
        }

        Ok(page)
    }

    fn alloc(&self) -> Result<NonNull<u8>, SlabError> {
        match self.pop_unit() {
            Some(ptr) => Ok(unsafe { NonNull::new_unchecked(ptr) }),
            None => self.grow(),
        }
    }

    fn free(&self, ptr: NonNull<u8>) {
        self.push_unit(ptr.as_ptr());
    }
}

impl Drop for SizeClass {
    fn drop(&mut self) {
        let pages = self.pages.get_mut().expect("slab page registry mutex poisoned");
        for page in pages.drain(..) {
            unsafe { alloc::dealloc(page.as_ptr(), self.page_layout) };
        }
    }
}

fn generate_size_classes() -> Vec<usize> {
    let mut sizes = Vec::with_capacity(31 + 31 + 32);
    sizes.extend((1..=31).map(|k| k * 16));
    sizes.extend((1..=31).map(|k| k * 512));
    sizes.extend((1..=32).map(|k| k * 16384));
    sizes
}

/// Largest request the slab serves from a managed size class; anything
/// larger must be served directly by the system allocator.
pub const MAX_CLASS_SIZE: usize = 512 * 1024;

/// A lock-free fixed-size-block allocator spanning the three geometric
/// bands described in §4.4.
pub struct Slab {
    classes: Vec<SizeClass>,
}

impl Slab {
    pub fn new() -> Self {
        let classes = generate_size_classes()
            .into_iter()
            .map(SizeClass::new)
            .collect();
        Self { classes }
    }

    fn class_index_for(&self, size: usize) -> Option<usize> {
        self.classes.iter().position(|c| c.unit_size >= size)
    }

    /// Allocates a block of at least `size` bytes, rounded up to its class.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>, SlabError> {
        let idx = self
            .class_index_for(size)
            .ok_or(SlabError::RequestTooLarge { requested: size })?;
        self.classes[idx].alloc()
    }

    /// Like [`Slab::alloc`] but also reports the actual class size granted.
    pub fn alloc_acc(&self, size: usize) -> Result<(NonNull<u8>, usize), SlabError> {
        let idx = self
            .class_index_for(size)
            .ok_or(SlabError::RequestTooLarge { requested: size })?;
        let block = self.classes[idx].alloc()?;
        Ok((block, self.classes[idx].unit_size))
    }

    /// Returns a block previously obtained from `alloc`/`alloc_acc` for a
    /// request of `size` bytes back to its class's freelist.
    pub fn free(&self, ptr: NonNull<u8>, size: usize) -> Result<(), SlabError> {
        let idx = self
            .class_index_for(size)
            .ok_or(SlabError::RequestTooLarge { requested: size })?;
        self.classes[idx].free(ptr);
        Ok(())
    }
}

impl Default for Slab {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

// ---------------------------------------------------------------------------
// General-purpose malloc/realloc/calloc facade
// ---------------------------------------------------------------------------

#[repr(C)]
struct BlockHeader {
    capacity_of_block: u32,
    used_bytes: u32,
}

const HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();

impl Slab {
    /// Allocates `size` usable bytes, prefixed with an inline header that
    /// `realloc`/`free` use to recover the owning class.
    pub fn malloc(&self, size: usize) -> Result<NonNull<u8>, SlabError> {
        let (block, class_size) = self.alloc_acc(size + HEADER_SIZE)?;
        unsafe {
            block.cast::<BlockHeader>().as_ptr().write(BlockHeader {
                capacity_of_block: (class_size - HEADER_SIZE) as u32,
                used_bytes: size as u32,
            });
            Ok(NonNull::new_unchecked(block.as_ptr().add(HEADER_SIZE)))
        }
    }

    /// Frees a block obtained from `malloc`/`realloc`/`calloc`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this `Slab`'s `malloc`/`realloc`/
    /// `calloc` and not already freed.
    pub unsafe fn free_block(&self, ptr: NonNull<u8>) -> Result<(), SlabError> {
        let base = ptr.as_ptr().sub(HEADER_SIZE);
        let header = &*(base as *const BlockHeader);
        let class_size = header.capacity_of_block as usize + HEADER_SIZE;
        self.free(NonNull::new_unchecked(base), class_size)
    }

    /// Resizes a block obtained from `malloc`/`realloc`/`calloc`. Shrinks in
    /// place when the existing class still fits; otherwise over-allocates
    /// geometrically (4x `new_size`) and copies the live bytes.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this `Slab`'s `malloc`/`realloc`/
    /// `calloc` and not already freed.
    pub unsafe fn realloc(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>, SlabError> {
        let base = ptr.as_ptr().sub(HEADER_SIZE);
        let header = &mut *(base as *mut BlockHeader);

        if new_size + HEADER_SIZE <= header.capacity_of_block as usize + HEADER_SIZE {
            header.used_bytes = new_size as u32;
            return Ok(ptr);
        }

        let used = header.used_bytes as usize;
        let new_block = self.malloc(new_size * 4)?;
        std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_block.as_ptr(), used.min(new_size));
        let new_header = &mut *(new_block.as_ptr().sub(HEADER_SIZE) as *mut BlockHeader);
        new_header.used_bytes = new_size as u32;

        self.free_block(ptr)?;
        Ok(new_block)
    }

    /// Allocates `numblk * blksize` zeroed bytes.
    pub fn calloc(&self, blksize: usize, numblk: usize) -> Result<NonNull<u8>, SlabError> {
        let total = blksize
            .checked_mul(numblk)
            .ok_or(SlabError::RequestTooLarge {
                requested: usize::MAX,
            })?;
        let block = self.malloc(total)?;
        unsafe { std::ptr::write_bytes(block.as_ptr(), 0, total) };
        Ok(block)
    }
}
