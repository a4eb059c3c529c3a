// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dynamic shared memory areas.
//!
//! A [`DsaArea`] is a heap spread over any number of dynamic shared memory
//! segments. Allocations are identified by [`DsaPointer`]s, which mean the
//! same thing in every process attached to the area;
//! [`DsaArea::get_address`] turns one into a local address, mapping the
//! segment on first use.
//!
//! # Layout
//!
//! ```text
//! segment 0:  | control block | free page manager | page map | pages ...
//! segment n:  | header        | free page manager | page map | pages ...
//! ```
//!
//! The control block begins with a segment header of its own. The page map
//! has one [`DsaPointer`] per page, naming the span that owns the page.
//! Small requests are carved out of 16-page superblocks kept in one pool per
//! size class; requests above [`MAX_SMALL_OBJECT_SIZE`] get a run of pages
//! wrapped in a span of their own.
//!
//! # Locking
//!
//! The area lock in the control block protects the segment bins, segment
//! creation and destruction, and size accounting. Each pool has a lock for
//! its span lists. The two are never held together: allocation drops the
//! pool lock while the area grows, and freeing an empty superblock unlinks it
//! under the pool lock and returns its pages under the area lock afterwards.
//!
//! Segments that become completely free are given back to the system. Other
//! processes notice through a counter in the control block and unmap their
//! stale copies before resolving any pointer.

use crate::freepage::{FreePageManager, FPM_PAGE_SIZE};
use crate::pointer::{DsaPointer, DSA_MAX_SEGMENTS, DSA_MAX_SEGMENT_SIZE};
use crate::size_class::{
    class_size, objects_per_superblock, size_to_class, MAX_SMALL_OBJECT_SIZE, NUM_SIZE_CLASSES,
    PAGES_PER_SUPERBLOCK, SCLASS_BLOCK_OF_SPANS, SCLASS_SPAN_LARGE, SUPERBLOCK_SIZE,
};
use crate::DsaError;
use core::fmt::Write as _;
use core::mem::{align_of, size_of};
use core::ops::BitOr;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use libdd_dsm::{Dsm, DsmError, DsmHandle, LwLock, Segment};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// An area is identified by the handle of its first segment.
pub type DsaHandle = DsmHandle;

pub const DEFAULT_INIT_SEGMENT_SIZE: usize = 1 << 20;
pub const DEFAULT_MAX_SEGMENT_SIZE: usize = DSA_MAX_SEGMENT_SIZE;
/// Largest request accepted without [`AllocFlags::HUGE`].
pub const MAX_ALLOC_SIZE: usize = (1 << 30) - 1;
pub const MAX_HUGE_ALLOC_SIZE: usize = isize::MAX as usize;

const SEGMENT_HEADER_MAGIC: u32 = 0x0ce2_6608;
const SEGMENT_INDEX_NONE: usize = usize::MAX;
/// Segments are binned by `log2` of their largest free run, so a search can
/// skip segments that are too fragmented for a request.
const NUM_SEGMENT_BINS: usize = 16;
const NUM_SEGMENTS_AT_EACH_SIZE: usize = 2;
/// Spans of a pool are kept in four lists: nearly empty, the active list,
/// mostly full, and completely full.
const FULLNESS_CLASSES: usize = 4;
const SPAN_NOTHING_FREE: u16 = u16::MAX;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DsaConfig {
    /// Names the area's locks in diagnostics.
    pub tranche_id: u32,
    /// Size of the first segment. Later segments double every two segments.
    pub init_segment_size: usize,
    pub max_segment_size: usize,
    /// Limit on the combined size of all segments.
    pub max_total_size: usize,
}

impl Default for DsaConfig {
    fn default() -> Self {
        DsaConfig {
            tranche_id: 0,
            init_segment_size: DEFAULT_INIT_SEGMENT_SIZE,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_total_size: usize::MAX,
        }
    }
}

impl DsaConfig {
    pub fn new(tranche_id: u32) -> Self {
        DsaConfig {
            tranche_id,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), DsaError> {
        if self.init_segment_size < minimum_size() {
            return Err(DsaError::Misuse(format!(
                "initial dsa segment size must be at least {}, but {} provided",
                minimum_size(),
                self.init_segment_size
            )));
        }
        if self.max_segment_size < self.init_segment_size
            || self.max_segment_size > DSA_MAX_SEGMENT_SIZE
        {
            return Err(DsaError::Misuse(format!(
                "maximum dsa segment size {} must be between {} and {DSA_MAX_SEGMENT_SIZE}",
                self.max_segment_size, self.init_segment_size
            )));
        }
        Ok(())
    }
}

/// Options for [`DsaArea::allocate_extended`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocFlags(u32);

impl AllocFlags {
    pub const NONE: AllocFlags = AllocFlags(0);
    /// Allow requests larger than [`MAX_ALLOC_SIZE`].
    pub const HUGE: AllocFlags = AllocFlags(1);
    /// Return [`DsaPointer::NULL`] instead of an out-of-memory error.
    pub const NO_OOM: AllocFlags = AllocFlags(2);
    /// Zero the allocation.
    pub const ZERO: AllocFlags = AllocFlags(4);

    pub const fn contains(self, other: AllocFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AllocFlags {
    type Output = AllocFlags;

    fn bitor(self, rhs: AllocFlags) -> AllocFlags {
        AllocFlags(self.0 | rhs.0)
    }
}

// ---------------------------------------------------------------------------
// Shared structures
// ---------------------------------------------------------------------------

#[repr(C)]
struct SegmentHeader {
    /// `SEGMENT_HEADER_MAGIC ^ area handle ^ segment index`.
    magic: u32,
    /// Set, under the area lock, once the segment has been given back.
    freed: AtomicBool,
    usable_pages: usize,
    size: usize,
    /// Neighbours in the segment bin list.
    prev: usize,
    next: usize,
    bin: usize,
}

/// Describes a run of pages: a superblock of one size class, or the pages
/// of a single large allocation.
#[repr(C)]
pub(crate) struct Span {
    pool: DsaPointer,
    prevspan: DsaPointer,
    nextspan: DsaPointer,
    start: DsaPointer,
    npages: usize,
    size_class: u16,
    ninitialized: u16,
    nallocatable: u16,
    /// Index of the first object on the span's freelist; each free object
    /// stores the index of the next one in its first two bytes.
    firstfree: u16,
    nmax: u16,
    fclass: u16,
}

#[repr(C)]
struct Pool {
    lock: LwLock,
    spans: [DsaPointer; FULLNESS_CLASSES],
}

#[repr(C)]
struct AreaControl {
    segment_header: SegmentHeader,
    handle: u32,
    lwlock_tranche_id: u32,
    lock: LwLock,
    refcnt: u32,
    pinned: bool,
    init_segment_size: usize,
    max_segment_size: usize,
    total_segment_size: usize,
    max_total_segment_size: usize,
    /// Highest index ever used; slots above it have never held a segment.
    high_segment_index: usize,
    freed_segment_counter: AtomicU64,
    segment_bins: [usize; NUM_SEGMENT_BINS],
    segment_handles: [AtomicU32; DSA_MAX_SEGMENTS],
    pools: [Pool; NUM_SIZE_CLASSES],
}

const fn maxalign(size: usize) -> usize {
    (size + 7) & !7
}

const fn page_align(size: usize) -> usize {
    size.div_ceil(FPM_PAGE_SIZE) * FPM_PAGE_SIZE
}

const CONTROL_SIZE: usize = maxalign(size_of::<AreaControl>());
const HEADER_SIZE: usize = maxalign(size_of::<SegmentHeader>());
const FPM_SIZE: usize = maxalign(size_of::<FreePageManager>());

const _: () = assert!(align_of::<AreaControl>() <= 8);
const _: () = assert!(align_of::<FreePageManager>() <= 8);

fn segment_bin(npages: usize) -> usize {
    ((usize::BITS - npages.leading_zeros()) as usize).min(NUM_SEGMENT_BINS - 1)
}

/// Metadata bytes in front of the first usable page of a segment other
/// than segment 0 that has `usable_pages` usable pages.
fn metadata_bytes_for(usable_pages: usize) -> usize {
    // The page map covers the metadata pages too.
    let mut metadata_pages = 0;
    loop {
        let bytes = page_align(
            HEADER_SIZE + FPM_SIZE + (usable_pages + metadata_pages) * size_of::<DsaPointer>(),
        );
        if bytes / FPM_PAGE_SIZE <= metadata_pages {
            return bytes;
        }
        metadata_pages = bytes / FPM_PAGE_SIZE;
    }
}

/// Smallest region [`DsaArea::create_in_place`] accepts.
pub fn minimum_size() -> usize {
    let mut size = CONTROL_SIZE + FPM_SIZE;
    let mut pages = 0;
    while size.div_ceil(FPM_PAGE_SIZE) > pages {
        pages += 1;
        size += size_of::<DsaPointer>();
    }
    pages * FPM_PAGE_SIZE
}

/// Local view of one segment.
#[derive(Clone, Copy)]
struct SegmentMap {
    index: usize,
    base: *mut u8,
}

impl SegmentMap {
    fn header(self) -> *mut SegmentHeader {
        self.base.cast()
    }

    fn fpm(self) -> *mut FreePageManager {
        let offset = if self.index == 0 { CONTROL_SIZE } else { HEADER_SIZE };
        self.base.wrapping_add(offset).cast()
    }

    fn pagemap(self) -> *mut DsaPointer {
        self.fpm().cast::<u8>().wrapping_add(FPM_SIZE).cast()
    }
}

// ---------------------------------------------------------------------------
// Control block setup and teardown
// ---------------------------------------------------------------------------

/// # Safety
/// `place` must be valid for writes of `size` bytes, 8-byte aligned, and not
/// in use by anyone else.
unsafe fn initialize_control(
    place: *mut u8,
    size: usize,
    config: &DsaConfig,
    handle: DsmHandle,
) -> Result<(), DsaError> {
    if size < minimum_size() {
        return Err(DsaError::Misuse(format!(
            "dsa_area space must be at least {}, but {size} provided",
            minimum_size()
        )));
    }
    let total_pages = size / FPM_PAGE_SIZE;
    let metadata_bytes =
        page_align(CONTROL_SIZE + FPM_SIZE + total_pages * size_of::<DsaPointer>());
    let usable_pages = size.saturating_sub(metadata_bytes) / FPM_PAGE_SIZE;
    let bin = segment_bin(usable_pages);

    let mut segment_bins = [SEGMENT_INDEX_NONE; NUM_SEGMENT_BINS];
    segment_bins[bin] = 0;
    place.cast::<AreaControl>().write(AreaControl {
        segment_header: SegmentHeader {
            magic: SEGMENT_HEADER_MAGIC ^ handle.as_u32(),
            freed: AtomicBool::new(false),
            usable_pages,
            size,
            prev: SEGMENT_INDEX_NONE,
            next: SEGMENT_INDEX_NONE,
            bin,
        },
        handle: handle.as_u32(),
        lwlock_tranche_id: config.tranche_id,
        lock: LwLock::new(config.tranche_id),
        refcnt: 1,
        pinned: false,
        init_segment_size: config.init_segment_size,
        max_segment_size: config.max_segment_size,
        total_segment_size: size,
        max_total_segment_size: config.max_total_size,
        high_segment_index: 0,
        freed_segment_counter: AtomicU64::new(0),
        segment_bins,
        segment_handles: core::array::from_fn(|i| {
            AtomicU32::new(if i == 0 { handle.as_u32() } else { 0 })
        }),
        pools: core::array::from_fn(|_| Pool {
            lock: LwLock::new(config.tranche_id),
            spans: [DsaPointer::NULL; FULLNESS_CLASSES],
        }),
    });

    let fpm = place.add(CONTROL_SIZE).cast::<FreePageManager>();
    FreePageManager::initialize(fpm, place);
    // A region of exactly minimum_size() has no usable pages.
    if usable_pages > 0 {
        (*fpm).put(metadata_bytes / FPM_PAGE_SIZE, usable_pages)?;
    }
    Ok(())
}

/// Registers one more process with the area and returns the current
/// freed-segment counter.
///
/// # Safety
/// `control` must point to at least `size_of::<AreaControl>()` mapped bytes.
unsafe fn attach_control(control: *mut AreaControl, handle: DsmHandle) -> Result<u64, DsaError> {
    if (*control).segment_header.magic != SEGMENT_HEADER_MAGIC ^ handle.as_u32()
        || (*control).handle != handle.as_u32()
        || (*control).segment_handles[0].load(Ordering::Acquire) != handle.as_u32()
    {
        return Err(DsaError::Corrupted(format!(
            "no dynamic shared memory area found at segment {handle}"
        )));
    }
    let _guard = (*control).lock.write();
    if (*control).refcnt == 0 {
        // The last process already let go of it.
        return Err(DsaError::Misuse(
            "could not attach to dynamic shared area".to_owned(),
        ));
    }
    (*control).refcnt += 1;
    Ok((*control).freed_segment_counter.load(Ordering::Acquire))
}

/// Drops one process's reference. The last one unpins every segment, which
/// lets them go away once nothing maps them.
///
/// # Safety
/// `control` must point to a live area control block.
unsafe fn release_control<F>(control: *mut AreaControl, mut unpin: F) -> Result<(), DsaError>
where
    F: FnMut(DsmHandle) -> Result<(), DsmError>,
{
    let _guard = (*control).lock.write();
    if (*control).refcnt == 0 {
        return Err(DsaError::Misuse(
            "dynamic shared memory area released more often than attached".to_owned(),
        ));
    }
    (*control).refcnt -= 1;
    if (*control).refcnt == 0 {
        for index in 0..=(*control).high_segment_index {
            let handle =
                DsmHandle::from_u32((*control).segment_handles[index].load(Ordering::Acquire));
            if handle.is_valid() {
                if let Err(err) = unpin(handle) {
                    tracing::warn!(%handle, %err, "could not unpin dynamic shared memory area segment");
                }
            }
        }
        tracing::debug!(handle = (*control).handle, "released dynamic shared memory area");
    }
    Ok(())
}

fn check_place(place: NonNull<u8>) -> Result<(), DsaError> {
    if place.as_ptr() as usize % align_of::<AreaControl>() != 0 {
        return Err(DsaError::Misuse(format!(
            "dsa_area place {place:p} is not suitably aligned"
        )));
    }
    Ok(())
}

/// Arranges for the area at `place` to be released when `segment` is
/// detached.
fn release_on_detach(segment: &mut Segment, place: NonNull<u8>) -> Result<(), DsaError> {
    let offset = (place.as_ptr() as usize).wrapping_sub(segment.address().as_ptr() as usize);
    if offset >= segment.size() {
        return Err(DsaError::Misuse(format!(
            "dsa_area place {place:p} is not inside segment {}",
            segment.handle()
        )));
    }
    segment.on_detach(move |segment| {
        let control = segment.address().as_ptr().wrapping_add(offset).cast();
        // SAFETY: the segment is still mapped while its callbacks run.
        let released = unsafe { release_control(control, |handle| segment.unpin_segment(handle)) };
        if let Err(err) = released {
            tracing::warn!(%err, "could not release dynamic shared memory area");
        }
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// DsaArea
// ---------------------------------------------------------------------------

/// A segment this process has mapped.
struct MappedSegment {
    handle: DsmHandle,
    /// `None` when the session keeps the mapping alive (see
    /// [`DsaArea::pin_mapping`]) or when the area lives in caller memory.
    segment: Option<Segment>,
}

struct LocalState {
    segments: Vec<Option<MappedSegment>>,
    mapping_pinned: bool,
    high_segment_index: usize,
}

/// This process's handle on a dynamic shared memory area.
///
/// Dropping it detaches from every segment. For areas made with
/// [`DsaArea::create`] or [`DsaArea::attach`] it also releases this
/// process's reference; the area is destroyed when the last reference goes
/// unless it was pinned.
pub struct DsaArea {
    dsm: Dsm,
    control: NonNull<AreaControl>,
    /// Base address of every mapped segment, null when unmapped.
    addresses: Box<[AtomicPtr<u8>]>,
    /// Value of the shared freed-segment counter when stale mappings were
    /// last dropped.
    freed_segment_counter: AtomicU64,
    local: Mutex<LocalState>,
    release_on_drop: bool,
}

// SAFETY: the control block and segments are shared memory, mutated only
// under the area and pool locks or through atomics. Local bookkeeping is
// behind a mutex or atomic.
unsafe impl Send for DsaArea {}
unsafe impl Sync for DsaArea {}

struct Mapping {
    segment: Option<Segment>,
    address: NonNull<u8>,
    size: usize,
}

fn map_handle(dsm: &Dsm, handle: DsmHandle) -> Result<Mapping, DsaError> {
    if let Some(mapping) = dsm.pinned_mapping(handle) {
        return Ok(Mapping {
            segment: None,
            address: mapping.address,
            size: mapping.size,
        });
    }
    let segment = dsm.attach(handle)?;
    Ok(Mapping {
        address: segment.address(),
        size: segment.size(),
        segment: Some(segment),
    })
}

impl DsaArea {
    fn new_local(
        dsm: &Dsm,
        control: NonNull<AreaControl>,
        first: MappedSegment,
        freed_segment_counter: u64,
        release_on_drop: bool,
    ) -> DsaArea {
        let addresses: Box<[AtomicPtr<u8>]> = (0..DSA_MAX_SEGMENTS)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        addresses[0].store(control.as_ptr().cast(), Ordering::Release);
        let mut segments: Vec<Option<MappedSegment>> =
            (0..DSA_MAX_SEGMENTS).map(|_| None).collect();
        segments[0] = Some(first);
        DsaArea {
            dsm: dsm.clone(),
            control,
            addresses,
            freed_segment_counter: AtomicU64::new(freed_segment_counter),
            local: Mutex::new(LocalState {
                segments,
                mapping_pinned: false,
                high_segment_index: 0,
            }),
            release_on_drop,
        }
    }

    /// Creates an area in a new segment.
    pub fn create(dsm: &Dsm, config: DsaConfig) -> Result<DsaArea, DsaError> {
        config.validate()?;
        let segment = dsm.create(config.init_segment_size)?;
        // Segment lifetime is managed by the area from now on.
        segment.pin()?;
        let handle = segment.handle();
        let place = segment.address();
        // SAFETY: the segment is new, unknown to anyone else, and at least
        // init_segment_size bytes long.
        let initialized =
            unsafe { initialize_control(place.as_ptr(), config.init_segment_size, &config, handle) };
        if let Err(err) = initialized {
            if let Err(unpin_err) = dsm.unpin_segment(handle) {
                tracing::warn!(%handle, %unpin_err, "could not unpin dynamic shared memory area segment");
            }
            return Err(err);
        }
        tracing::debug!(%handle, size = config.init_segment_size, "created dynamic shared memory area");
        Ok(DsaArea::new_local(
            dsm,
            place.cast(),
            MappedSegment {
                handle,
                segment: Some(segment),
            },
            0,
            true,
        ))
    }

    /// Attaches to an area made by [`DsaArea::create`], possibly in another
    /// process.
    pub fn attach(dsm: &Dsm, handle: DsaHandle) -> Result<DsaArea, DsaError> {
        let mapping = map_handle(dsm, handle)?;
        if mapping.size < CONTROL_SIZE {
            return Err(DsaError::Corrupted(format!(
                "segment {handle} is too small to hold a dynamic shared memory area"
            )));
        }
        let control = mapping.address.cast::<AreaControl>();
        // SAFETY: the mapping is at least as large as a control block.
        let counter = unsafe { attach_control(control.as_ptr(), handle)? };
        tracing::debug!(%handle, "attached to dynamic shared memory area");
        Ok(DsaArea::new_local(
            dsm,
            control,
            MappedSegment {
                handle,
                segment: mapping.segment,
            },
            counter,
            true,
        ))
    }

    /// Creates an area whose control block lives in caller memory, such as
    /// part of an existing segment. Further segments are created through
    /// `dsm` as needed.
    ///
    /// The area must be released explicitly with
    /// [`DsaArea::release_in_place`] by every process that created or
    /// attached it, unless `segment` is the segment containing `place`, in
    /// which case detaching that segment releases it.
    ///
    /// # Safety
    /// `place` must be valid for reads and writes of `size` bytes for as long
    /// as any process uses the area, and must refer to the same memory in
    /// every process that attaches with [`DsaArea::attach_in_place`].
    pub unsafe fn create_in_place(
        dsm: &Dsm,
        place: NonNull<u8>,
        size: usize,
        tranche_id: u32,
        segment: Option<&mut Segment>,
    ) -> Result<DsaArea, DsaError> {
        check_place(place)?;
        let config = DsaConfig::new(tranche_id);
        initialize_control(place.as_ptr(), size, &config, DsmHandle::INVALID)?;
        if let Some(segment) = segment {
            release_on_detach(segment, place)?;
        }
        Ok(DsaArea::new_local(
            dsm,
            place.cast(),
            MappedSegment {
                handle: DsmHandle::INVALID,
                segment: None,
            },
            0,
            false,
        ))
    }

    /// Attaches to an area made by [`DsaArea::create_in_place`].
    ///
    /// # Safety
    /// `place` must be this process's address of the memory the area was
    /// created in, and stay valid while the returned handle is alive.
    pub unsafe fn attach_in_place(
        dsm: &Dsm,
        place: NonNull<u8>,
        segment: Option<&mut Segment>,
    ) -> Result<DsaArea, DsaError> {
        check_place(place)?;
        let control = place.cast::<AreaControl>();
        let counter = attach_control(control.as_ptr(), DsmHandle::INVALID)?;
        if let Some(segment) = segment {
            if let Err(err) = release_on_detach(segment, place) {
                release_control(control.as_ptr(), |handle| dsm.unpin_segment(handle))?;
                return Err(err);
            }
        }
        Ok(DsaArea::new_local(
            dsm,
            control,
            MappedSegment {
                handle: DsmHandle::INVALID,
                segment: None,
            },
            counter,
            false,
        ))
    }

    /// Releases one reference to an in-place area. The last release frees
    /// every segment the area created.
    ///
    /// # Safety
    /// `place` must hold an area created with [`DsaArea::create_in_place`],
    /// released at most once per creation or attachment.
    pub unsafe fn release_in_place(dsm: &Dsm, place: NonNull<u8>) -> Result<(), DsaError> {
        check_place(place)?;
        release_control(place.as_ptr().cast(), |handle| dsm.unpin_segment(handle))
    }

    fn ctl(&self) -> *mut AreaControl {
        self.control.as_ptr()
    }

    /// Handle other processes can pass to [`DsaArea::attach`]. Invalid for
    /// in-place areas.
    pub fn handle(&self) -> DsaHandle {
        // SAFETY: immutable after creation.
        DsmHandle::from_u32(unsafe { (*self.ctl()).handle })
    }

    pub fn tranche_id(&self) -> u32 {
        // SAFETY: immutable after creation.
        unsafe { (*self.ctl()).lwlock_tranche_id }
    }

    /// Keeps the area, and everything allocated in it, alive when no
    /// process is attached.
    pub fn pin(&self) -> Result<(), DsaError> {
        // SAFETY: control fields are protected by the area lock.
        unsafe {
            let ctl = self.ctl();
            let _guard = (*ctl).lock.write();
            if (*ctl).pinned {
                return Err(DsaError::Misuse("dsa_area already pinned".to_owned()));
            }
            (*ctl).pinned = true;
            (*ctl).refcnt += 1;
        }
        Ok(())
    }

    pub fn unpin(&self) -> Result<(), DsaError> {
        // SAFETY: control fields are protected by the area lock.
        unsafe {
            let ctl = self.ctl();
            let _guard = (*ctl).lock.write();
            if !(*ctl).pinned {
                return Err(DsaError::Misuse("dsa_area not pinned".to_owned()));
            }
            (*ctl).pinned = false;
            (*ctl).refcnt -= 1;
        }
        Ok(())
    }

    /// Hands every mapping of this area, current and future, to the `Dsm`
    /// session, so addresses stay valid after this handle is dropped.
    pub fn pin_mapping(&self) -> Result<(), DsaError> {
        let mut local = self.local.lock();
        if local.mapping_pinned {
            return Err(DsaError::Misuse("dsa_area mapping already pinned".to_owned()));
        }
        local.mapping_pinned = true;
        for mapped in local.segments.iter_mut().flatten() {
            if let Some(segment) = mapped.segment.take() {
                segment.pin_mapping(&self.dsm);
            }
        }
        Ok(())
    }

    /// Combined size of all segments of the area.
    pub fn total_size(&self) -> usize {
        // SAFETY: protected by the area lock.
        unsafe {
            let ctl = self.ctl();
            let _guard = (*ctl).lock.write();
            (*ctl).total_segment_size
        }
    }

    /// Caps the combined size of all segments. Segments already created
    /// stay even if the area is over the new limit.
    pub fn set_size_limit(&self, limit: usize) {
        // SAFETY: protected by the area lock.
        unsafe {
            let ctl = self.ctl();
            let _guard = (*ctl).lock.write();
            (*ctl).max_total_segment_size = limit;
        }
    }

    /// Number of segments this process currently has mapped.
    pub fn mapped_segments(&self) -> usize {
        self.addresses
            .iter()
            .filter(|a| !a.load(Ordering::Acquire).is_null())
            .count()
    }

    pub fn allocate(&self, size: usize) -> Result<DsaPointer, DsaError> {
        self.allocate_extended(size, AllocFlags::NONE)
    }

    pub fn allocate_zeroed(&self, size: usize) -> Result<DsaPointer, DsaError> {
        self.allocate_extended(size, AllocFlags::ZERO)
    }

    /// Allocates `size` bytes. Running out of memory is an error unless
    /// [`AllocFlags::NO_OOM`] is given, in which case [`DsaPointer::NULL`]
    /// is returned.
    pub fn allocate_extended(&self, size: usize, flags: AllocFlags) -> Result<DsaPointer, DsaError> {
        let limit = if flags.contains(AllocFlags::HUGE) {
            MAX_HUGE_ALLOC_SIZE
        } else {
            MAX_ALLOC_SIZE
        };
        if size == 0 || size > limit {
            return Err(DsaError::Misuse(format!(
                "invalid DSA memory alloc request size {size}"
            )));
        }
        self.check_for_freed_segments();

        let result = if size > MAX_SMALL_OBJECT_SIZE {
            self.allocate_large(size)?
        } else {
            self.alloc_object(size_to_class(size))?
        };
        if result.is_null() {
            if flags.contains(AllocFlags::NO_OOM) {
                return Ok(DsaPointer::NULL);
            }
            return Err(DsaError::OutOfMemory { requested: size });
        }
        if flags.contains(AllocFlags::ZERO) {
            // SAFETY: the allocation is at least `size` bytes.
            unsafe { self.get_address(result)?.write_bytes(0, size) };
        }
        Ok(result)
    }

    fn allocate_large(&self, size: usize) -> Result<DsaPointer, DsaError> {
        let npages = size.div_ceil(FPM_PAGE_SIZE);
        let span_pointer = self.alloc_object(SCLASS_BLOCK_OF_SPANS)?;
        if span_pointer.is_null() {
            return Ok(DsaPointer::NULL);
        }

        let Some((map, first_page)) = self.take_pages(npages)? else {
            self.free(span_pointer)?;
            return Ok(DsaPointer::NULL);
        };
        let start = DsaPointer::new(map.index, first_page * FPM_PAGE_SIZE);

        let pool = self.pool(SCLASS_SPAN_LARGE);
        // SAFETY: the span lists are protected by the pool lock, and the
        // page map entry belongs to pages nobody else owns yet.
        unsafe {
            let _guard = (*pool).lock.write();
            self.init_span(span_pointer, pool, start, npages, SCLASS_SPAN_LARGE)?;
            map.pagemap().add(first_page).write(span_pointer);
        }
        Ok(start)
    }

    /// Takes `npages` contiguous pages from some segment, creating one if
    /// needed, under the area lock.
    fn take_pages(&self, npages: usize) -> Result<Option<(SegmentMap, usize)>, DsaError> {
        // SAFETY: segment bins and free page managers are protected by the
        // area lock.
        unsafe {
            let _guard = (*self.ctl()).lock.write();
            let map = match self.get_best_segment(npages)? {
                Some(map) => map,
                None => match self.make_new_segment(npages)? {
                    Some(map) => map,
                    None => return Ok(None),
                },
            };
            match (*map.fpm()).get(npages) {
                Some(first_page) => Ok(Some((map, first_page))),
                None => Err(DsaError::Corrupted(format!(
                    "dsa_allocate could not find {npages} free pages"
                ))),
            }
        }
    }

    fn pool(&self, size_class: usize) -> *mut Pool {
        // SAFETY: in bounds of the control block.
        unsafe { ptr::addr_of_mut!((*self.ctl()).pools[size_class]) }
    }

    fn pool_pointer(&self, pool: *mut Pool) -> DsaPointer {
        DsaPointer::new(0, pool as usize - self.ctl() as usize)
    }

    fn span(&self, span_pointer: DsaPointer) -> Result<*mut Span, DsaError> {
        Ok(self.get_address(span_pointer)?.cast())
    }

    /// Allocates one object of `size_class`, or returns null when no memory
    /// can be found.
    fn alloc_object(&self, size_class: usize) -> Result<DsaPointer, DsaError> {
        let pool = self.pool(size_class);
        loop {
            // SAFETY: span lists are protected by the pool lock.
            unsafe {
                let _guard = (*pool).lock.write();
                if (*pool).spans[1].is_null() {
                    self.activate_existing_span(pool, size_class)?;
                }
                if !(*pool).spans[1].is_null() {
                    return self.pop_object(pool, size_class);
                }
            }

            // Every span is full: grow with the pool lock released, then
            // retry with whatever is active by then.
            let Some((span_pointer, map, first_page, npages)) = self.new_superblock(size_class)?
            else {
                return Ok(DsaPointer::NULL);
            };
            let start = DsaPointer::new(map.index, first_page * FPM_PAGE_SIZE);
            // SAFETY: as above; the pages and their page map entries are ours.
            unsafe {
                let _guard = (*pool).lock.write();
                self.init_span(span_pointer, pool, start, npages, size_class)?;
                for page in first_page..first_page + npages {
                    map.pagemap().add(page).write(span_pointer);
                }
            }
        }
    }

    /// Pages and a span descriptor for a new superblock. Must be called with
    /// no pool lock held.
    #[allow(clippy::type_complexity)]
    fn new_superblock(
        &self,
        size_class: usize,
    ) -> Result<Option<(DsaPointer, SegmentMap, usize, usize)>, DsaError> {
        // A block of spans describes itself, anything else needs a span
        // object from that pool.
        let (span_pointer, npages) = if size_class == SCLASS_BLOCK_OF_SPANS {
            (DsaPointer::NULL, 1)
        } else {
            let span_pointer = self.alloc_object(SCLASS_BLOCK_OF_SPANS)?;
            if span_pointer.is_null() {
                return Ok(None);
            }
            (span_pointer, PAGES_PER_SUPERBLOCK)
        };
        let Some((map, first_page)) = self.take_pages(npages)? else {
            if !span_pointer.is_null() {
                self.free(span_pointer)?;
            }
            return Ok(None);
        };
        let span_pointer = if size_class == SCLASS_BLOCK_OF_SPANS {
            DsaPointer::new(map.index, first_page * FPM_PAGE_SIZE)
        } else {
            span_pointer
        };
        Ok(Some((span_pointer, map, first_page, npages)))
    }

    /// Pushes a new span at the head of fullness class 1 of `pool`.
    ///
    /// # Safety
    /// The pool lock must be held.
    unsafe fn init_span(
        &self,
        span_pointer: DsaPointer,
        pool: *mut Pool,
        start: DsaPointer,
        npages: usize,
        size_class: usize,
    ) -> Result<(), DsaError> {
        let span = self.span(span_pointer)?;
        let head = (*pool).spans[1];
        if !head.is_null() {
            (*self.span(head)?).prevspan = span_pointer;
        }
        let (ninitialized, nallocatable) = match size_class {
            // Slot 0 of a block of spans is its own descriptor.
            SCLASS_BLOCK_OF_SPANS => (1, objects_per_superblock(size_class)),
            SCLASS_SPAN_LARGE => (0, 0),
            _ => (0, objects_per_superblock(size_class)),
        };
        span.write(Span {
            pool: self.pool_pointer(pool),
            prevspan: DsaPointer::NULL,
            nextspan: head,
            start,
            npages,
            size_class: size_class as u16,
            ninitialized,
            nallocatable: nallocatable as u16,
            firstfree: SPAN_NOTHING_FREE,
            nmax: nallocatable as u16,
            fclass: 1,
        });
        (*pool).spans[1] = span_pointer;
        Ok(())
    }

    /// # Safety
    /// The pool lock must be held and fullness class 1 must be non-empty.
    unsafe fn pop_object(&self, pool: *mut Pool, size_class: usize) -> Result<DsaPointer, DsaError> {
        let span = self.span((*pool).spans[1])?;
        if (*span).nallocatable == 0 {
            return Err(DsaError::Corrupted(format!(
                "active span of size class {size_class} has no free objects"
            )));
        }
        let size = class_size(size_class);
        let result = if (*span).firstfree != SPAN_NOTHING_FREE {
            let result = (*span).start.add((*span).firstfree as usize * size);
            (*span).firstfree = self.get_address(result)?.cast::<u16>().read();
            result
        } else {
            let result = (*span).start.add((*span).ninitialized as usize * size);
            (*span).ninitialized += 1;
            result
        };
        (*span).nallocatable -= 1;
        if (*span).nallocatable == 0 {
            self.transfer_first_span(pool, 1, FULLNESS_CLASSES - 1)?;
        }
        Ok(result)
    }

    /// Tries to find a span with free objects for fullness class 1, first by
    /// moving spans whose utilization dropped, then by taking any span with
    /// room. Returns whether one was found.
    ///
    /// # Safety
    /// The pool lock must be held.
    unsafe fn activate_existing_span(
        &self,
        pool: *mut Pool,
        size_class: usize,
    ) -> Result<bool, DsaError> {
        let nmax = objects_per_superblock(size_class);
        for fclass in 2..FULLNESS_CLASSES - 1 {
            let mut span_pointer = (*pool).spans[fclass];
            while !span_pointer.is_null() {
                let span = self.span(span_pointer)?;
                let next_span_pointer = (*span).nextspan;
                let target =
                    (nmax - (*span).nallocatable as usize) * (FULLNESS_CLASSES - 1) / nmax;
                if target < fclass {
                    self.unlink_span(span)?;
                    self.add_span_to_fullness_class(span, span_pointer, target)?;
                }
                span_pointer = next_span_pointer;
            }
            if !(*pool).spans[1].is_null() {
                return Ok(true);
            }
        }

        // Nothing belongs in class 1; take anything that is not full, the
        // nearly empty spans last.
        for fclass in 2..FULLNESS_CLASSES - 1 {
            if self.transfer_first_span(pool, fclass, 1)? {
                return Ok(true);
            }
        }
        self.transfer_first_span(pool, 0, 1)
    }

    /// # Safety
    /// The pool lock must be held.
    unsafe fn transfer_first_span(
        &self,
        pool: *mut Pool,
        from: usize,
        to: usize,
    ) -> Result<bool, DsaError> {
        let span_pointer = (*pool).spans[from];
        if span_pointer.is_null() {
            return Ok(false);
        }
        let span = self.span(span_pointer)?;
        (*pool).spans[from] = (*span).nextspan;
        if !(*span).nextspan.is_null() {
            (*self.span((*span).nextspan)?).prevspan = DsaPointer::NULL;
        }
        (*span).nextspan = (*pool).spans[to];
        (*pool).spans[to] = span_pointer;
        if !(*span).nextspan.is_null() {
            (*self.span((*span).nextspan)?).prevspan = span_pointer;
        }
        (*span).fclass = to as u16;
        Ok(true)
    }

    /// # Safety
    /// The lock of the span's pool must be held.
    unsafe fn unlink_span(&self, span: *mut Span) -> Result<(), DsaError> {
        if !(*span).nextspan.is_null() {
            (*self.span((*span).nextspan)?).prevspan = (*span).prevspan;
        }
        if !(*span).prevspan.is_null() {
            (*self.span((*span).prevspan)?).nextspan = (*span).nextspan;
        } else {
            let pool = self.get_address((*span).pool)?.cast::<Pool>();
            (*pool).spans[(*span).fclass as usize] = (*span).nextspan;
        }
        Ok(())
    }

    /// # Safety
    /// The lock of the span's pool must be held.
    unsafe fn add_span_to_fullness_class(
        &self,
        span: *mut Span,
        span_pointer: DsaPointer,
        fclass: usize,
    ) -> Result<(), DsaError> {
        let pool = self.get_address((*span).pool)?.cast::<Pool>();
        let head = (*pool).spans[fclass];
        if !head.is_null() {
            (*self.span(head)?).prevspan = span_pointer;
        }
        (*span).prevspan = DsaPointer::NULL;
        (*span).nextspan = head;
        (*pool).spans[fclass] = span_pointer;
        (*span).fclass = fclass as u16;
        Ok(())
    }

    /// Frees memory obtained from [`DsaArea::allocate`].
    pub fn free(&self, dp: DsaPointer) -> Result<(), DsaError> {
        if dp.is_null() {
            return Err(DsaError::Misuse("cannot free a null dsa pointer".to_owned()));
        }
        self.check_for_freed_segments();

        let map = self.segment_map(dp.segment_index())?;
        // SAFETY: dp is a live allocation, so its segment is mapped and its
        // page map entry names the owning span.
        unsafe {
            if dp.segment_offset() >= (*map.header()).size {
                return Err(DsaError::Corrupted(format!(
                    "{dp:?} is outside of its segment"
                )));
            }
            let span_pointer = map.pagemap().add(dp.segment_offset() / FPM_PAGE_SIZE).read();
            if span_pointer.is_null() {
                return Err(DsaError::Corrupted(format!(
                    "{dp:?} does not point into an allocated span"
                )));
            }
            let span = self.span(span_pointer)?;
            let size_class = (*span).size_class as usize;

            if size_class == SCLASS_SPAN_LARGE {
                let first_page = (*span).start.segment_offset() / FPM_PAGE_SIZE;
                let npages = (*span).npages;
                {
                    let _guard = (*self.ctl()).lock.write();
                    (*map.fpm()).put(first_page, npages)?;
                    self.rebin_segment(map)?;
                }
                {
                    let _guard = (*self.pool(SCLASS_SPAN_LARGE)).lock.write();
                    self.unlink_span(span)?;
                }
                return self.free(span_pointer);
            }

            let pool = self.pool(size_class);
            let destroy = {
                let _guard = (*pool).lock.write();
                let size = class_size(size_class);
                let superblock = self.get_address((*span).start)? as usize;
                let object = self.get_address(dp)?;
                let offset = (object as usize).wrapping_sub(superblock);
                if offset >= SUPERBLOCK_SIZE || offset % size != 0 {
                    return Err(DsaError::Corrupted(format!(
                        "{dp:?} is not an object of size class {size_class}"
                    )));
                }
                object.cast::<u16>().write((*span).firstfree);
                (*span).firstfree = (offset / size) as u16;
                (*span).nallocatable += 1;

                if (*span).nallocatable == 1 && (*span).fclass as usize == FULLNESS_CLASSES - 1 {
                    // Full spans are never searched; make it findable again.
                    self.unlink_span(span)?;
                    self.add_span_to_fullness_class(span, span_pointer, FULLNESS_CLASSES - 2)?;
                    false
                } else if (*span).nallocatable == (*span).nmax
                    && ((*span).fclass != 1 || !(*span).prevspan.is_null())
                {
                    // Empty and not the active span: give the pages back.
                    self.unlink_span(span)?;
                    true
                } else {
                    false
                }
            };
            if destroy {
                self.destroy_superblock(span_pointer)?;
            }
        }
        Ok(())
    }

    /// Returns the pages of an unlinked, empty superblock, freeing its
    /// segment if that leaves the segment empty. Must be called with no pool
    /// lock held.
    fn destroy_superblock(&self, span_pointer: DsaPointer) -> Result<(), DsaError> {
        // SAFETY: the span is unlinked, nobody else can reach it.
        let (size_class, start, npages) = unsafe {
            let span = self.span(span_pointer)?;
            ((*span).size_class as usize, (*span).start, (*span).npages)
        };

        // SAFETY: segment bins, free page managers and segment slots are
        // protected by the area lock.
        unsafe {
            let ctl = self.ctl();
            let _guard = (*ctl).lock.write();
            let map = self.segment_map(start.segment_index())?;
            let fpm = map.fpm();
            (*fpm).put(start.segment_offset() / FPM_PAGE_SIZE, npages)?;

            let header = map.header();
            if map.index != 0 && (*fpm).largest() == (*header).usable_pages {
                self.unlink_segment(map)?;
                (*header).freed.store(true, Ordering::Release);
                (*ctl).total_segment_size -= (*header).size;
                let handle = DsmHandle::from_u32(
                    (*ctl).segment_handles[map.index].swap(0, Ordering::AcqRel),
                );
                (*ctl)
                    .freed_segment_counter
                    .fetch_add(1, Ordering::Release);
                tracing::debug!(
                    area = (*ctl).handle,
                    index = map.index,
                    %handle,
                    size = (*header).size,
                    "freeing dynamic shared memory area segment"
                );
                self.forget_segment(map.index);
                if let Err(err) = self.dsm.unpin_segment(handle) {
                    tracing::warn!(%handle, %err, "could not unpin freed dynamic shared memory area segment");
                }
            } else {
                self.rebin_segment(map)?;
            }
        }

        // A block of spans held its own descriptor; other spans live in a
        // block of spans and go back there.
        if size_class != SCLASS_BLOCK_OF_SPANS {
            self.free(span_pointer)?;
        }
        Ok(())
    }

    /// Local address of `dp`, or null for [`DsaPointer::NULL`]. The address
    /// stays valid until the allocation is freed or this handle is dropped.
    pub fn get_address(&self, dp: DsaPointer) -> Result<*mut u8, DsaError> {
        if dp.is_null() {
            return Ok(ptr::null_mut());
        }
        self.check_for_freed_segments();
        let map = self.segment_map(dp.segment_index())?;
        Ok(map.base.wrapping_add(dp.segment_offset()))
    }

    /// Maps segment `index` if this process has not done so yet.
    fn segment_map(&self, index: usize) -> Result<SegmentMap, DsaError> {
        if index >= DSA_MAX_SEGMENTS {
            return Err(DsaError::Corrupted(format!(
                "segment index {index} out of range"
            )));
        }
        let base = self.addresses[index].load(Ordering::Acquire);
        if !base.is_null() {
            return Ok(SegmentMap { index, base });
        }
        self.map_segment(index)
    }

    fn map_segment(&self, index: usize) -> Result<SegmentMap, DsaError> {
        let mut local = self.local.lock();
        let base = self.addresses[index].load(Ordering::Acquire);
        if !base.is_null() {
            return Ok(SegmentMap { index, base });
        }

        // SAFETY: the handle slot is atomic; a live pointer into the slot
        // guarantees it is not being changed.
        let ctl = self.ctl();
        let handle =
            DsmHandle::from_u32(unsafe { (*ctl).segment_handles[index].load(Ordering::Acquire) });
        if !handle.is_valid() {
            return Err(DsaError::Misuse(
                "dsa_area could not attach to a segment that has been freed".to_owned(),
            ));
        }
        let mut mapping = map_handle(&self.dsm, handle)?;
        let base = mapping.address.as_ptr();
        let map = SegmentMap { index, base };
        // SAFETY: every area segment starts with a header.
        unsafe {
            let expected = SEGMENT_HEADER_MAGIC ^ (*ctl).handle ^ index as u32;
            if mapping.size < HEADER_SIZE || (*map.header()).magic != expected {
                return Err(DsaError::Corrupted(format!(
                    "segment {handle} is not segment {index} of this area"
                )));
            }
        }
        if local.mapping_pinned {
            if let Some(segment) = mapping.segment.take() {
                segment.pin_mapping(&self.dsm);
            }
        }
        local.segments[index] = Some(MappedSegment {
            handle,
            segment: mapping.segment,
        });
        local.high_segment_index = local.high_segment_index.max(index);
        self.addresses[index].store(base, Ordering::Release);
        Ok(map)
    }

    /// Drops the local mapping of segment `index`.
    fn forget_segment(&self, index: usize) {
        let mut local = self.local.lock();
        self.forget_segment_locked(&mut local, index);
    }

    fn forget_segment_locked(&self, local: &mut LocalState, index: usize) {
        self.addresses[index].store(ptr::null_mut(), Ordering::Release);
        if let Some(mapped) = local.segments[index].take() {
            match mapped.segment {
                Some(segment) => drop(segment),
                None if mapped.handle.is_valid() => drop(self.dsm.unpin_mapping(mapped.handle)),
                None => {}
            }
        }
    }

    /// Unmaps segments other processes have freed since the last check, so
    /// that a pointer into a reused slot never resolves through a stale
    /// mapping.
    fn check_for_freed_segments(&self) {
        // SAFETY: the counter is atomic.
        let counter = unsafe { (*self.ctl()).freed_segment_counter.load(Ordering::Acquire) };
        if self.freed_segment_counter.load(Ordering::Acquire) == counter {
            return;
        }
        let mut local = self.local.lock();
        for index in 1..=local.high_segment_index {
            let base = self.addresses[index].load(Ordering::Acquire);
            if base.is_null() {
                continue;
            }
            let map = SegmentMap { index, base };
            // SAFETY: the segment stays mapped until we drop it below.
            if unsafe { (*map.header()).freed.load(Ordering::Acquire) } {
                self.forget_segment_locked(&mut local, index);
            }
        }
        self.freed_segment_counter.store(counter, Ordering::Release);
    }

    /// # Safety
    /// The area lock must be held.
    unsafe fn get_best_segment(&self, npages: usize) -> Result<Option<SegmentMap>, DsaError> {
        self.check_for_freed_segments();
        let ctl = self.ctl();
        for bin in segment_bin(npages)..NUM_SEGMENT_BINS {
            // Segments in this bin should have at least this many
            // contiguous pages; re-bin those that no longer do.
            let threshold = 1usize << (bin - 1);
            let mut index = (*ctl).segment_bins[bin];
            while index != SEGMENT_INDEX_NONE {
                let map = self.segment_map(index)?;
                let next = (*map.header()).next;
                let contiguous_pages = (*map.fpm()).largest();

                if contiguous_pages >= threshold && contiguous_pages < npages {
                    index = next;
                    continue;
                }
                if contiguous_pages < threshold {
                    self.rebin_segment(map)?;
                }
                if contiguous_pages >= npages {
                    return Ok(Some(map));
                }
                index = next;
            }
        }
        Ok(None)
    }

    /// Creates a segment with at least `requested_pages` usable pages.
    /// Returns `None` when a size limit or the segment count forbids it.
    ///
    /// # Safety
    /// The area lock must be held.
    unsafe fn make_new_segment(
        &self,
        requested_pages: usize,
    ) -> Result<Option<SegmentMap>, DsaError> {
        let ctl = self.ctl();
        let Some(new_index) = (1..DSA_MAX_SEGMENTS)
            .find(|&i| (*ctl).segment_handles[i].load(Ordering::Acquire) == 0)
        else {
            return Ok(None);
        };
        if (*ctl).total_segment_size >= (*ctl).max_total_segment_size {
            return Ok(None);
        }
        let room = (*ctl).max_total_segment_size - (*ctl).total_segment_size;

        // Total size roughly doubles every NUM_SEGMENTS_AT_EACH_SIZE segments.
        let shift = (new_index / NUM_SEGMENTS_AT_EACH_SIZE) as u32;
        let init = (*ctl).init_segment_size;
        let mut total_size = if shift >= init.leading_zeros() {
            usize::MAX
        } else {
            init << shift
        };
        total_size = total_size.min((*ctl).max_segment_size).min(room);

        let total_pages = total_size / FPM_PAGE_SIZE;
        let mut metadata_bytes =
            page_align(HEADER_SIZE + FPM_SIZE + total_pages * size_of::<DsaPointer>());
        if total_size <= metadata_bytes {
            return Ok(None);
        }
        let mut usable_pages = (total_size - metadata_bytes) / FPM_PAGE_SIZE;

        if requested_pages > usable_pages {
            // An odd-sized segment, just big enough for the request.
            usable_pages = requested_pages;
            metadata_bytes = metadata_bytes_for(usable_pages);
            total_size = match usable_pages
                .checked_mul(FPM_PAGE_SIZE)
                .and_then(|bytes| bytes.checked_add(metadata_bytes))
            {
                Some(size) => size,
                None => return Ok(None),
            };
            if total_size > (*ctl).max_segment_size || total_size > room {
                return Ok(None);
            }
        }

        let segment = match self.dsm.create(total_size) {
            Ok(segment) => segment,
            Err(DsmError::OutOfMemory { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        segment.pin()?;
        let handle = segment.handle();
        let base = segment.address().as_ptr();
        let map = SegmentMap {
            index: new_index,
            base,
        };

        (*ctl).segment_handles[new_index].store(handle.as_u32(), Ordering::Release);
        (*ctl).high_segment_index = (*ctl).high_segment_index.max(new_index);
        (*ctl).total_segment_size += total_size;

        let fpm = map.fpm();
        FreePageManager::initialize(fpm, base);
        (*fpm).put(metadata_bytes / FPM_PAGE_SIZE, usable_pages)?;

        let bin = segment_bin(usable_pages);
        let next = (*ctl).segment_bins[bin];
        map.header().write(SegmentHeader {
            magic: SEGMENT_HEADER_MAGIC ^ (*ctl).handle ^ new_index as u32,
            freed: AtomicBool::new(false),
            usable_pages,
            size: total_size,
            prev: SEGMENT_INDEX_NONE,
            next,
            bin,
        });
        {
            let mut local = self.local.lock();
            let segment = if local.mapping_pinned {
                segment.pin_mapping(&self.dsm);
                None
            } else {
                Some(segment)
            };
            local.segments[new_index] = Some(MappedSegment { handle, segment });
            local.high_segment_index = local.high_segment_index.max(new_index);
            self.addresses[new_index].store(base, Ordering::Release);
        }
        (*ctl).segment_bins[bin] = new_index;
        if next != SEGMENT_INDEX_NONE {
            (*self.segment_map(next)?.header()).prev = new_index;
        }

        tracing::debug!(
            area = (*ctl).handle,
            index = new_index,
            %handle,
            size = total_size,
            usable_pages,
            total = (*ctl).total_segment_size,
            "grew dynamic shared memory area"
        );
        Ok(Some(map))
    }

    /// # Safety
    /// The area lock must be held.
    unsafe fn unlink_segment(&self, map: SegmentMap) -> Result<(), DsaError> {
        let ctl = self.ctl();
        let header = map.header();
        if (*header).prev != SEGMENT_INDEX_NONE {
            (*self.segment_map((*header).prev)?.header()).next = (*header).next;
        } else {
            (*ctl).segment_bins[(*header).bin] = (*header).next;
        }
        if (*header).next != SEGMENT_INDEX_NONE {
            (*self.segment_map((*header).next)?.header()).prev = (*header).prev;
        }
        Ok(())
    }

    /// Moves a segment to the bin matching its largest free run.
    ///
    /// # Safety
    /// The area lock must be held.
    unsafe fn rebin_segment(&self, map: SegmentMap) -> Result<(), DsaError> {
        let ctl = self.ctl();
        let header = map.header();
        let new_bin = segment_bin((*map.fpm()).largest());
        if (*header).bin == new_bin {
            return Ok(());
        }
        self.unlink_segment(map)?;
        let next = (*ctl).segment_bins[new_bin];
        (*header).prev = SEGMENT_INDEX_NONE;
        (*header).next = next;
        (*header).bin = new_bin;
        (*ctl).segment_bins[new_bin] = map.index;
        if next != SEGMENT_INDEX_NONE {
            (*self.segment_map(next)?.header()).prev = map.index;
        }
        Ok(())
    }

    /// Frees every completely empty superblock, hoping to give whole
    /// segments back to the system.
    pub fn trim(&self) -> Result<(), DsaError> {
        self.check_for_freed_segments();
        // Blocks of spans last, since trimming other pools frees spans.
        for size_class in (0..NUM_SIZE_CLASSES).rev() {
            if size_class == SCLASS_SPAN_LARGE {
                continue;
            }
            let pool = self.pool(size_class);
            let mut empty = Vec::new();
            // SAFETY: span lists are protected by the pool lock.
            unsafe {
                let _guard = (*pool).lock.write();
                // Empty spans of other classes were already destroyed when
                // their last object was freed.
                let mut span_pointer = (*pool).spans[1];
                while !span_pointer.is_null() {
                    let span = self.span(span_pointer)?;
                    let next = (*span).nextspan;
                    if (*span).nallocatable == (*span).nmax {
                        self.unlink_span(span)?;
                        empty.push(span_pointer);
                    }
                    span_pointer = next;
                }
            }
            for span_pointer in empty {
                self.destroy_superblock(span_pointer)?;
            }
        }
        Ok(())
    }

    /// Describes the segments, pools and spans of the area. The snapshot is
    /// not consistent, locks are taken one at a time.
    pub fn dump(&self) -> Result<String, DsaError> {
        self.check_for_freed_segments();
        let mut out = String::new();
        let ctl = self.ctl();
        // SAFETY: each part is read under the lock protecting it.
        unsafe {
            {
                let _guard = (*ctl).lock.write();
                let _ = writeln!(out, "dsa_area handle {:x}:", (*ctl).handle);
                let _ = writeln!(
                    out,
                    "  max_total_segment_size: {}",
                    (*ctl).max_total_segment_size
                );
                let _ = writeln!(out, "  total_segment_size: {}", (*ctl).total_segment_size);
                let _ = writeln!(out, "  refcnt: {}", (*ctl).refcnt);
                let _ = writeln!(out, "  pinned: {}", if (*ctl).pinned { 't' } else { 'f' });
                let _ = writeln!(out, "  segment bins:");
                for bin in 0..NUM_SEGMENT_BINS {
                    let mut index = (*ctl).segment_bins[bin];
                    if index == SEGMENT_INDEX_NONE {
                        continue;
                    }
                    if bin == 0 {
                        let _ = writeln!(out, "    segment bin {bin} (no contiguous free pages):");
                    } else {
                        let _ = writeln!(
                            out,
                            "    segment bin {bin} (at least {} contiguous pages free):",
                            1usize << (bin - 1)
                        );
                    }
                    while index != SEGMENT_INDEX_NONE {
                        let map = self.segment_map(index)?;
                        let _ = writeln!(
                            out,
                            "      segment index {index}, usable_pages = {}, contiguous_pages = {}, mapped at {:p}",
                            (*map.header()).usable_pages,
                            (*map.fpm()).largest(),
                            map.base
                        );
                        index = (*map.header()).next;
                    }
                }
            }

            let _ = writeln!(out, "  pools:");
            for size_class in 0..NUM_SIZE_CLASSES {
                let pool = self.pool(size_class);
                let _guard = (*pool).lock.write();
                if (*pool).spans.iter().all(|s| s.is_null()) {
                    continue;
                }
                match size_class {
                    SCLASS_BLOCK_OF_SPANS => {
                        let _ = writeln!(out, "    pool for blocks of span objects:");
                    }
                    SCLASS_SPAN_LARGE => {
                        let _ = writeln!(out, "    pool for large object spans:");
                    }
                    _ => {
                        let _ = writeln!(
                            out,
                            "    pool for size class {size_class} (object size {} bytes):",
                            class_size(size_class)
                        );
                    }
                }
                for fclass in 0..FULLNESS_CLASSES {
                    let mut span_pointer = (*pool).spans[fclass];
                    if span_pointer.is_null() {
                        let _ = writeln!(out, "      fullness class {fclass} is empty");
                        continue;
                    }
                    let _ = writeln!(out, "      fullness class {fclass}:");
                    while !span_pointer.is_null() {
                        let span = self.span(span_pointer)?;
                        let _ = writeln!(
                            out,
                            "        span descriptor at {span_pointer}, superblock at {}, pages = {}, objects free = {}/{}",
                            (*span).start,
                            (*span).npages,
                            (*span).nallocatable,
                            (*span).nmax
                        );
                        span_pointer = (*span).nextspan;
                    }
                }
            }
        }
        tracing::debug!(dump = %out, "dynamic shared memory area state");
        Ok(out)
    }
}

impl Drop for DsaArea {
    fn drop(&mut self) {
        if self.release_on_drop {
            let dsm = &self.dsm;
            // SAFETY: segment 0 stays mapped until `local` is dropped, after
            // this body.
            let released = unsafe { release_control(self.ctl(), |handle| dsm.unpin_segment(handle)) };
            if let Err(err) = released {
                tracing::warn!(%err, "could not release dynamic shared memory area");
            }
        }
        tracing::debug!(handle = %self.handle(), "detached from dynamic shared memory area");
    }
}

impl core::fmt::Debug for DsaArea {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DsaArea")
            .field("handle", &self.handle())
            .field("mapped_segments", &self.mapped_segments())
            .finish()
    }
}
