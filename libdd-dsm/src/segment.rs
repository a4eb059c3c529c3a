// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::DsmConfig;
use crate::mem_handle::{self, MappedMem, MMAP_DIRECTORY};
use crate::DsmError;
use core::fmt;
use core::mem::ManuallyDrop;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};
use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;

/// Bytes reserved at the start of every extent for [`ExtentHeader`].
pub const SEGMENT_HEADER_SIZE: usize = 64;

const EXTENT_MAGIC: u32 = 0x9a50_3d32;
const MAX_CREATE_ATTEMPTS: u32 = 64;

/// Name of a dynamic shared memory segment, valid in every process of the
/// installation. Zero is never a valid handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct DsmHandle(u32);

impl DsmHandle {
    pub const INVALID: DsmHandle = DsmHandle(0);

    pub const fn from_u32(raw: u32) -> Self {
        DsmHandle(raw)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for DsmHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Extent header (offset 0 of every extent)
// ---------------------------------------------------------------------------

#[repr(C)]
struct ExtentHeader {
    magic: AtomicU32,
    pinned: AtomicU32,
    /// Attached mappings, plus one while pinned.
    refcnt: AtomicU32,
    _reserved: u32,
    device: u64,
    inode: u64,
    size: u64,
}

const _: () = assert!(core::mem::size_of::<ExtentHeader>() <= SEGMENT_HEADER_SIZE);

fn header(mem: &MappedMem) -> &ExtentHeader {
    // SAFETY: every mapping is at least SEGMENT_HEADER_SIZE bytes (checked at
    // create and attach) and page aligned.
    unsafe { &*(mem.as_ptr() as *const ExtentHeader) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Installation {
    device: u64,
    inode: u64,
}

fn validate(mem: &MappedMem, handle: DsmHandle, id: Installation) -> Result<(), DsmError> {
    if mem.len() < SEGMENT_HEADER_SIZE {
        return Err(DsmError::Corrupted {
            handle,
            reason: "extent smaller than its header",
        });
    }
    let hdr = header(mem);
    if hdr.magic.load(Ordering::Acquire) != EXTENT_MAGIC {
        return Err(DsmError::Corrupted {
            handle,
            reason: "bad extent magic",
        });
    }
    if hdr.device != id.device || hdr.inode != id.inode {
        return Err(DsmError::Corrupted {
            handle,
            reason: "extent belongs to another installation",
        });
    }
    if hdr.size != mem.len() as u64 {
        return Err(DsmError::Corrupted {
            handle,
            reason: "extent size does not match its header",
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

struct SessionState {
    config: DsmConfig,
    installation: Installation,
    attached: Mutex<HashSet<DsmHandle>>,
}

struct DsmInner {
    state: Arc<SessionState>,
    pinned_mappings: Mutex<HashMap<DsmHandle, Segment>>,
}

/// A process's view of the dynamic shared memory subsystem.
///
/// Cloning is cheap and all clones share the same set of attachments. A
/// handle can be attached only once per session; separate sessions in one
/// process behave like separate processes, each getting its own mapping.
#[derive(Clone)]
pub struct Dsm {
    inner: Arc<DsmInner>,
}

/// Location of a mapping kept alive by the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PinnedMapping {
    pub handle: DsmHandle,
    pub address: NonNull<u8>,
    pub size: usize,
}

impl Dsm {
    pub fn new(config: DsmConfig) -> Result<Dsm, DsmError> {
        let meta = std::fs::metadata(&config.data_dir)?;
        let installation = Installation {
            device: meta.dev(),
            inode: meta.ino(),
        };
        if config.implementation == crate::DsmImpl::Mmap {
            std::fs::create_dir_all(config.data_dir.join(MMAP_DIRECTORY))?;
        }
        Ok(Dsm {
            inner: Arc::new(DsmInner {
                state: Arc::new(SessionState {
                    config,
                    installation,
                    attached: Mutex::new(HashSet::new()),
                }),
                pinned_mappings: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn from_env() -> Result<Dsm, DsmError> {
        Dsm::new(DsmConfig::from_env())
    }

    pub fn config(&self) -> &DsmConfig {
        &self.inner.state.config
    }

    /// Creates a segment with at least `size` usable bytes and attaches it.
    pub fn create(&self, size: usize) -> Result<Segment, DsmError> {
        let state = &self.inner.state;
        let total = mem_handle::page_aligned_size(size + SEGMENT_HEADER_SIZE);
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_CREATE_ATTEMPTS {
            let handle = DsmHandle(rng.gen_range(1..=u32::MAX));
            if state.attached.lock().contains(&handle) {
                continue;
            }
            let Some(mem) = mem_handle::create(&state.config, handle, total)? else {
                continue;
            };
            // SAFETY: freshly created, nobody else knows the handle yet.
            unsafe {
                let hdr = mem.as_ptr() as *mut ExtentHeader;
                hdr.write(ExtentHeader {
                    magic: AtomicU32::new(0),
                    pinned: AtomicU32::new(0),
                    refcnt: AtomicU32::new(1),
                    _reserved: 0,
                    device: state.installation.device,
                    inode: state.installation.inode,
                    size: total as u64,
                });
                (*hdr).magic.store(EXTENT_MAGIC, Ordering::Release);
            }
            state.attached.lock().insert(handle);
            tracing::debug!(%handle, size = total, "created dynamic shared memory segment");
            return Ok(Segment::new(handle, mem, state.clone()));
        }
        Err(DsmError::OutOfMemory {
            size,
            attempts: MAX_CREATE_ATTEMPTS,
        })
    }

    /// Maps an existing segment.
    pub fn attach(&self, handle: DsmHandle) -> Result<Segment, DsmError> {
        let state = &self.inner.state;
        if !handle.is_valid() {
            return Err(DsmError::NotFound(handle));
        }
        if state.attached.lock().contains(&handle) {
            return Err(DsmError::Misuse(format!(
                "can't attach the same segment more than once: {handle}"
            )));
        }
        let mem = mem_handle::open(&state.config, handle)?;
        validate(&mem, handle, state.installation)?;
        let refcnt = &header(&mem).refcnt;
        let mut current = refcnt.load(Ordering::Relaxed);
        loop {
            // A zero count means the last holder is destroying it.
            if current == 0 {
                return Err(DsmError::NotFound(handle));
            }
            match refcnt.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        {
            let mut attached = state.attached.lock();
            if !attached.insert(handle) {
                drop(attached);
                release_reference(state, handle, &mem);
                return Err(DsmError::Misuse(format!(
                    "can't attach the same segment more than once: {handle}"
                )));
            }
        }
        tracing::debug!(%handle, size = mem.len(), "attached dynamic shared memory segment");
        Ok(Segment::new(handle, mem, state.clone()))
    }

    /// Reports whether any process still holds a reference to the segment.
    pub fn is_attached(&self, handle: DsmHandle) -> Result<bool, DsmError> {
        let state = &self.inner.state;
        match mem_handle::open(&state.config, handle) {
            Ok(mem) => {
                validate(&mem, handle, state.installation)?;
                Ok(header(&mem).refcnt.load(Ordering::Acquire) > 0)
            }
            Err(DsmError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Drops the reference a previous [`Segment::pin`] took. The segment is
    /// destroyed if nothing else is attached.
    pub fn unpin_segment(&self, handle: DsmHandle) -> Result<(), DsmError> {
        unpin(&self.inner.state, handle)
    }

    /// Returns the mapping previously kept alive with [`Segment::pin_mapping`],
    /// handing scoped ownership back to the caller.
    pub fn unpin_mapping(&self, handle: DsmHandle) -> Option<Segment> {
        self.inner.pinned_mappings.lock().remove(&handle)
    }

    pub fn pinned_mapping(&self, handle: DsmHandle) -> Option<PinnedMapping> {
        self.inner
            .pinned_mappings
            .lock()
            .get(&handle)
            .map(Segment::as_pinned_mapping)
    }

    fn keep_alive(&self, segment: Segment) -> PinnedMapping {
        let mapping = segment.as_pinned_mapping();
        self.inner
            .pinned_mappings
            .lock()
            .insert(segment.handle, segment);
        mapping
    }
}

impl fmt::Debug for Dsm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dsm")
            .field("config", &self.inner.state.config)
            .field("attached", &self.inner.state.attached.lock().len())
            .finish()
    }
}

fn release_reference(state: &SessionState, handle: DsmHandle, mem: &MappedMem) {
    if header(mem).refcnt.fetch_sub(1, Ordering::AcqRel) == 1 {
        header(mem).magic.store(0, Ordering::Release);
        match mem_handle::destroy(&state.config, handle) {
            Ok(()) => tracing::debug!(%handle, "destroyed dynamic shared memory segment"),
            Err(err) => {
                tracing::warn!(%handle, %err, "could not remove dynamic shared memory segment")
            }
        }
    }
}

fn unpin(state: &SessionState, handle: DsmHandle) -> Result<(), DsmError> {
    let mem = match mem_handle::open(&state.config, handle) {
        Ok(mem) => mem,
        Err(DsmError::NotFound(_)) => {
            return Err(DsmError::Misuse(format!(
                "cannot unpin unknown segment handle {handle}"
            )))
        }
        Err(err) => return Err(err),
    };
    validate(&mem, handle, state.installation)?;
    if header(&mem)
        .pinned
        .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(DsmError::Misuse(format!(
            "cannot unpin a segment that is not pinned: {handle}"
        )));
    }
    tracing::debug!(%handle, "unpinned dynamic shared memory segment");
    release_reference(state, handle, &mem);
    Ok(())
}

// ---------------------------------------------------------------------------
// Segment
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DetachCallbackId(u64);

type DetachCallback = Box<dyn FnOnce(&Segment) + Send>;

/// A local mapping of a dynamic shared memory segment. Dropping it runs the
/// registered on-detach callbacks, unmaps the extent and releases this
/// mapping's reference.
pub struct Segment {
    handle: DsmHandle,
    mem: ManuallyDrop<MappedMem>,
    state: Arc<SessionState>,
    callbacks: Vec<(DetachCallbackId, DetachCallback)>,
    next_callback: u64,
}

impl Segment {
    fn new(handle: DsmHandle, mem: MappedMem, state: Arc<SessionState>) -> Segment {
        Segment {
            handle,
            mem: ManuallyDrop::new(mem),
            state,
            callbacks: Vec::new(),
            next_callback: 0,
        }
    }

    pub fn handle(&self) -> DsmHandle {
        self.handle
    }

    fn mem(&self) -> &MappedMem {
        &self.mem
    }

    /// Start of the usable part of the extent, past the extent header.
    pub fn address(&self) -> NonNull<u8> {
        // SAFETY: the mapping is larger than the header and non-null.
        unsafe { NonNull::new_unchecked(self.mem().as_ptr().add(SEGMENT_HEADER_SIZE)) }
    }

    /// Usable bytes starting at [`Segment::address`].
    pub fn size(&self) -> usize {
        self.mem().len() - SEGMENT_HEADER_SIZE
    }

    /// Keeps the extent alive even when no mapping exists, until
    /// [`Dsm::unpin_segment`].
    pub fn pin(&self) -> Result<(), DsmError> {
        let hdr = header(self.mem());
        if hdr
            .pinned
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DsmError::Misuse(format!(
                "cannot pin a segment that is already pinned: {}",
                self.handle
            )));
        }
        hdr.refcnt.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(handle = %self.handle, "pinned dynamic shared memory segment");
        Ok(())
    }

    pub fn is_pinned(&self) -> bool {
        header(self.mem()).pinned.load(Ordering::Acquire) != 0
    }

    /// Turns this scoped mapping into a session-lifetime one. The mapping
    /// stays valid until [`Dsm::unpin_mapping`] or until the last clone of
    /// `dsm` is dropped.
    pub fn pin_mapping(self, dsm: &Dsm) -> PinnedMapping {
        dsm.keep_alive(self)
    }

    fn as_pinned_mapping(&self) -> PinnedMapping {
        PinnedMapping {
            handle: self.handle,
            address: self.address(),
            size: self.size(),
        }
    }

    /// Registers a callback run when this mapping is detached. Callbacks run
    /// in reverse registration order.
    pub fn on_detach<F>(&mut self, callback: F) -> DetachCallbackId
    where
        F: FnOnce(&Segment) + Send + 'static,
    {
        let id = DetachCallbackId(self.next_callback);
        self.next_callback += 1;
        self.callbacks.push((id, Box::new(callback)));
        id
    }

    /// Same as [`Dsm::unpin_segment`] for the session this mapping belongs
    /// to. On-detach callbacks only see the segment, not the session.
    pub fn unpin_segment(&self, handle: DsmHandle) -> Result<(), DsmError> {
        unpin(&self.state, handle)
    }

    pub fn cancel_on_detach(&mut self, id: DetachCallbackId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(cb, _)| *cb != id);
        before != self.callbacks.len()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        while let Some((_, callback)) = self.callbacks.pop() {
            callback(self);
        }
        // SAFETY: the mapping is never touched again after this point.
        let mem = unsafe { ManuallyDrop::take(&mut self.mem) };
        self.state.attached.lock().remove(&self.handle);
        tracing::debug!(handle = %self.handle, "detached dynamic shared memory segment");
        release_reference(&self.state, self.handle, &mem);
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("handle", &self.handle)
            .field("address", &self.address())
            .field("size", &self.size())
            .finish()
    }
}
