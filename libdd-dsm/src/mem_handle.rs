// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OS backing objects for segments and their shared mappings.

use crate::config::{DsmConfig, DsmImpl};
use crate::{DsmError, DsmHandle};
use hashbrown::HashMap;
use libc::off_t;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use parking_lot::Mutex;
use std::ffi::c_void;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

pub(crate) const MMAP_DIRECTORY: &str = "dd_dynshmem";

/// A shared, read-write mapping of a whole backing object. Unmapped on drop.
pub(crate) struct MappedMem {
    ptr: NonNull<c_void>,
    len: usize,
}

// SAFETY: the mapping is plain shared memory; all access to its contents goes
// through raw pointers whose synchronization is the caller's business.
unsafe impl Send for MappedMem {}
unsafe impl Sync for MappedMem {}

impl MappedMem {
    fn map<F: AsFd>(fd: F, len: usize) -> io::Result<MappedMem> {
        let length = NonZeroUsize::new(len)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty segment"))?;
        // SAFETY: mapping a fresh shared region; no existing Rust object is
        // aliased by the returned pointer.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )?
        };
        Ok(MappedMem { ptr, len })
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MappedMem {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe a mapping created by `map`.
        if let Err(err) = unsafe { munmap(self.ptr, self.len) } {
            tracing::warn!(%err, "failed to unmap dynamic shared memory segment");
        }
    }
}

pub(crate) fn page_aligned_size(size: usize) -> usize {
    let page_size = page_size::get();
    ((size.max(1) - 1) & !(page_size - 1)) + page_size
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

fn posix_name(handle: DsmHandle) -> String {
    format!("/libdd-dsm.{}", handle.as_u32())
}

fn mmap_path(config: &DsmConfig, handle: DsmHandle) -> PathBuf {
    config
        .data_dir
        .join(MMAP_DIRECTORY)
        .join(format!("mmap.{}", handle.as_u32()))
}

type AnonymousRegistry = Mutex<HashMap<DsmHandle, Arc<File>>>;

/// Anonymous segments have no name; attachments from this process find the
/// descriptor here.
fn anonymous_registry() -> &'static AnonymousRegistry {
    static REGISTRY: OnceLock<AnonymousRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

#[cfg(target_os = "linux")]
fn open_anonymous(handle: DsmHandle) -> io::Result<File> {
    let memfd = memfd::MemfdOptions::default()
        .create(format!("libdd-dsm-anon.{}", handle.as_u32()))
        .map_err(io::Error::other)?;
    Ok(memfd.into_file())
}

#[cfg(not(target_os = "linux"))]
fn open_anonymous(handle: DsmHandle) -> io::Result<File> {
    let path = format!(
        "/libdd-dsm-anon.{}.{}",
        nix::unistd::getpid(),
        handle.as_u32()
    );
    let fd = shm_open(
        path.as_str(),
        OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
        Mode::S_IRUSR | Mode::S_IWUSR,
    )?;
    _ = shm_unlink(path.as_str());
    Ok(File::from(fd))
}

/// Creates and maps a new backing object. `Ok(None)` means the handle is
/// already taken and the caller should pick another one.
pub(crate) fn create(
    config: &DsmConfig,
    handle: DsmHandle,
    size: usize,
) -> Result<Option<MappedMem>, DsmError> {
    match config.implementation {
        DsmImpl::Posix => {
            let name = posix_name(handle);
            let fd = match shm_open(
                name.as_str(),
                OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
                Mode::S_IRUSR | Mode::S_IWUSR,
            ) {
                Ok(fd) => fd,
                Err(Errno::EEXIST) => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            let mapped = ftruncate(&fd, size as off_t)
                .map_err(io::Error::from)
                .and_then(|_| MappedMem::map(&fd, size));
            match mapped {
                Ok(mem) => Ok(Some(mem)),
                Err(err) => {
                    _ = shm_unlink(name.as_str());
                    Err(err.into())
                }
            }
        }
        DsmImpl::Mmap => {
            let path = mmap_path(config, handle);
            let file = match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
                Err(err) => return Err(err.into()),
            };
            let mapped = file
                .set_len(size as u64)
                .and_then(|_| MappedMem::map(&file, size));
            match mapped {
                Ok(mem) => Ok(Some(mem)),
                Err(err) => {
                    _ = fs::remove_file(&path);
                    Err(err.into())
                }
            }
        }
        DsmImpl::Anonymous => {
            let mut registry = anonymous_registry().lock();
            if registry.contains_key(&handle) {
                return Ok(None);
            }
            let file = open_anonymous(handle)?;
            file.set_len(size as u64)?;
            let mem = MappedMem::map(&file, size)?;
            registry.insert(handle, Arc::new(file));
            Ok(Some(mem))
        }
    }
}

/// Maps an existing backing object in its entirety.
pub(crate) fn open(config: &DsmConfig, handle: DsmHandle) -> Result<MappedMem, DsmError> {
    let file = match config.implementation {
        DsmImpl::Posix => {
            match shm_open(posix_name(handle).as_str(), OFlag::O_RDWR, Mode::empty()) {
                Ok(fd) => File::from(fd),
                Err(Errno::ENOENT) => return Err(DsmError::NotFound(handle)),
                Err(err) => return Err(err.into()),
            }
        }
        DsmImpl::Mmap => match OpenOptions::new()
            .read(true)
            .write(true)
            .open(mmap_path(config, handle))
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(DsmError::NotFound(handle))
            }
            Err(err) => return Err(err.into()),
        },
        DsmImpl::Anonymous => {
            let registry = anonymous_registry().lock();
            let Some(file) = registry.get(&handle) else {
                return Err(DsmError::NotFound(handle));
            };
            file.try_clone()?
        }
    };
    let len = file.metadata()?.len() as usize;
    if len == 0 {
        return Err(DsmError::NotFound(handle));
    }
    Ok(MappedMem::map(&file, len)?)
}

/// Removes the backing object. Existing mappings stay valid until unmapped.
pub(crate) fn destroy(config: &DsmConfig, handle: DsmHandle) -> Result<(), DsmError> {
    match config.implementation {
        DsmImpl::Posix => shm_unlink(posix_name(handle).as_str())?,
        DsmImpl::Mmap => fs::remove_file(mmap_path(config, handle))?,
        DsmImpl::Anonymous => {
            anonymous_registry().lock().remove(&handle);
        }
    }
    Ok(())
}
