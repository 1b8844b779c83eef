// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Memory regions shared between a coordinator and its workers.
//!
//! A [`Memory`] hands out typed regions. The heap implementation is visible
//! within one process only, while the shared-memory implementation is backed
//! by a named POSIX shared memory object that forked processes can attach to.
//! Regions are released when dropped; the owner of a named region also
//! unlinks its name.

use crate::error::SieveError;
use crate::macros::{log_debug, log_error};
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};

/// Whether a handle creates (and later destroys) a region or attaches to an
/// existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Creates the region and destroys it on release.
    Owner,
    /// Attaches to a region created by the owner. Attached views are
    /// read-only.
    Attached,
}

/// Types whose all-zero bit pattern is a valid value equal to
/// [`Default::default()`].
///
/// # Safety
///
/// Implementers must guarantee that a zero-filled, suitably aligned memory
/// region is a valid `[Self]` and that `Self` has no drop glue.
pub unsafe trait Zeroable: Default {}

// SAFETY: `false` is represented by a zero byte.
unsafe impl Zeroable for bool {}
// SAFETY: plain integers are valid for any bit pattern.
unsafe impl Zeroable for u64 {}
// SAFETY: plain integers are valid for any bit pattern.
unsafe impl Zeroable for usize {}
// SAFETY: atomics have the same representation as their underlying integer.
unsafe impl Zeroable for AtomicBool {}
// SAFETY: atomics have the same representation as their underlying integer.
unsafe impl Zeroable for AtomicU64 {}
// SAFETY: atomics have the same representation as their underlying integer.
unsafe impl Zeroable for AtomicUsize {}

/// A capability to allocate zero-initialized regions of `T`.
pub trait Memory {
    /// Handle to an allocated region. Dropping it releases the region.
    type Region<T: Zeroable>: Deref<Target = [T]>;

    /// Allocates (as [`Role::Owner`]) or attaches to (as [`Role::Attached`])
    /// a region of `len` values.
    fn allocate<T: Zeroable>(&self, role: Role, len: usize)
        -> Result<Self::Region<T>, SieveError>;
}

/// Memory private to the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapMemory;

/// A region on the heap. Unlike shared regions it is mutable, since its owner
/// is the only one to see it.
#[derive(Debug)]
pub struct HeapRegion<T> {
    values: Box<[T]>,
}

impl Memory for HeapMemory {
    type Region<T: Zeroable> = HeapRegion<T>;

    fn allocate<T: Zeroable>(&self, role: Role, len: usize) -> Result<HeapRegion<T>, SieveError> {
        if role == Role::Attached {
            return Err(SieveError::Memory("heap regions have no name to attach to"));
        }
        let mut values = Vec::new();
        values
            .try_reserve_exact(len)
            .map_err(|_| SieveError::Memory("heap region too large"))?;
        values.extend(std::iter::repeat_with(T::default).take(len));
        Ok(HeapRegion {
            values: values.into_boxed_slice(),
        })
    }
}

impl<T> Deref for HeapRegion<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.values
    }
}

impl<T> DerefMut for HeapRegion<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.values
    }
}

/// Named POSIX shared memory, visible across processes.
#[derive(Debug, Clone)]
pub struct SharedMemory {
    name: String,
}

impl SharedMemory {
    /// Creates a handle for the shared memory object of the given name, which
    /// must start with a `/` and contain no other slash.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Name of the underlying shared memory object.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A mapping of a named shared memory object.
#[derive(Debug)]
pub struct SharedRegion<T> {
    ptr: NonNull<T>,
    len: usize,
    role: Role,
    name: String,
}

impl Memory for SharedMemory {
    type Region<T: Zeroable> = SharedRegion<T>;

    fn allocate<T: Zeroable>(
        &self,
        role: Role,
        len: usize,
    ) -> Result<SharedRegion<T>, SieveError> {
        let size = len
            .checked_mul(std::mem::size_of::<T>())
            .and_then(NonZeroUsize::new)
            .ok_or(SieveError::Memory("invalid shared region size"))?;

        let (oflag, prot) = match role {
            Role::Owner => (
                OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            ),
            Role::Attached => (OFlag::O_RDONLY, ProtFlags::PROT_READ),
        };
        let fd = shm_open(self.name.as_str(), oflag, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(SieveError::ipc("shm_open"))?;

        // Unlinks the name again if anything below fails.
        let unlink_on_error = |e: SieveError| {
            if role == Role::Owner {
                let _ = shm_unlink(self.name.as_str());
            }
            e
        };

        if role == Role::Owner {
            let len = libc::off_t::try_from(size.get())
                .map_err(|_| unlink_on_error(SieveError::Memory("shared region too large")))?;
            ftruncate(&fd, len).map_err(|e| unlink_on_error(SieveError::ipc("ftruncate")(e)))?;
        }

        // SAFETY: a fresh mapping at an address chosen by the kernel doesn't alias
        // any existing Rust object.
        let ptr = unsafe { mmap(None, size, prot, MapFlags::MAP_SHARED, &fd, 0) }
            .map_err(|e| unlink_on_error(SieveError::ipc("mmap")(e)))?;
        log_debug!("Mapped {} bytes of {} as {role:?}", size, self.name);

        Ok(SharedRegion {
            ptr: ptr.cast(),
            len,
            role,
            name: self.name.clone(),
        })
    }
}

impl<T> Deref for SharedRegion<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY:
        // - The mapping is page-aligned, spans `len` values of `T` and stays valid
        //   until `self` is dropped.
        // - The owner truncated the object to its size, so it was zero-filled,
        //   which is a valid `[T]` as `T: Zeroable`.
        // - Only shared references are handed out, so other processes can only
        //   mutate it through the interior mutability of `T`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for SharedRegion<T> {
    fn drop(&mut self) {
        // SAFETY: `ptr` and the size are those returned by and passed to `mmap()`,
        // and no reference obtained via `deref()` outlives `self`.
        if let Err(_e) =
            unsafe { munmap(self.ptr.cast(), self.len * std::mem::size_of::<T>()) }
        {
            log_error!("Failed to unmap {}: {_e}", self.name);
        }
        if self.role == Role::Owner {
            match shm_unlink(self.name.as_str()) {
                Ok(()) => log_debug!("Unlinked {}", self.name),
                Err(_e) => log_error!("Failed to unlink {}: {_e}", self.name),
            }
        }
    }
}

// SAFETY: a `SharedRegion<T>` acts as a `Box<[T]>` that other processes can
// only access through `&[T]`.
unsafe impl<T: Send> Send for SharedRegion<T> {}
// SAFETY: `deref()` only hands out shared references.
unsafe impl<T: Sync> Sync for SharedRegion<T> {}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::Ordering;

    fn unique_name(tag: &str) -> String {
        format!("/parasieve-test-{}-{tag}", std::process::id())
    }

    #[test]
    fn test_heap_region_zeroed() {
        let mut region = HeapMemory.allocate::<bool>(Role::Owner, 16).unwrap();
        assert_eq!(region.len(), 16);
        assert!(region.iter().all(|flag| !flag));
        region[3] = true;
        assert_eq!(region.iter().filter(|flag| **flag).count(), 1);
    }

    #[test]
    fn test_heap_region_cannot_attach() {
        let result = HeapMemory.allocate::<usize>(Role::Attached, 1);
        assert!(matches!(result, Err(SieveError::Memory(_))));
    }

    #[test]
    fn test_heap_region_too_large() {
        let result = HeapMemory.allocate::<bool>(Role::Owner, usize::MAX);
        assert!(matches!(result, Err(SieveError::Memory(_))));
        let result = HeapMemory.allocate::<u64>(Role::Owner, usize::MAX / 4);
        assert!(matches!(result, Err(SieveError::Memory(_))));
    }

    #[test]
    fn test_shared_region_attach() {
        let memory = SharedMemory::new(unique_name("attach"));
        let owner = memory.allocate::<AtomicUsize>(Role::Owner, 2).unwrap();
        assert_eq!(owner[0].load(Ordering::SeqCst), 0);
        owner[1].store(42, Ordering::SeqCst);

        let attached = memory.allocate::<AtomicUsize>(Role::Attached, 2).unwrap();
        assert_eq!(attached[1].load(Ordering::SeqCst), 42);
        owner[1].store(43, Ordering::SeqCst);
        assert_eq!(attached[1].load(Ordering::SeqCst), 43);
    }

    #[test]
    fn test_shared_region_owner_unlinks() {
        let memory = SharedMemory::new(unique_name("unlink"));
        let owner = memory.allocate::<AtomicUsize>(Role::Owner, 1).unwrap();
        // The name is taken while the owner lives.
        assert!(memory.allocate::<AtomicUsize>(Role::Owner, 1).is_err());
        drop(owner);

        let result = memory.allocate::<AtomicUsize>(Role::Attached, 1);
        assert!(matches!(
            result,
            Err(SieveError::Ipc {
                op: "shm_open",
                source: nix::Error::ENOENT
            })
        ));
    }

    #[test]
    fn test_shared_region_empty() {
        let memory = SharedMemory::new(unique_name("empty"));
        let result = memory.allocate::<AtomicUsize>(Role::Owner, 0);
        assert!(matches!(result, Err(SieveError::Memory(_))));
    }
}
