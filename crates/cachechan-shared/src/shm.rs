//! POSIX shared memory transport for [`SharedRegion`]
//!
//! The receiver creates the object and sizes it; the sender opens it and
//! checks the size before mapping. Both end up with a `&SharedRegion` at
//! their own virtual address over the same physical page.

use crate::{ChannelError, SHARED_REGION_SIZE, SharedRegion};
use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::shm;
use std::ops::Deref;
use std::ptr::{NonNull, null_mut};
use std::time::Duration;

/// Read/write for user, group and other, like `0666`
fn shm_mode() -> Mode {
    Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP | Mode::ROTH | Mode::WOTH
}

/// A live `MAP_SHARED` mapping of one region
struct Mapping {
    ptr: NonNull<SharedRegion>,
}

impl Mapping {
    fn map(fd: &rustix::fd::OwnedFd, name: &str) -> Result<Self, ChannelError> {
        // SAFETY: fresh mapping of SHARED_REGION_SIZE bytes backed by a shm
        // object at least that large; nothing in this process aliases it yet.
        let ptr = unsafe {
            mmap(
                null_mut(),
                SHARED_REGION_SIZE,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )
        }
        .map_err(|e| ChannelError::resource(format!("mmap {name}"), e))?;

        // mmap never returns null on success, and pages are 64-byte aligned
        let ptr = NonNull::new(ptr as *mut SharedRegion)
            .ok_or_else(|| ChannelError::resource(format!("mmap {name}"), rustix::io::Errno::NOMEM))?;
        Ok(Self { ptr })
    }

    fn region(&self) -> &SharedRegion {
        // SAFETY: the mapping lives until Drop, SharedRegion is repr(C) with
        // only atomic fields, and all-zero bytes are a valid value.
        unsafe { self.ptr.as_ref() }
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.as_ptr().cast(), SHARED_REGION_SIZE);
        }
    }
}

/// Handle to shared memory (receiver side - creates the object)
pub struct RegionHost {
    mapping: Mapping,
    name: String,
}

// SAFETY: the mapping is process-wide and every field is accessed atomically
unsafe impl Send for RegionHost {}
unsafe impl Sync for RegionHost {}

impl RegionHost {
    /// Create (or reuse) the shared memory object and map it.
    ///
    /// An existing object with the same name is resized and reused; the
    /// receiver reinitializes the region at the start of every session.
    pub fn create(name: &str) -> Result<Self, ChannelError> {
        let fd = shm::open(name, shm::OFlags::CREATE | shm::OFlags::RDWR, shm_mode())
            .map_err(|e| ChannelError::resource(format!("shm_open {name}"), e))?;

        if let Err(e) = ftruncate(&fd, SHARED_REGION_SIZE as u64) {
            drop(fd);
            let _ = shm::unlink(name);
            return Err(ChannelError::resource(format!("ftruncate {name}"), e));
        }

        let mapping = match Mapping::map(&fd, name) {
            Ok(m) => m,
            Err(e) => {
                drop(fd);
                let _ = shm::unlink(name);
                return Err(e);
            }
        };

        Ok(Self {
            mapping,
            name: name.to_string(),
        })
    }

    /// Name of the shared memory object
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Deref for RegionHost {
    type Target = SharedRegion;

    fn deref(&self) -> &SharedRegion {
        self.mapping.region()
    }
}

impl Drop for RegionHost {
    fn drop(&mut self) {
        // Existing client mappings stay valid; only the name goes away
        let _ = shm::unlink(self.name.as_str());
    }
}

/// Handle to shared memory (sender side - opens an existing object)
pub struct RegionClient {
    mapping: Mapping,
}

// SAFETY: same as RegionHost
unsafe impl Send for RegionClient {}
unsafe impl Sync for RegionClient {}

impl RegionClient {
    /// Open an existing region created by a receiver
    pub fn open(name: &str) -> Result<Self, ChannelError> {
        let fd = shm::open(name, shm::OFlags::RDWR, Mode::empty())
            .map_err(|e| ChannelError::resource(format!("shm_open {name}"), e))?;

        // Verify the layout size matches before handing out a &SharedRegion
        let stat = fstat(&fd).map_err(|e| ChannelError::resource(format!("fstat {name}"), e))?;
        if stat.st_size as i64 != SHARED_REGION_SIZE as i64 {
            return Err(ChannelError::resource(
                format!(
                    "{name} is {} bytes, expected {SHARED_REGION_SIZE}",
                    stat.st_size
                ),
                rustix::io::Errno::INVAL,
            ));
        }

        let mapping = Mapping::map(&fd, name)?;
        Ok(Self { mapping })
    }

    /// Open the region, retrying while the receiver has not created it yet
    pub fn connect(name: &str, attempts: u32, interval: Duration) -> Result<Self, ChannelError> {
        let mut last = None;
        for _ in 0..attempts.max(1) {
            match Self::open(name) {
                Ok(client) => return Ok(client),
                Err(e) => last = Some(e),
            }
            std::thread::sleep(interval);
        }
        Err(last.unwrap_or_else(|| {
            ChannelError::resource(format!("shm_open {name}"), rustix::io::Errno::NOENT)
        }))
    }
}

impl Deref for RegionClient {
    type Target = SharedRegion;

    fn deref(&self) -> &SharedRegion {
        self.mapping.region()
    }
}
