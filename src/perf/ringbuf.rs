use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};

use super::sys::PerfEventMmapPage;

/// Per-cpu ring sizing. Sizes are in bytes; zero disables the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    pub page_size: u64,
    pub data_buffer_size: u64,
    pub aux_buffer_size: u64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BufferConfigError {
    #[error("page size must be non-zero")]
    PageSizeZero,
    #[error("{0} size {1} is not a power of two")]
    NotPowerOfTwo(&'static str, u64),
    #[error("{0} size {1} is smaller than the page size")]
    SmallerThanPage(&'static str, u64),
}

impl BufferConfig {
    pub fn validate(&self) -> Result<(), BufferConfigError> {
        if self.page_size == 0 {
            return Err(BufferConfigError::PageSizeZero);
        }
        for (what, size) in [
            ("data buffer", self.data_buffer_size),
            ("aux buffer", self.aux_buffer_size),
        ] {
            if size == 0 {
                continue;
            }
            if !size.is_power_of_two() {
                return Err(BufferConfigError::NotPowerOfTwo(what, size));
            }
            if size < self.page_size {
                return Err(BufferConfigError::SmallerThanPage(what, size));
            }
        }
        Ok(())
    }

    /// Length of the primary mmap: the header page plus the data region.
    pub fn data_mmap_len(&self) -> u64 {
        self.page_size + self.data_buffer_size
    }
}

/// A point-in-time copy of one region's producer/consumer indices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegionSnapshot {
    pub head: u64,
    pub tail: u64,
}

/// Captured state of both buffer pointer pairs, so the kernel can keep
/// writing while the drain runs.
///
/// The data positions are read *before* the aux positions so that no data
/// record newer than the captured aux bytes is ever published; the drain
/// then emits aux before data (see the buffer consumer).
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferSnapshot {
    pub data: RegionSnapshot,
    pub aux: RegionSnapshot,
}

/// The kernel mapping of one cpu's perf ring: the header page + data region,
/// plus the optional AUX region. Unmapped on drop.
pub struct RingBufferMmap {
    config: BufferConfig,
    base: *mut u8,
    aux_base: *mut u8,
}

// The mapping is plain shared memory; all mutation goes through atomics or
// is exclusive to the single drain task.
unsafe impl Send for RingBufferMmap {}
unsafe impl Sync for RingBufferMmap {}

impl RingBufferMmap {
    /// Map the header page and data region of `fd`.
    pub fn map(fd: RawFd, config: BufferConfig) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let len = config.data_mmap_len() as usize;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let e = io::Error::last_os_error();
            log::debug!(
                "mmap failed for fd {fd} (len={len}): {e}; \
                 /proc/sys/kernel/perf_event_mlock_kb may be too small"
            );
            return Err(e);
        }
        let mapping = RingBufferMmap {
            config,
            base: base as *mut u8,
            aux_base: ptr::null_mut(),
        };

        let compat_version = unsafe { (*mapping.header()).compat_version };
        if compat_version != 0 {
            return Err(io::Error::other(format!(
                "incompatible perf_event_mmap_page compat_version {compat_version}"
            )));
        }
        Ok(mapping)
    }

    /// Map the AUX region of `fd` behind the data region. No-op when the
    /// configuration has no aux buffer; an error to call twice.
    pub fn attach_aux(&mut self, fd: RawFd) -> io::Result<()> {
        if self.config.aux_buffer_size == 0 {
            return Ok(());
        }
        if !self.aux_base.is_null() {
            return Err(io::Error::other("aux buffer already mapped"));
        }

        let offset = self.config.data_mmap_len();
        let len = self.config.aux_buffer_size as usize;
        unsafe {
            let header = self.header();
            (*header).aux_offset = offset;
            (*header).aux_size = len as u64;
        }

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        if base == libc::MAP_FAILED {
            let e = io::Error::last_os_error();
            log::debug!("aux mmap failed for fd {fd} (len={len}, offset={offset}): {e}");
            return Err(e);
        }
        self.aux_base = base as *mut u8;
        Ok(())
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn has_aux(&self) -> bool {
        !self.aux_base.is_null()
    }

    fn header(&self) -> *mut PerfEventMmapPage {
        self.base as *mut PerfEventMmapPage
    }

    fn header_field(&self, offset_of: usize) -> &AtomicU64 {
        unsafe { &*(self.base.add(offset_of) as *const AtomicU64) }
    }

    fn data_head_atomic(&self) -> &AtomicU64 {
        self.header_field(std::mem::offset_of!(PerfEventMmapPage, data_head))
    }

    fn data_tail_atomic(&self) -> &AtomicU64 {
        self.header_field(std::mem::offset_of!(PerfEventMmapPage, data_tail))
    }

    fn aux_head_atomic(&self) -> &AtomicU64 {
        self.header_field(std::mem::offset_of!(PerfEventMmapPage, aux_head))
    }

    fn aux_tail_atomic(&self) -> &AtomicU64 {
        self.header_field(std::mem::offset_of!(PerfEventMmapPage, aux_tail))
    }

    /// Capture head/tail for both regions: heads with acquire ordering (the
    /// kernel publishes with release), tails as plain loads (only we write
    /// them). Data before aux, see the type-level comment.
    pub fn snapshot(&self) -> BufferSnapshot {
        let mut snapshot = BufferSnapshot::default();
        snapshot.data.head = self.data_head_atomic().load(Ordering::Acquire);
        snapshot.data.tail = self.data_tail_atomic().load(Ordering::Relaxed);
        if self.has_aux() {
            snapshot.aux.head = self.aux_head_atomic().load(Ordering::Acquire);
            snapshot.aux.tail = self.aux_tail_atomic().load(Ordering::Relaxed);
        }
        snapshot
    }

    /// Hand consumed data space back to the kernel.
    pub fn store_data_tail(&self, tail: u64) {
        self.data_tail_atomic().store(tail, Ordering::Release);
    }

    /// Hand consumed aux space back to the kernel.
    pub fn store_aux_tail(&self, tail: u64) {
        self.aux_tail_atomic().store(tail, Ordering::Release);
    }

    /// The data region (without the header page).
    pub fn data_region(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self.base.add(self.config.page_size as usize),
                self.config.data_buffer_size as usize,
            )
        }
    }

    pub fn aux_region(&self) -> Option<&[u8]> {
        if self.aux_base.is_null() {
            return None;
        }
        Some(unsafe {
            std::slice::from_raw_parts(self.aux_base, self.config.aux_buffer_size as usize)
        })
    }
}

impl Drop for RingBufferMmap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.config.data_mmap_len() as usize);
            if !self.aux_base.is_null() {
                libc::munmap(
                    self.aux_base as *mut libc::c_void,
                    self.config.aux_buffer_size as usize,
                );
            }
        }
    }
}

#[cfg(test)]
impl RingBufferMmap {
    /// An anonymous mapping with the same layout, for driving the consumer
    /// in tests without a perf fd. The caller plays the part of the kernel.
    pub fn anonymous(config: BufferConfig) -> Self {
        config.validate().expect("valid test config");
        let total = (config.data_mmap_len() + config.aux_buffer_size) as usize;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert!(base != libc::MAP_FAILED);
        let base = base as *mut u8;
        let aux_base = if config.aux_buffer_size > 0 {
            unsafe { base.add(config.data_mmap_len() as usize) }
        } else {
            ptr::null_mut()
        };
        RingBufferMmap {
            config,
            base,
            aux_base,
        }
    }

    /// Kernel-side view for tests: publish bytes into the data region and
    /// advance the head.
    pub fn produce_data(&self, bytes: &[u8]) {
        let head = self.data_head_atomic().load(Ordering::Relaxed);
        let size = self.config.data_buffer_size;
        let region = unsafe {
            std::slice::from_raw_parts_mut(
                self.base.add(self.config.page_size as usize),
                size as usize,
            )
        };
        for (i, byte) in bytes.iter().enumerate() {
            region[((head + i as u64) % size) as usize] = *byte;
        }
        self.data_head_atomic()
            .store(head + bytes.len() as u64, Ordering::Release);
    }

    /// Kernel-side view for tests: publish aux bytes and advance aux_head.
    pub fn produce_aux(&self, bytes: &[u8]) {
        let head = self.aux_head_atomic().load(Ordering::Relaxed);
        let size = self.config.aux_buffer_size;
        let region = unsafe {
            std::slice::from_raw_parts_mut(self.aux_base, size as usize)
        };
        for (i, byte) in bytes.iter().enumerate() {
            region[((head + i as u64) % size) as usize] = *byte;
        }
        self.aux_head_atomic()
            .store(head + bytes.len() as u64, Ordering::Release);
    }

    /// Kernel-side view for tests: force raw header positions.
    pub fn set_positions(&self, data: RegionSnapshot, aux: RegionSnapshot) {
        self.data_head_atomic().store(data.head, Ordering::Release);
        self.data_tail_atomic().store(data.tail, Ordering::Release);
        self.aux_head_atomic().store(aux.head, Ordering::Release);
        self.aux_tail_atomic().store(aux.tail, Ordering::Release);
    }
}
