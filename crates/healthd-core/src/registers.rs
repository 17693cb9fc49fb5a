//! Physical register windows.
//!
//! A window maps one page of physical memory for the duration of a single
//! poll and is unmapped when dropped. Every access is bounds- and
//! alignment-checked; the volatile read in [`RegisterWindow`] is the only
//! `unsafe` code in the crate.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use memmap2::{MmapOptions, MmapRaw};
use parking_lot::Mutex;

use crate::error::{HealthError, Result};

/// Size of one register window.
pub const PAGE_SIZE: usize = 0x1000;

/// Read access to a mapped register window.
pub trait Registers {
    fn read_u32(&self, offset: usize) -> Result<u32>;

    fn read_u8(&self, offset: usize) -> Result<u8>;
}

/// Maps register windows from physical memory.
pub trait PhysicalMemory: Send + Sync {
    /// Map `PAGE_SIZE` bytes starting at physical address `base`.
    fn map(&self, base: u64) -> Result<Box<dyn Registers>>;
}

fn check_access(base: u64, offset: usize, width: usize, len: usize) -> Result<()> {
    let in_range = offset.checked_add(width).is_some_and(|end| end <= len);
    if !in_range || offset % width != 0 {
        return Err(HealthError::RegisterOutOfRange {
            base,
            offset,
            width,
            len,
        });
    }
    Ok(())
}

// =============================================================================
// /dev/mem
// =============================================================================

/// [`PhysicalMemory`] over `/dev/mem`.
#[derive(Debug, Clone)]
pub struct DevMem {
    path: PathBuf,
}

impl DevMem {
    #[must_use]
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/dev/mem"),
        }
    }

    /// Map from another device or file.
    #[must_use]
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for DevMem {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalMemory for DevMem {
    fn map(&self, base: u64) -> Result<Box<dyn Registers>> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_SYNC)
            .open(&self.path)?;
        let map = MmapOptions::new()
            .offset(base)
            .len(PAGE_SIZE)
            .map_raw_read_only(&file)?;
        Ok(Box::new(RegisterWindow { base, map }))
    }
}

/// One mapped page. Unmapped on drop.
pub struct RegisterWindow {
    base: u64,
    map: MmapRaw,
}

impl RegisterWindow {
    #[allow(unsafe_code)] // Device registers must be read through a volatile pointer.
    fn read<T: Copy>(&self, offset: usize) -> Result<T> {
        let width = std::mem::size_of::<T>();
        check_access(self.base, offset, width, self.map.len())?;
        // SAFETY: offset + width is inside the live mapping and offset is a
        // multiple of width on a page-aligned base, so the pointer is valid
        // and aligned for T.
        let value = unsafe { self.map.as_ptr().add(offset).cast::<T>().read_volatile() };
        Ok(value)
    }
}

impl Registers for RegisterWindow {
    fn read_u32(&self, offset: usize) -> Result<u32> {
        self.read::<u32>(offset)
    }

    fn read_u8(&self, offset: usize) -> Result<u8> {
        self.read::<u8>(offset)
    }
}

// =============================================================================
// Simulated memory
// =============================================================================

/// In-memory [`PhysicalMemory`] for tests and dry runs.
///
/// Pages are created on first write; mapping an unknown page yields zeroes.
#[derive(Debug, Default)]
pub struct SimulatedMemory {
    inner: Mutex<SimulatedInner>,
}

#[derive(Debug, Default)]
struct SimulatedInner {
    pages: HashMap<u64, Vec<u8>>,
    failing_maps: u32,
    maps: u64,
}

impl SimulatedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u32(&self, base: u64, offset: usize, value: u32) {
        let mut inner = self.inner.lock();
        let page = inner
            .pages
            .entry(base)
            .or_insert_with(|| vec![0; PAGE_SIZE]);
        page[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    pub fn write_u8(&self, base: u64, offset: usize, value: u8) {
        let mut inner = self.inner.lock();
        let page = inner
            .pages
            .entry(base)
            .or_insert_with(|| vec![0; PAGE_SIZE]);
        page[offset] = value;
    }

    /// Make the next `count` map calls fail with an I/O error.
    pub fn fail_next_maps(&self, count: u32) {
        self.inner.lock().failing_maps = count;
    }

    /// Number of successful maps.
    pub fn map_count(&self) -> u64 {
        self.inner.lock().maps
    }
}

impl PhysicalMemory for SimulatedMemory {
    fn map(&self, base: u64) -> Result<Box<dyn Registers>> {
        let mut inner = self.inner.lock();
        if inner.failing_maps > 0 {
            inner.failing_maps -= 1;
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "simulated /dev/mem failure",
            )
            .into());
        }
        inner.maps += 1;
        let bytes = inner
            .pages
            .get(&base)
            .cloned()
            .unwrap_or_else(|| vec![0; PAGE_SIZE]);
        Ok(Box::new(SnapshotWindow { base, bytes }))
    }
}

struct SnapshotWindow {
    base: u64,
    bytes: Vec<u8>,
}

impl Registers for SnapshotWindow {
    fn read_u32(&self, offset: usize) -> Result<u32> {
        check_access(self.base, offset, 4, self.bytes.len())?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[offset..offset + 4]);
        Ok(u32::from_ne_bytes(raw))
    }

    fn read_u8(&self, offset: usize) -> Result<u8> {
        check_access(self.base, offset, 1, self.bytes.len())?;
        Ok(self.bytes[offset])
    }
}
