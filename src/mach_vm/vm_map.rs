//! VM Map - Address Space Management
//!
//! Based on Mach4 vm/vm_map.h/c
//!
//! The IPC core only needs four things from an address map: carve a region,
//! snapshot a region into a copy object (`vm_map_copyin`), map a copy object
//! into a fresh region (`vm_map_copyout`) and release a region. [`VmMap`]
//! captures that; [`AnonymousMap`] is a self-contained implementation whose
//! regions share their backing store copy-on-write.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;
use thiserror::Error;

/// Virtual address within a map
pub type VmAddress = u64;

/// Page size for region rounding
pub const PAGE_SIZE: u64 = 4096;

/// Round a size up to whole pages
pub const fn round_page(size: u64) -> u64 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Round an address down to its page
pub const fn trunc_page(addr: VmAddress) -> VmAddress {
    addr & !(PAGE_SIZE - 1)
}

// ============================================================================
// Map Errors
// ============================================================================

/// VM Map operation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    /// Invalid address range
    #[error("invalid address range {start:#x}+{size:#x}")]
    InvalidRange { start: VmAddress, size: u64 },
    /// No space available
    #[error("no space in address map")]
    NoSpace,
    /// Entry not found
    #[error("no mapping at {0:#x}")]
    NotFound(VmAddress),
}

// ============================================================================
// Copy Objects
// ============================================================================

/// Snapshot of a memory range in transit between maps
///
/// Clones share the underlying pages; writers in any map get a private copy.
#[derive(Clone, PartialEq, Eq)]
pub struct VmMapCopy {
    data: Arc<Vec<u8>>,
    offset: usize,
    size: usize,
}

impl VmMapCopy {
    /// Copy object holding `bytes`
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let size = bytes.len();
        Self {
            data: Arc::new(bytes),
            offset: 0,
            size,
        }
    }

    /// Size of the copied range in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.size]
    }

    /// Does this copy still share pages with another holder?
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.data) > 1
    }
}

impl fmt::Debug for VmMapCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmMapCopy")
            .field("size", &self.size)
            .field("shared", &self.is_shared())
            .finish()
    }
}

// ============================================================================
// VM Map Collaborator
// ============================================================================

/// Address-map services used by out-of-line transfer
pub trait VmMap: Send + Sync + fmt::Debug {
    /// Allocate a zero-filled region of at least `size` bytes
    fn allocate(&self, size: u64) -> Result<VmAddress, MapError>;

    /// Unmap the pages covering `[addr, addr + size)`
    fn deallocate(&self, addr: VmAddress, size: u64) -> Result<(), MapError>;

    /// Read `len` bytes at `addr`
    fn read(&self, addr: VmAddress, len: usize) -> Result<Vec<u8>, MapError>;

    /// Write `data` at `addr`
    fn write(&self, addr: VmAddress, data: &[u8]) -> Result<(), MapError>;

    /// Snapshot `[addr, addr + size)` into a copy object
    fn copyin(&self, addr: VmAddress, size: u64) -> Result<VmMapCopy, MapError>;

    /// Map a copy object into a fresh region and return its address
    fn copyout(&self, copy: VmMapCopy) -> Result<VmAddress, MapError>;
}

// ============================================================================
// Anonymous Map
// ============================================================================

#[derive(Debug, Clone)]
struct Region {
    /// Mapped size (page rounded)
    size: u64,
    /// Backing store; shared copy-on-write with copy objects
    pages: Arc<Vec<u8>>,
    /// Offset of the region's first byte within `pages`
    offset: usize,
}

impl Region {
    fn end(&self, start: VmAddress) -> VmAddress {
        start + self.size
    }

    /// Make the backing store private before a write
    fn pages_mut(&mut self) -> &mut Vec<u8> {
        if Arc::strong_count(&self.pages) > 1
            || self.offset != 0
            || self.pages.len() < self.size as usize
        {
            let len = self.size as usize;
            let mut private = vec![0u8; len];
            let avail = self.pages.len().saturating_sub(self.offset).min(len);
            private[..avail].copy_from_slice(&self.pages[self.offset..self.offset + avail]);
            self.pages = Arc::new(private);
            self.offset = 0;
        }
        Arc::make_mut(&mut self.pages)
    }
}

/// Map ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmMapId(pub u64);

/// Address map backed by anonymous memory
#[derive(Debug)]
pub struct AnonymousMap {
    /// Map ID
    pub id: VmMapId,
    /// Map entries (ordered by start address)
    regions: Mutex<BTreeMap<VmAddress, Region>>,
    /// Minimum address
    min_offset: VmAddress,
    /// Maximum address
    max_offset: VmAddress,
}

impl AnonymousMap {
    /// Default user range
    pub const MIN_ADDRESS: VmAddress = 0x1000_0000;
    pub const MAX_ADDRESS: VmAddress = 0x7fff_f000_0000;

    pub fn new() -> Self {
        Self::with_range(Self::MIN_ADDRESS, Self::MAX_ADDRESS)
    }

    /// Create a map spanning `[min, max)`
    pub fn with_range(min: VmAddress, max: VmAddress) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: VmMapId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            regions: Mutex::new(BTreeMap::new()),
            min_offset: min,
            max_offset: max,
        }
    }

    /// Number of mapped regions
    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    /// Is `addr` inside a mapped region?
    pub fn is_mapped(&self, addr: VmAddress) -> bool {
        let regions = self.regions.lock();
        Self::lookup(&regions, addr).is_some()
    }

    /// Find the region containing `addr`
    fn lookup(regions: &BTreeMap<VmAddress, Region>, addr: VmAddress) -> Option<VmAddress> {
        let (&start, region) = regions.range(..=addr).next_back()?;
        (addr < region.end(start)).then_some(start)
    }

    /// Find free space of given size
    fn find_space(&self, regions: &BTreeMap<VmAddress, Region>, size: u64) -> Option<VmAddress> {
        let mut prev_end = self.min_offset;
        for (&start, region) in regions.iter() {
            if prev_end + size <= start {
                return Some(prev_end);
            }
            prev_end = prev_end.max(region.end(start));
        }
        (prev_end + size <= self.max_offset).then_some(prev_end)
    }

    fn enter(&self, region: Region) -> Result<VmAddress, MapError> {
        let mut regions = self.regions.lock();
        let addr = self
            .find_space(&regions, region.size.max(PAGE_SIZE))
            .ok_or(MapError::NoSpace)?;
        regions.insert(addr, region);
        Ok(addr)
    }

    /// Locate `[addr, addr + len)` within a single region
    fn span(
        regions: &BTreeMap<VmAddress, Region>,
        addr: VmAddress,
        len: u64,
    ) -> Result<(VmAddress, usize), MapError> {
        let range = MapError::InvalidRange { start: addr, size: len };
        let start = Self::lookup(regions, addr).ok_or(range)?;
        let region = &regions[&start];
        let end = addr.checked_add(len).ok_or(range)?;
        if end > region.end(start) {
            return Err(range);
        }
        Ok((start, (addr - start) as usize))
    }
}

impl Default for AnonymousMap {
    fn default() -> Self {
        Self::new()
    }
}

impl VmMap for AnonymousMap {
    fn allocate(&self, size: u64) -> Result<VmAddress, MapError> {
        let size = round_page(size.max(1));
        let addr = self.enter(Region {
            size,
            pages: Arc::new(vec![0u8; size as usize]),
            offset: 0,
        })?;
        log::trace!("vm_map {:?}: allocated {:#x}+{:#x}", self.id, addr, size);
        Ok(addr)
    }

    fn deallocate(&self, addr: VmAddress, size: u64) -> Result<(), MapError> {
        let range = MapError::InvalidRange { start: addr, size };
        let mut regions = self.regions.lock();
        let start = Self::lookup(&regions, addr).ok_or(MapError::NotFound(addr))?;
        let lo = trunc_page(addr);
        let hi = addr
            .checked_add(size.max(1))
            .map(round_page)
            .ok_or(range)?;
        let region = regions.remove(&start).ok_or(MapError::NotFound(addr))?;
        let end = region.end(start);
        if hi > end {
            regions.insert(start, region);
            return Err(range);
        }

        // Keep whatever lies on either side; both halves share the pages
        if lo > start {
            regions.insert(
                start,
                Region {
                    size: lo - start,
                    pages: region.pages.clone(),
                    offset: region.offset,
                },
            );
        }
        if hi < end {
            regions.insert(
                hi,
                Region {
                    size: end - hi,
                    pages: region.pages.clone(),
                    offset: region.offset + (hi - start) as usize,
                },
            );
        }
        log::trace!("vm_map {:?}: deallocated {:#x}..{:#x}", self.id, lo, hi);
        Ok(())
    }

    fn read(&self, addr: VmAddress, len: usize) -> Result<Vec<u8>, MapError> {
        let regions = self.regions.lock();
        let (start, off) = Self::span(&regions, addr, len as u64)?;
        let region = &regions[&start];
        let base = region.offset + off;
        let mut out = vec![0u8; len];
        let avail = region.pages.len().saturating_sub(base).min(len);
        out[..avail].copy_from_slice(&region.pages[base..base + avail]);
        Ok(out)
    }

    fn write(&self, addr: VmAddress, data: &[u8]) -> Result<(), MapError> {
        let mut regions = self.regions.lock();
        let (start, off) = Self::span(&regions, addr, data.len() as u64)?;
        let region = regions
            .get_mut(&start)
            .ok_or(MapError::NotFound(addr))?;
        region.pages_mut()[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn copyin(&self, addr: VmAddress, size: u64) -> Result<VmMapCopy, MapError> {
        let regions = self.regions.lock();
        let (start, off) = Self::span(&regions, addr, size)?;
        let region = &regions[&start];
        let base = region.offset + off;
        if base + size as usize <= region.pages.len() {
            // Share the pages; the first write on either side copies.
            return Ok(VmMapCopy {
                data: Arc::clone(&region.pages),
                offset: base,
                size: size as usize,
            });
        }
        drop(regions);
        self.read(addr, size as usize).map(VmMapCopy::from_bytes)
    }

    fn copyout(&self, copy: VmMapCopy) -> Result<VmAddress, MapError> {
        let size = round_page(copy.size as u64);
        let addr = self.enter(Region {
            size: size.max(PAGE_SIZE),
            pages: copy.data,
            offset: copy.offset,
        })?;
        log::trace!("vm_map {:?}: copied out {:#x} bytes at {:#x}", self.id, copy.size, addr);
        Ok(addr)
    }
}
