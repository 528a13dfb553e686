//! Code regions: where generated code lives.
//!
//! - [`CodeRegion`]: fixed capacity, append-only, with an advancing frontier
//! - [`PatchCursor`]: rewinds a frontier to overwrite emitted bytes in place
//! - [`CodeBlocks`]: the hot "main" and cold "stubs" partitions
//!
//! # Memory Layout
//! ```text
//! base                       frontier                  base + capacity
//!  |---- emitted code ---------|------- free -------------|
//!        ^ addresses handed out here never move
//! ```
//!
//! Generated code refers to region memory by absolute address, so a region
//! is never moved, grown or compacted once mapped.

use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::Arc;

use super::os::{self, PageAccess};
use crate::error::RegionError;

// =============================================================================
// Protection Model
// =============================================================================

/// How a region's pages are protected while code in it may be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protection {
    /// Pages stay readable, writable and executable for their whole life.
    /// Required when placeholders are smashed while other threads may be
    /// executing the same pages.
    #[default]
    ReadWriteExecute,
    /// Pages are writable while emitting and executable once sealed; a
    /// smash toggles the page writable around the write (W^X).
    WriteXorExecute,
}

// =============================================================================
// Code Region
// =============================================================================

/// An anonymous mapping shared by the regions carved out of it.
///
/// Carving both partitions from one mapping keeps every main-to-stubs
/// transfer within rel32 reach.
struct Mapping {
    ptr: NonNull<u8>,
    size: usize,
}

impl Mapping {
    fn map(name: &'static str, size: usize, protection: Protection) -> Result<Self, RegionError> {
        let access = match protection {
            Protection::ReadWriteExecute => PageAccess::ReadWriteExecute,
            Protection::WriteXorExecute => PageAccess::ReadWrite,
        };
        let ptr = os::map(size, access).map_err(|source| RegionError::Map {
            name,
            capacity: size,
            source,
        })?;
        Ok(Mapping { ptr, size })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: the last region carved from this mapping is gone
        unsafe { os::unmap(self.ptr, self.size) }
    }
}

// SAFETY: the mapping is plain memory; access is mediated by CodeRegion
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// A contiguous block of executable memory with a monotonically advancing
/// write frontier.
///
/// Emission past `capacity` is fatal: there is no recovery at this layer.
pub struct CodeRegion {
    /// Region name for diagnostics ("main", "stubs").
    name: &'static str,
    /// Keeps the backing pages alive.
    _mapping: Arc<Mapping>,
    /// Pointer to the first byte of this region.
    ptr: NonNull<u8>,
    /// Size of this region (page-aligned).
    capacity: usize,
    /// Offset of the next byte to be written.
    frontier: usize,
    /// Writes may not pass this offset. Equal to `capacity` except while a
    /// [`PatchCursor`] is open, when it is the frontier that cursor saved.
    limit: usize,
    protection: Protection,
    /// Whether the pages are currently sealed executable (W^X only).
    is_executable: bool,
}

impl CodeRegion {
    /// Map a region of at least `min_capacity` bytes.
    ///
    /// The actual capacity is rounded up to the nearest page boundary.
    pub fn new(
        name: &'static str,
        min_capacity: usize,
        protection: Protection,
    ) -> Result<Self, RegionError> {
        let capacity = os::round_to_pages(min_capacity.max(1));
        let mapping = Arc::new(Mapping::map(name, capacity, protection)?);
        Ok(Self::carve(name, mapping, 0, capacity, protection))
    }

    fn carve(
        name: &'static str,
        mapping: Arc<Mapping>,
        offset: usize,
        capacity: usize,
        protection: Protection,
    ) -> Self {
        debug_assert!(offset + capacity <= mapping.size);
        let ptr = unsafe { NonNull::new_unchecked(mapping.ptr.as_ptr().add(offset)) };

        tracing::debug!(
            region = name,
            base = format_args!("{:#x}", ptr.as_ptr() as usize),
            capacity,
            "mapped code region"
        );

        CodeRegion {
            name,
            _mapping: mapping,
            ptr,
            capacity,
            frontier: 0,
            limit: capacity,
            protection,
            is_executable: false,
        }
    }

    /// Region name.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Address of the first byte of the region.
    #[inline]
    pub fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Address the next emitted byte will land at.
    #[inline]
    pub fn frontier(&self) -> usize {
        self.base() + self.frontier
    }

    /// Bytes emitted so far (relative to the effective frontier).
    #[inline]
    pub fn used(&self) -> usize {
        self.frontier
    }

    /// Total capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes that can still be emitted.
    #[inline]
    pub fn available(&self) -> usize {
        self.limit - self.frontier
    }

    /// Protection model the region was mapped with.
    #[inline]
    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Check if the region is currently sealed executable.
    #[inline]
    pub fn is_executable(&self) -> bool {
        self.is_executable
    }

    /// Whether `addr` lies inside the mapped range.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.base() + self.capacity
    }

    /// Whether a patch cursor is currently open on this region.
    #[inline]
    pub fn is_patching(&self) -> bool {
        self.limit != self.capacity
    }

    /// The bytes emitted so far.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.frontier) }
    }

    /// Read `len` bytes starting at absolute address `addr`.
    ///
    /// # Panics
    /// Panics if the range is not inside the mapped region.
    pub fn read(&self, addr: usize, len: usize) -> &[u8] {
        assert!(
            self.contains(addr) && addr + len <= self.base() + self.capacity,
            "read of {len} bytes at {addr:#x} outside region `{}`",
            self.name
        );
        // SAFETY: the range lies inside the live mapping
        unsafe { std::slice::from_raw_parts(addr as *const u8, len) }
    }

    /// Write a single byte.
    ///
    /// # Panics
    /// Panics if the region is sealed or if there's no space.
    #[inline]
    pub fn emit_u8(&mut self, byte: u8) {
        self.emit_bytes(&[byte]);
    }

    /// Write a slice of bytes at the frontier.
    ///
    /// # Panics
    /// Panics if the region is sealed or if there's not enough space. Under
    /// a patch cursor, running past the saved frontier also panics: a
    /// rewrite must fit in the bytes it replaces.
    #[inline]
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        assert!(
            !self.is_executable,
            "cannot emit into sealed code region `{}`",
            self.name
        );
        if self.frontier + bytes.len() > self.limit {
            if self.is_patching() {
                panic!(
                    "patch in region `{}` overruns the bytes it replaces",
                    self.name
                );
            }
            panic!(
                "code region `{}` exhausted ({} of {} bytes used, {} requested)",
                self.name,
                self.frontier,
                self.capacity,
                bytes.len()
            );
        }

        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(self.frontier),
                bytes.len(),
            );
        }
        self.frontier += bytes.len();
    }

    /// Temporarily move the write position back to `addr`.
    ///
    /// The returned cursor derefs to this region; emission through it
    /// overwrites previously emitted bytes. When the cursor is dropped
    /// (normally or during unwinding) the frontier is restored.
    ///
    /// # Panics
    /// Panics if `addr` is not inside the already-emitted part of the region.
    pub fn patch_cursor(&mut self, addr: usize) -> PatchCursor<'_> {
        assert!(
            addr >= self.base() && addr <= self.frontier(),
            "patch cursor at {addr:#x} outside emitted part of region `{}`",
            self.name
        );
        let saved_frontier = self.frontier;
        let saved_limit = self.limit;
        self.limit = self.frontier;
        self.frontier = addr - self.base();
        PatchCursor {
            region: self,
            saved_frontier,
            saved_limit,
        }
    }

    /// Seal the region executable (W^X regions only; a no-op otherwise).
    pub fn make_executable(&mut self) -> Result<(), RegionError> {
        if self.protection == Protection::WriteXorExecute && !self.is_executable {
            self.set_access(PageAccess::ReadExecute)?;
            self.is_executable = true;
        }
        Ok(())
    }

    /// Make a sealed W^X region writable again for emission.
    pub fn make_writable(&mut self) -> Result<(), RegionError> {
        if self.is_executable {
            self.set_access(PageAccess::ReadWrite)?;
            self.is_executable = false;
        }
        Ok(())
    }

    fn set_access(&self, access: PageAccess) -> Result<(), RegionError> {
        // SAFETY: the region is page aligned and inside its live mapping
        unsafe { os::protect(self.base(), self.capacity, access) }.map_err(|source| {
            RegionError::Protect {
                name: self.name,
                source,
            }
        })
    }
}

impl std::fmt::Debug for CodeRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeRegion")
            .field("name", &self.name)
            .field("base", &format_args!("{:#x}", self.base()))
            .field("frontier", &format_args!("{:#x}", self.frontier()))
            .field("capacity", &self.capacity)
            .field("protection", &self.protection)
            .finish()
    }
}

// CodeRegion is Send + Sync because writers are serialized through `&mut`
// and smashes go through the patcher's ordered writes.
unsafe impl Send for CodeRegion {}
unsafe impl Sync for CodeRegion {}

// =============================================================================
// Patch Cursor
// =============================================================================

/// A scoped rewind of a region's frontier.
///
/// See [`CodeRegion::patch_cursor`].
pub struct PatchCursor<'r> {
    region: &'r mut CodeRegion,
    saved_frontier: usize,
    saved_limit: usize,
}

impl PatchCursor<'_> {
    /// The frontier that will be restored on drop, as an address.
    #[inline]
    pub fn saved_frontier(&self) -> usize {
        self.region.base() + self.saved_frontier
    }
}

impl Deref for PatchCursor<'_> {
    type Target = CodeRegion;

    fn deref(&self) -> &CodeRegion {
        self.region
    }
}

impl DerefMut for PatchCursor<'_> {
    fn deref_mut(&mut self) -> &mut CodeRegion {
        self.region
    }
}

impl Drop for PatchCursor<'_> {
    fn drop(&mut self) {
        self.region.frontier = self.saved_frontier;
        self.region.limit = self.saved_limit;
    }
}

// =============================================================================
// Code Blocks
// =============================================================================

/// Which partition a piece of code is emitted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionId {
    /// Hot, linear body code.
    Main,
    /// Cold resolver trampolines and slow paths.
    Stubs,
}

/// The two code partitions of a compilation session.
#[derive(Debug)]
pub struct CodeBlocks {
    pub main: CodeRegion,
    pub stubs: CodeRegion,
}

impl CodeBlocks {
    /// Map both partitions back to back in a single mapping.
    pub fn new(
        main_capacity: usize,
        stubs_capacity: usize,
        protection: Protection,
    ) -> Result<Self, RegionError> {
        let main_capacity = os::round_to_pages(main_capacity.max(1));
        let stubs_capacity = os::round_to_pages(stubs_capacity.max(1));
        let mapping = Arc::new(Mapping::map(
            "code",
            main_capacity + stubs_capacity,
            protection,
        )?);
        Ok(CodeBlocks {
            main: CodeRegion::carve("main", mapping.clone(), 0, main_capacity, protection),
            stubs: CodeRegion::carve("stubs", mapping, main_capacity, stubs_capacity, protection),
        })
    }

    #[inline]
    pub fn get(&self, id: RegionId) -> &CodeRegion {
        match id {
            RegionId::Main => &self.main,
            RegionId::Stubs => &self.stubs,
        }
    }

    #[inline]
    pub fn get_mut(&mut self, id: RegionId) -> &mut CodeRegion {
        match id {
            RegionId::Main => &mut self.main,
            RegionId::Stubs => &mut self.stubs,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> CodeRegion {
        CodeRegion::new("test", 1024, Protection::ReadWriteExecute).unwrap()
    }

    #[test]
    fn test_region_creation() {
        let r = region();
        assert!(r.capacity() >= 1024);
        assert_eq!(r.used(), 0);
        assert_eq!(r.frontier(), r.base());
        assert_eq!(r.base() % os::page_size(), 0);
    }

    #[test]
    fn test_region_emit_advances_frontier() {
        let mut r = region();
        r.emit_u8(0x90);
        r.emit_bytes(&[0x48, 0x89, 0xC1]);
        assert_eq!(r.used(), 4);
        assert_eq!(r.frontier(), r.base() + 4);
        assert_eq!(r.bytes(), &[0x90, 0x48, 0x89, 0xC1]);
    }

    #[test]
    fn test_patch_cursor_restores_frontier() {
        let mut r = region();
        r.emit_bytes(&[0xAA; 8]);
        let site = r.base() + 2;
        {
            let mut cursor = r.patch_cursor(site);
            assert_eq!(cursor.frontier(), site);
            cursor.emit_bytes(&[0x11, 0x22]);
            assert_eq!(cursor.saved_frontier(), cursor.base() + 8);
        }
        assert_eq!(r.used(), 8);
        assert!(!r.is_patching());
        assert_eq!(r.bytes(), &[0xAA, 0xAA, 0x11, 0x22, 0xAA, 0xAA, 0xAA, 0xAA]);
    }

    #[test]
    fn test_patch_cursor_restores_on_panic() {
        let mut r = region();
        r.emit_bytes(&[0; 4]);
        let base = r.base();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut cursor = r.patch_cursor(base + 2);
            // Four bytes from offset 2 would overrun the saved frontier.
            cursor.emit_bytes(&[1, 2, 3, 4]);
        }));
        assert!(result.is_err());
        assert_eq!(r.used(), 4);
        assert!(!r.is_patching());
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn test_region_overflow_is_fatal() {
        let mut r = region();
        let cap = r.capacity();
        r.emit_bytes(&vec![0xCC; cap]);
        r.emit_u8(0);
    }

    #[test]
    fn test_code_blocks_are_adjacent() {
        let blocks = CodeBlocks::new(4096, 8192, Protection::ReadWriteExecute).unwrap();
        assert_eq!(blocks.stubs.base(), blocks.main.base() + blocks.main.capacity());
        assert_eq!(blocks.stubs.capacity(), 8192);
    }

    #[test]
    fn test_code_blocks_partition_the_mapping() {
        let blocks = CodeBlocks::new(4096, 4096, Protection::ReadWriteExecute).unwrap();
        let main = blocks.get(RegionId::Main);
        let stubs = blocks.get(RegionId::Stubs);
        assert!(main.contains(main.base()));
        assert!(!main.contains(stubs.base()));
        assert!(stubs.contains(stubs.base() + 8));
        assert_eq!(stubs.name(), "stubs");
    }

    #[test]
    fn test_wx_seal_and_unseal() {
        let mut r = CodeRegion::new("wx", 4096, Protection::WriteXorExecute).unwrap();
        r.emit_u8(0xC3);
        r.make_executable().unwrap();
        assert!(r.is_executable());
        assert_eq!(r.read(r.base(), 1), &[0xC3]);
        r.make_writable().unwrap();
        r.emit_u8(0xC3);
        assert_eq!(r.used(), 2);
    }
}
