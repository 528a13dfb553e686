//! Sync points for the unwinder.
//!
//! When native code called from a translation needs to walk or unwind the VM
//! stack, it looks up its return address here to recover the bytecode offset
//! and stack depth that were current at the call.

use rustc_hash::FxHashMap;

use crate::translator::func::Func;

/// VM state recoverable at a native return address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fixup {
    /// Bytecode offset relative to the function entry.
    pub pc_offset: i32,
    /// Stack depth in cells relative to the frame.
    pub sp_offset: i32,
}

impl Fixup {
    #[inline]
    pub const fn new(pc_offset: i32, sp_offset: i32) -> Self {
        Fixup {
            pc_offset,
            sp_offset,
        }
    }
}

/// Storage for sync points.
pub trait FixupMap: Send {
    /// Whether calls into `func` must publish VM registers eagerly instead
    /// of relying on a recorded sync point.
    fn eager_record(&self, func: &Func) -> bool;

    /// Record the state current at the native return address `addr`.
    fn record_sync_point(&mut self, addr: usize, fixup: Fixup);
}

type EagerPredicate = Box<dyn Fn(&Func) -> bool + Send>;

/// In-memory [`FixupMap`] keyed by return address.
pub struct FixupTable {
    entries: FxHashMap<usize, Fixup>,
    eager: EagerPredicate,
}

impl FixupTable {
    /// A table that never asks for eager sync points.
    pub fn new() -> Self {
        Self::with_eager(|_| false)
    }

    /// A table using `eager` to decide which callees need eager sync points.
    pub fn with_eager(eager: impl Fn(&Func) -> bool + Send + 'static) -> Self {
        FixupTable {
            entries: FxHashMap::default(),
            eager: Box::new(eager),
        }
    }

    pub fn lookup(&self, addr: usize) -> Option<Fixup> {
        self.entries.get(&addr).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FixupTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FixupTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixupTable")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl FixupMap for FixupTable {
    fn eager_record(&self, func: &Func) -> bool {
        (self.eager)(func)
    }

    fn record_sync_point(&mut self, addr: usize, fixup: Fixup) {
        // A return address identifies exactly one call site.
        let prev = self.entries.insert(addr, fixup);
        debug_assert!(
            prev.is_none_or(|p| p == fixup),
            "conflicting sync points at {addr:#x}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::func::FuncId;

    #[test]
    fn test_record_and_lookup() {
        let mut table = FixupTable::new();
        assert!(table.is_empty());
        table.record_sync_point(0x1000, Fixup::new(0, 3));
        assert_eq!(table.lookup(0x1000), Some(Fixup::new(0, 3)));
        assert_eq!(table.lookup(0x1001), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_eager_predicate() {
        let table = FixupTable::with_eager(|f| f.full_name.starts_with("eager_"));
        assert!(table.eager_record(&Func::new(FuncId(0), "eager_count", 0)));
        assert!(!table.eager_record(&Func::new(FuncId(1), "count", 0)));
        assert!(!FixupTable::default().eager_record(&Func::new(FuncId(2), "eager_x", 0)));
    }
}
