//! The state one compilation session threads through every bind operation.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::backend::x64::memory::{CodeBlocks, CodeRegion};
use crate::config::BindConfig;
use crate::error::RegionError;
use crate::runtime::fixup::{FixupMap, FixupTable};
use crate::runtime::resolver::ServiceRequestHandler;
use crate::runtime::ring_buffer::EventRing;
use crate::runtime::service_request::RequestArena;
use crate::runtime::stubs::FreeStubList;

/// Identity of a translation, used to attribute smashable jumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransId(pub u32);

/// Code regions, descriptor arena, fixups and configuration for one
/// compilation session.
///
/// Emission takes `&mut LinkSession`, so a session has a single emitting
/// thread. The arena, free-stub list and ring are shared with the
/// [`ServiceRequestHandler`] that serves requests from the session's code.
pub struct LinkSession<F: FixupMap = FixupTable> {
    pub(crate) blocks: CodeBlocks,
    pub(crate) arena: Arc<RequestArena>,
    pub(crate) free_stubs: Arc<FreeStubList>,
    pub(crate) fixups: F,
    pub(crate) config: BindConfig,
    pub(crate) ring: Arc<EventRing>,
    handler: Arc<ServiceRequestHandler>,
    pub(crate) jmp_trans_ids: FxHashMap<usize, TransId>,
    pub(crate) cur_trans: Option<TransId>,
}

impl LinkSession<FixupTable> {
    /// Map the code regions described by `config` with an empty fixup table.
    pub fn new(config: BindConfig) -> Result<Self, RegionError> {
        Self::with_fixups(config, FixupTable::new())
    }
}

impl<F: FixupMap> LinkSession<F> {
    /// Map the code regions described by `config`, recording sync points
    /// into `fixups`.
    pub fn with_fixups(config: BindConfig, fixups: F) -> Result<Self, RegionError> {
        let blocks = CodeBlocks::new(
            config.main_capacity,
            config.stubs_capacity,
            config.region_protection,
        )?;
        let arena = Arc::new(RequestArena::new(config.arena_capacity));
        let free_stubs = Arc::new(FreeStubList::new());
        let handler = Arc::new(ServiceRequestHandler::new(
            arena.clone(),
            free_stubs.clone(),
            config.region_protection,
        ));
        let ring = Arc::new(EventRing::new(config.ring_capacity));

        tracing::debug!(
            main = format_args!("{:#x}", blocks.main.base()),
            stubs = format_args!("{:#x}", blocks.stubs.base()),
            protection = ?config.region_protection,
            "link session ready"
        );

        Ok(LinkSession {
            blocks,
            arena,
            free_stubs,
            fixups,
            config,
            ring,
            handler,
            jmp_trans_ids: FxHashMap::default(),
            cur_trans: None,
        })
    }

    #[inline]
    pub fn config(&self) -> &BindConfig {
        &self.config
    }

    #[inline]
    pub fn blocks(&self) -> &CodeBlocks {
        &self.blocks
    }

    #[inline]
    pub fn blocks_mut(&mut self) -> &mut CodeBlocks {
        &mut self.blocks
    }

    #[inline]
    pub fn main(&self) -> &CodeRegion {
        &self.blocks.main
    }

    #[inline]
    pub fn stubs(&self) -> &CodeRegion {
        &self.blocks.stubs
    }

    #[inline]
    pub fn arena(&self) -> &Arc<RequestArena> {
        &self.arena
    }

    #[inline]
    pub fn free_stubs(&self) -> &Arc<FreeStubList> {
        &self.free_stubs
    }

    #[inline]
    pub fn fixups(&self) -> &F {
        &self.fixups
    }

    #[inline]
    pub fn fixups_mut(&mut self) -> &mut F {
        &mut self.fixups
    }

    #[inline]
    pub fn ring(&self) -> &Arc<EventRing> {
        &self.ring
    }

    /// The handler serving requests raised by this session's stubs.
    #[inline]
    pub fn handler(&self) -> Arc<ServiceRequestHandler> {
        self.handler.clone()
    }

    /// Attribute subsequently emitted smashable jumps to `id`.
    pub fn begin_translation(&mut self, id: TransId) {
        self.cur_trans = Some(id);
    }

    pub fn end_translation(&mut self) {
        self.cur_trans = None;
    }

    /// The translation that emitted the smashable jump at `addr`.
    pub fn jmp_trans_id(&self, addr: usize) -> Option<TransId> {
        self.jmp_trans_ids.get(&addr).copied()
    }

    /// Make both regions executable (no-op unless mapped W^X).
    pub fn seal(&mut self) -> Result<(), RegionError> {
        self.blocks.main.make_executable()?;
        self.blocks.stubs.make_executable()
    }

    /// Make both regions writable again for further emission.
    pub fn unseal(&mut self) -> Result<(), RegionError> {
        self.blocks.main.make_writable()?;
        self.blocks.stubs.make_writable()
    }
}

impl<F: FixupMap> std::fmt::Debug for LinkSession<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSession")
            .field("blocks", &self.blocks)
            .field("requests", &self.arena.len())
            .field("free_stubs", &self.free_stubs.len())
            .field("cur_trans", &self.cur_trans)
            .finish()
    }
}
