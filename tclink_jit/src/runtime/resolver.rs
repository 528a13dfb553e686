//! The runtime side of a service request.
//!
//! When a stub reaches the runtime, the embedder's entry point hands the
//! request registers to [`ServiceRequestHandler::handle`]. The handler
//! looks up the descriptor, asks the embedder's [`DestinationResolver`]
//! where control should go, and smashes the originating site so later
//! executions skip the stub. Transferring control to the returned target is
//! left to the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::backend::x64::memory::Protection;
use crate::codegen::patcher::Patcher;
use crate::error::PatchError;
use crate::runtime::service_request::{
    BindCallReq, BindJumpReq, RequestArena, RequestId, ServiceRequest, ServiceRequestKind,
};
use crate::runtime::stubs::FreeStubList;

// =============================================================================
// Resolver Policy
// =============================================================================

/// Outcome of resolving a call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallResolution {
    /// Where the call should go, if anywhere yet.
    pub target: Option<usize>,
    /// Whether the call site may be smashed to `target`.
    pub patch: bool,
}

/// Decides where bound transfers go. Implemented by the embedder.
///
/// The handler holds no lock while calling into the resolver, so a resolver
/// may compile code and serve nested requests through the same handler.
/// Threads racing on one jump stub may each resolve it; the first to finish
/// smashes the site and the others are handed its target.
pub trait DestinationResolver {
    /// Address of translated code for the jump's destination, compiling it
    /// if needed. `None` leaves the site pointing at its stub.
    fn resolve_jump(&self, req: &BindJumpReq) -> Option<usize>;

    /// Resolve a call site given the callee's ActRec.
    fn resolve_call(&self, req: &BindCallReq, stashed_ar: usize) -> CallResolution;
}

/// Result of handling one service request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Control continues at `target`.
    Bound { target: usize },
    /// The resolver had no destination; the site is unchanged.
    Unresolved,
    /// The descriptor was already served and its site smashed to `target`.
    /// A thread that entered the stub before the smash continues there.
    AlreadyBound { target: usize },
}

// =============================================================================
// Handler
// =============================================================================

/// Serves service requests for one link session.
#[derive(Debug)]
pub struct ServiceRequestHandler {
    arena: Arc<RequestArena>,
    free_stubs: Arc<FreeStubList>,
    patcher: Patcher,
    /// Jump descriptors whose site has been smashed, with the target.
    bound: Mutex<FxHashMap<RequestId, usize>>,
    handled: AtomicU64,
}

impl ServiceRequestHandler {
    pub fn new(
        arena: Arc<RequestArena>,
        free_stubs: Arc<FreeStubList>,
        protection: Protection,
    ) -> Self {
        Self {
            arena,
            free_stubs,
            patcher: Patcher::new(protection),
            bound: Mutex::new(FxHashMap::default()),
            handled: AtomicU64::new(0),
        }
    }

    /// Serve a request with the registers a stub loaded.
    ///
    /// # Panics
    /// Panics if `id` does not name a descriptor of `kind`.
    pub fn handle(
        &self,
        kind: ServiceRequestKind,
        id: RequestId,
        aux: usize,
        resolver: &dyn DestinationResolver,
    ) -> Result<Resolution, PatchError> {
        let Some(req) = self.arena.get(id) else {
            panic!("service request {id} does not exist");
        };
        assert_eq!(
            req.kind(),
            kind,
            "service request {id} is a {} request, stub claimed {kind}",
            req.kind()
        );
        self.handled.fetch_add(1, Ordering::Relaxed);

        match req {
            ServiceRequest::Jump(jump) => self.handle_jump(id, &jump, aux, resolver),
            ServiceRequest::Call(call) => self.handle_call(id, &call, aux, resolver),
        }
    }

    fn handle_jump(
        &self,
        id: RequestId,
        req: &BindJumpReq,
        stub: usize,
        resolver: &dyn DestinationResolver,
    ) -> Result<Resolution, PatchError> {
        if let Some(target) = self.bound_target(id) {
            tracing::trace!(
                %id,
                target = format_args!("{target:#x}"),
                "service request already bound"
            );
            return Ok(Resolution::AlreadyBound { target });
        }

        let Some(target) = resolver.resolve_jump(req) else {
            tracing::debug!(%id, dest = %req.dest, "jump destination unresolved");
            return Ok(Resolution::Unresolved);
        };

        let mut bound = self.bound.lock();
        if let Some(&winner) = bound.get(&id) {
            // Another thread bound the site while we were resolving.
            return Ok(Resolution::AlreadyBound { target: winner });
        }
        // SAFETY: `to_smash` was recorded when the site was emitted into a
        // code region that outlives its descriptors.
        unsafe {
            match req.cc {
                Some(_) => self.patcher.smash_jcc(req.to_smash, target)?,
                None => self.patcher.smash_jmp(req.to_smash, target)?,
            }
        }
        bound.insert(id, target);
        drop(bound);

        // The site no longer reaches the single-use stub.
        if req.kind.is_ephemeral() {
            self.free_stubs.retire(stub);
        }

        tracing::debug!(
            %id,
            kind = %req.kind,
            to_smash = format_args!("{:#x}", req.to_smash),
            target = format_args!("{target:#x}"),
            "bound jump"
        );
        Ok(Resolution::Bound { target })
    }

    fn handle_call(
        &self,
        id: RequestId,
        req: &BindCallReq,
        stashed_ar: usize,
        resolver: &dyn DestinationResolver,
    ) -> Result<Resolution, PatchError> {
        let resolution = resolver.resolve_call(req, stashed_ar);
        let Some(target) = resolution.target else {
            tracing::debug!(%id, "call destination unresolved");
            return Ok(Resolution::Unresolved);
        };

        if resolution.patch {
            // SAFETY: `to_smash` was recorded when the call was emitted.
            unsafe { self.patcher.smash_call(req.to_smash, target)? };
        }

        tracing::debug!(
            %id,
            to_smash = format_args!("{:#x}", req.to_smash),
            target = format_args!("{target:#x}"),
            patched = resolution.patch,
            immutable = req.is_immutable,
            "bound call"
        );
        Ok(Resolution::Bound { target })
    }

    /// Whether the jump descriptor `id` has been served.
    pub fn is_consumed(&self, id: RequestId) -> bool {
        self.bound.lock().contains_key(&id)
    }

    /// Where the jump descriptor `id` was bound, if it has been served.
    pub fn bound_target(&self, id: RequestId) -> Option<usize> {
        self.bound.lock().get(&id).copied()
    }

    /// Requests handled so far, including unresolved and repeated ones.
    pub fn handled_count(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    pub fn patcher(&self) -> &Patcher {
        &self.patcher
    }
}

// =============================================================================
// Tests
// =============================================================================
