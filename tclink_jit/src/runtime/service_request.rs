//! Service requests: descriptors of deferred bind actions.
//!
//! A stub that reaches the runtime carries a [`ServiceRequestKind`] and a
//! [`RequestId`]. The id names an immutable [`ServiceRequest`] in the
//! session's [`RequestArena`], which holds everything the resolver needs to
//! finish the bind.
//!
//! The arena is append-only. Descriptors are written once, before any stub
//! referencing them is emitted, and are reclaimed only when the arena is
//! dropped with its session.

use std::fmt;

use parking_lot::RwLock;

use crate::backend::x64::encoder::Condition;
use crate::translator::func::SrcKey;

// =============================================================================
// Request Kinds
// =============================================================================

/// What a stub asks the runtime to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServiceRequestKind {
    /// Bind an unconditional jump. Uses a single-use stub.
    BindJmp = 0,
    /// Bind a conditional jump. Uses a persistent stub.
    BindJcc = 1,
    /// Bind a conditional exit out of a translation.
    BindSideExit = 2,
    /// Bind a call to a possibly uncompiled callee.
    BindCall = 3,
}

impl ServiceRequestKind {
    /// Convert from the raw value generated code passes in `rdi`.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ServiceRequestKind::BindJmp),
            1 => Some(ServiceRequestKind::BindJcc),
            2 => Some(ServiceRequestKind::BindSideExit),
            3 => Some(ServiceRequestKind::BindCall),
            _ => None,
        }
    }

    /// Whether requests of this kind are served by a single-use stub.
    #[inline]
    pub const fn is_ephemeral(self) -> bool {
        matches!(self, ServiceRequestKind::BindJmp)
    }

    /// Whether this kind binds a jump (as opposed to a call).
    #[inline]
    pub const fn is_jump(self) -> bool {
        !matches!(self, ServiceRequestKind::BindCall)
    }

    pub const fn name(self) -> &'static str {
        match self {
            ServiceRequestKind::BindJmp => "bind_jmp",
            ServiceRequestKind::BindJcc => "bind_jcc",
            ServiceRequestKind::BindSideExit => "bind_side_exit",
            ServiceRequestKind::BindCall => "bind_call",
        }
    }
}

impl fmt::Display for ServiceRequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Descriptors
// =============================================================================

/// Payload of a jump-style bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindJumpReq {
    pub kind: ServiceRequestKind,
    /// Address of the smashable jmp/jcc.
    pub to_smash: usize,
    /// Logical destination.
    pub dest: SrcKey,
    /// Condition of a jcc site; `None` for an unconditional jump.
    pub cc: Option<Condition>,
}

/// Payload of a call bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindCallReq {
    /// Address of the smashable call.
    pub to_smash: usize,
    /// Number of arguments pushed by the caller.
    pub n_args: u32,
    /// The call instruction that produced this site.
    pub source_instr: SrcKey,
    /// Whether the callee was statically known when the site was emitted.
    pub is_immutable: bool,
}

/// A service-request descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRequest {
    Jump(BindJumpReq),
    Call(BindCallReq),
}

impl ServiceRequest {
    #[inline]
    pub fn kind(&self) -> ServiceRequestKind {
        match self {
            ServiceRequest::Jump(req) => req.kind,
            ServiceRequest::Call(_) => ServiceRequestKind::BindCall,
        }
    }

    /// Address of the site the request will patch.
    #[inline]
    pub fn to_smash(&self) -> usize {
        match self {
            ServiceRequest::Jump(req) => req.to_smash,
            ServiceRequest::Call(req) => req.to_smash,
        }
    }

    pub fn as_jump(&self) -> Option<&BindJumpReq> {
        match self {
            ServiceRequest::Jump(req) => Some(req),
            ServiceRequest::Call(_) => None,
        }
    }

    pub fn as_call(&self) -> Option<&BindCallReq> {
        match self {
            ServiceRequest::Call(req) => Some(req),
            ServiceRequest::Jump(_) => None,
        }
    }
}

/// Index of a descriptor in its arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u32);

impl RequestId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        RequestId(raw)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

// =============================================================================
// Arena
// =============================================================================

/// Descriptors per chunk.
const CHUNK_LEN: usize = 256;

/// Append-only storage for service-request descriptors.
///
/// Storage grows chunk by chunk; a full chunk is never reallocated, so an
/// entry keeps its slot for the arena's lifetime.
#[derive(Debug)]
pub struct RequestArena {
    chunks: RwLock<Vec<Vec<ServiceRequest>>>,
    capacity: usize,
}

impl RequestArena {
    /// Create an arena that holds at most `capacity` descriptors.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity <= u32::MAX as usize, "arena capacity too large");
        RequestArena {
            chunks: RwLock::new(Vec::new()),
            capacity,
        }
    }

    /// Append a descriptor.
    ///
    /// # Panics
    /// Panics when the arena is full.
    pub fn alloc(&self, req: ServiceRequest) -> RequestId {
        let mut chunks = self.chunks.write();
        let len = Self::count(&chunks);
        assert!(
            len < self.capacity,
            "service request arena exhausted ({} descriptors)",
            self.capacity
        );

        match chunks.last_mut() {
            Some(chunk) if chunk.len() < CHUNK_LEN => chunk.push(req),
            _ => {
                let mut chunk = Vec::with_capacity(CHUNK_LEN);
                chunk.push(req);
                chunks.push(chunk);
            }
        }

        let id = RequestId(len as u32);
        tracing::trace!(
            %id,
            kind = %req.kind(),
            to_smash = format_args!("{:#x}", req.to_smash()),
            "allocated service request"
        );
        id
    }

    /// Look up a descriptor.
    pub fn get(&self, id: RequestId) -> Option<ServiceRequest> {
        let chunks = self.chunks.read();
        chunks
            .get(id.index() / CHUNK_LEN)
            .and_then(|chunk| chunk.get(id.index() % CHUNK_LEN))
            .copied()
    }

    /// Number of descriptors allocated so far.
    pub fn len(&self) -> usize {
        Self::count(&self.chunks.read())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn count(chunks: &[Vec<ServiceRequest>]) -> usize {
        match chunks.last() {
            Some(last) => (chunks.len() - 1) * CHUNK_LEN + last.len(),
            None => 0,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
