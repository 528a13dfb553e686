//! Service-request stubs.
//!
//! A stub loads a service request into the argument registers and jumps to
//! the runtime's service-request entry:
//!
//! ```text
//! mov edi, <kind>          ; BF imm32
//! mov esi, <request id>    ; BE imm32
//! mov rdx, <aux>           ; register, immediate, or xor edx, edx
//! mov r10, <entry>
//! jmp r10
//! ```
//!
//! The auxiliary word is the stashed ActRec for call binds and the stub's
//! own address for single-use stubs, so the runtime can hand the slot back
//! to the [`FreeStubList`] once the request is served.

use parking_lot::Mutex;
use smallvec::{SmallVec, smallvec};

use crate::backend::x64::assembler::Assembler;
use crate::backend::x64::encoder::encode_int3;
use crate::backend::x64::memory::CodeRegion;
use crate::backend::x64::registers::{Gpr, SERVICE_REQ_ARG_REGS};
use crate::config::RuntimeHooks;
use crate::runtime::service_request::{RequestId, ServiceRequestKind};

/// Size of every single-use stub slot. Slots are padded with `int3` so a
/// recycled slot can be rewritten in place.
pub const EPHEMERAL_STUB_SIZE: usize = 64;

// =============================================================================
// Stub Arguments
// =============================================================================

/// A value loaded into a service-request argument register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubArg {
    /// Always encoded as a full `mov r32, imm32`.
    Imm32(u32),
    /// Encoded in the shortest form.
    Imm(u64),
    Reg(Gpr),
}

/// Emit a persistent stub at the region frontier and return its address.
pub fn emit_service_req(
    stubs: &mut CodeRegion,
    hooks: &RuntimeHooks,
    kind: ServiceRequestKind,
    id: RequestId,
    aux: StubArg,
) -> usize {
    let mut asm = Assembler::new(stubs);
    let start = asm.frontier();
    emit_service_req_body(&mut asm, hooks, kind, id, aux);
    start
}

/// Emit the request-loading tail of a stub at the assembler's frontier.
///
/// Callers that need extra setup (the bind-call stub pops its return
/// address first) emit it and then call this.
pub fn emit_service_req_body(
    asm: &mut Assembler<'_>,
    hooks: &RuntimeHooks,
    kind: ServiceRequestKind,
    id: RequestId,
    aux: StubArg,
) {
    let [kind_reg, id_reg, aux_reg] = SERVICE_REQ_ARG_REGS;
    let args: SmallVec<[(Gpr, StubArg); 3]> = smallvec![
        (kind_reg, StubArg::Imm32(kind as u32)),
        (id_reg, StubArg::Imm32(id.as_u32())),
        (aux_reg, aux),
    ];
    for (reg, arg) in args {
        match arg {
            StubArg::Imm32(v) => asm.mov_ri32(reg, v),
            StubArg::Imm(v) => asm.mov_ri(reg, v as i64),
            StubArg::Reg(src) => asm.mov_rr(reg, src),
        }
    }

    asm.jmp_abs(hooks.service_request_entry);
}

/// Emit a single-use stub into a recycled slot, or at the frontier when no
/// slot is free. Returns the stub address.
pub fn emit_ephemeral_service_req(
    stubs: &mut CodeRegion,
    free: &FreeStubList,
    hooks: &RuntimeHooks,
    kind: ServiceRequestKind,
    id: RequestId,
) -> usize {
    let start = free.take().unwrap_or_else(|| stubs.frontier());

    if start == stubs.frontier() {
        write_ephemeral(stubs, start, hooks, kind, id);
    } else {
        debug_assert!(stubs.contains(start));
        let mut cursor = stubs.patch_cursor(start);
        write_ephemeral(&mut cursor, start, hooks, kind, id);
    }

    tracing::trace!(
        stub = format_args!("{start:#x}"),
        %id,
        "emitted ephemeral stub"
    );
    start
}

fn write_ephemeral(
    region: &mut CodeRegion,
    start: usize,
    hooks: &RuntimeHooks,
    kind: ServiceRequestKind,
    id: RequestId,
) {
    let mut asm = Assembler::new(region);
    emit_service_req_body(&mut asm, hooks, kind, id, StubArg::Imm(start as u64));
    let used = asm.frontier() - start;
    assert!(used <= EPHEMERAL_STUB_SIZE, "ephemeral stub overflows its slot");
    for _ in used..EPHEMERAL_STUB_SIZE {
        asm.emit(&encode_int3());
    }
}

/// Read back the request kind and id a stub loads.
///
/// Returns `None` if `bytes` does not start like a service-request stub.
pub fn decode_stub_header(bytes: &[u8]) -> Option<(ServiceRequestKind, RequestId)> {
    if bytes.len() < 10 || bytes[0] != 0xBF || bytes[5] != 0xBE {
        return None;
    }
    let kind = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    let id = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
    let kind = ServiceRequestKind::from_u8(u8::try_from(kind).ok()?)?;
    Some((kind, RequestId::from_raw(id)))
}

// =============================================================================
// Free Stub List
// =============================================================================

/// Retired single-use stub slots, ready for reuse.
#[derive(Debug, Default)]
pub struct FreeStubList {
    slots: Mutex<Vec<usize>>,
}

impl FreeStubList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a free slot, most recently retired first.
    pub fn take(&self) -> Option<usize> {
        self.slots.lock().pop()
    }

    /// Return a slot whose stub can no longer be reached.
    pub fn retire(&self, addr: usize) {
        let mut slots = self.slots.lock();
        debug_assert!(!slots.contains(&addr), "stub {addr:#x} retired twice");
        slots.push(addr);
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
