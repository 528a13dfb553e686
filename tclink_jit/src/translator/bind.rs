//! Lazy binding of jumps and calls.
//!
//! A bound transfer is emitted as a smashable `jmp`/`jcc`/`call` whose
//! first target is a service-request stub in the stubs region. When control
//! reaches the stub, the runtime resolves the real destination and smashes
//! the site (see [`crate::runtime::resolver`]).
//!
//! # Jumps
//! ```text
//! main:   jmp  stub            ; 5 bytes, or jcc: 6 bytes
//! stubs:  mov  edi, BindJmp
//!         mov  esi, <request>
//!         mov  rdx, <stub>     ; single-use stubs name themselves
//!         mov  r10, <entry>
//!         jmp  r10
//! ```
//!
//! # Calls
//! ```text
//! main:   lea  r15, [rbx + args]       ; callee ActRec
//!         call stub                    ; 5 bytes, smashable
//! stubs:  pop  qword [r15 + saved_rip] ; return address into the ActRec
//!         ...service request BindCall, rdx = r15
//! ```
//!
//! Calls to builtins whose arguments need no adaptation skip all of this
//! and call the native implementation inline.

use crate::backend::x64::assembler::Assembler;
use crate::backend::x64::encoder::Condition;
use crate::backend::x64::memory::RegionId;
use crate::backend::x64::registers::{
    CallingConvention, Gpr, SCRATCH, STASHED_AR, VM_FP, VM_SP, VM_TL, mem,
};
use crate::codegen::patcher::{CALL_LEN, SmashKind, StoreImmPatcher, prepare_for_smash};
use crate::config::VmStateLayout;
use crate::runtime::fixup::{Fixup, FixupMap};
use crate::runtime::ring_buffer::{RingEventKind, emit_rb, intern_msg};
use crate::runtime::service_request::{
    BindCallReq, BindJumpReq, RequestId, ServiceRequest, ServiceRequestKind,
};
use crate::runtime::stubs::{
    StubArg, emit_ephemeral_service_req, emit_service_req, emit_service_req_body,
};
use crate::translator::func::{
    AR_SAVED_RBP, AR_SAVED_RIP, AR_SIZE, CELL_SIZE, Func, NATIVE_IMPL_LEN, Opcode, SrcKey,
    cells_to_bytes,
};
use crate::translator::session::LinkSession;

/// Stored into a return-address slot that will be filled lazily, so an
/// accidental use stands out in a core dump.
pub const UNINITIALIZED_RIP: u64 = 0xba5e_ba11_acc0_1ade;

// =============================================================================
// Jumps
// =============================================================================

/// Where a bound jump ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundBranch {
    /// Address of the smashable site.
    pub to_smash: usize,
    /// Address of the stub the site initially targets.
    pub stub: usize,
    /// Descriptor raised by the stub.
    pub request: RequestId,
}

/// Emit an unconditional jump to `dest` in `src`, bound on first use.
pub fn emit_bind_jmp<F: FixupMap>(
    s: &mut LinkSession<F>,
    src: RegionId,
    dest: SrcKey,
) -> BoundBranch {
    emit_bind_j(s, src, None, dest, ServiceRequestKind::BindJmp)
}

/// Emit a conditional jump to `dest` in `src`, bound on first use.
pub fn emit_bind_jcc<F: FixupMap>(
    s: &mut LinkSession<F>,
    src: RegionId,
    cc: Condition,
    dest: SrcKey,
) -> BoundBranch {
    emit_bind_j(s, src, Some(cc), dest, ServiceRequestKind::BindJcc)
}

/// Emit a conditional exit from the current translation to `dest`.
pub fn emit_bind_side_exit<F: FixupMap>(
    s: &mut LinkSession<F>,
    src: RegionId,
    cc: Condition,
    dest: SrcKey,
) -> BoundBranch {
    emit_bind_j(s, src, Some(cc), dest, ServiceRequestKind::BindSideExit)
}

/// Emit a smashable jump (`cc == None`) or jcc in `src` whose first target
/// is a stub raising a `kind` request for `dest`.
///
/// `BindJmp` requests get a single-use stub; other kinds get a persistent
/// one. When `src` is the stubs region itself, a placeholder is laid down
/// first so the stub cannot be emitted over the site, and the site is then
/// rewritten in place.
pub fn emit_bind_j<F: FixupMap>(
    s: &mut LinkSession<F>,
    src: RegionId,
    cc: Option<Condition>,
    dest: SrcKey,
    kind: ServiceRequestKind,
) -> BoundBranch {
    assert!(kind.is_jump(), "{kind} is not a jump request");
    let width = SmashKind::for_jump(cc).width();
    let same_region = src == RegionId::Stubs;

    let to_smash = prepare_for_smash(s.blocks.get_mut(src), width);
    if same_region {
        Assembler::new(&mut s.blocks.stubs).jmp_or_jcc(cc, to_smash);
    }

    if let Some(trans) = s.cur_trans {
        s.jmp_trans_ids.insert(to_smash, trans);
    }

    let request = s.arena.alloc(ServiceRequest::Jump(BindJumpReq {
        kind,
        to_smash,
        dest,
        cc,
    }));

    let hooks = &s.config.hooks;
    let stub = if kind.is_ephemeral() {
        emit_ephemeral_service_req(&mut s.blocks.stubs, &s.free_stubs, hooks, kind, request)
    } else {
        emit_service_req(&mut s.blocks.stubs, hooks, kind, request, StubArg::Imm(0))
    };

    if same_region {
        let mut cursor = s.blocks.stubs.patch_cursor(to_smash);
        Assembler::new(&mut cursor).jmp_or_jcc(cc, stub);
    } else {
        let region = s.blocks.get_mut(src);
        debug_assert_eq!(region.frontier(), to_smash);
        Assembler::new(region).jmp_or_jcc(cc, stub);
    }

    tracing::debug!(
        %kind,
        %dest,
        to_smash = format_args!("{to_smash:#x}"),
        stub = format_args!("{stub:#x}"),
        "emitted bind jump"
    );

    BoundBranch {
        to_smash,
        stub,
        request,
    }
}

// =============================================================================
// Native Implementations
// =============================================================================

/// Whether a call to `funcd` with `n_args` arguments can call the native
/// implementation inline.
pub fn is_native_impl_call(funcd: Option<&Func>, n_args: u32) -> bool {
    funcd.is_some_and(|f| f.is_builtin() && n_args == f.num_params)
}

/// Bytes to pop off the VM stack when returning from a builtin frame.
fn builtin_frame_bytes(func: &Func) -> i32 {
    // The return value overwrites the first local.
    AR_SIZE + cells_to_bytes(func.num_slots_in_frame()) - CELL_SIZE as i32
}

/// Emit a call to `func`'s native implementation with the callee frame in
/// `VM_FP`.
///
/// With `emit_saved_rip_return` the frame is popped and the code returns to
/// the saved return address; nothing may follow and 0 is returned.
/// Otherwise only the frame pointer is restored and the number of bytes
/// `VM_SP` must still be adjusted by is returned, so the caller can fold it
/// into its own adjustment.
///
/// # Panics
/// Panics unless `func` is a builtin whose body is the single native-call
/// bytecode and whose frame holds nothing but its parameters.
pub fn emit_native_impl<F: FixupMap>(
    s: &mut LinkSession<F>,
    func: &Func,
    emit_saved_rip_return: bool,
) -> i32 {
    let Some(builtin) = func.builtin else {
        panic!("{} has no native implementation", func.full_name);
    };
    assert_eq!(func.num_iterators, 0, "builtin {} has iterators", func.full_name);
    assert_eq!(
        func.num_locals, func.num_params,
        "builtin {} has non-parameter locals",
        func.full_name
    );
    assert_eq!(func.entry_op, Opcode::NativeImpl);
    assert_eq!(
        func.body_len, NATIVE_IMPL_LEN,
        "builtin {} body is more than one instruction",
        func.full_name
    );

    tracing::trace!(
        func = %func.full_name,
        builtin = format_args!("{:#x}", builtin.addr()),
        "calling builtin"
    );

    let cc = CallingConvention::host();
    let eager = s.fixups.eager_record(func);
    let layout = s.config.vm_layout;

    let mut a = Assembler::new(&mut s.blocks.main);
    a.mov_rr(cc.int_arg_regs()[0], VM_FP);
    if eager {
        emit_eager_sync_point(&mut a, &layout, func.entry_pc, 0);
    }
    let ret_addr = a.call_native(cc, builtin.addr());

    // The builtin's body is one instruction with no non-argument locals.
    s.fixups
        .record_sync_point(ret_addr, Fixup::new(0, func.num_locals as i32));

    let frame_bytes = builtin_frame_bytes(func);
    let mut a = Assembler::new(&mut s.blocks.main);
    if emit_saved_rip_return {
        a.push_m(mem(VM_FP, AR_SAVED_RIP));
        a.add_ri(VM_SP, frame_bytes);
    }
    a.mov_rm(VM_FP, mem(VM_FP, AR_SAVED_RBP));
    emit_rb(
        &mut a,
        &s.config,
        &s.ring,
        RingEventKind::FuncExit,
        intern_msg(&func.full_name),
    );

    if emit_saved_rip_return {
        a.ret();
        a.ud2();
        return 0;
    }
    frame_bytes
}

/// Publish the VM registers so the runtime can inspect the frame without a
/// sync-point lookup. Clobbers [`SCRATCH`].
pub fn emit_eager_sync_point(
    a: &mut Assembler<'_>,
    layout: &VmStateLayout,
    pc: usize,
    sp_diff: i32,
) {
    a.mov_mr(mem(VM_TL, layout.vmfp), VM_FP);
    a.lea(SCRATCH, mem(VM_SP, sp_diff));
    a.mov_mr(mem(VM_TL, layout.vmsp), SCRATCH);
    a.mov_ri(SCRATCH, pc as i64);
    a.mov_mr(mem(VM_TL, layout.vmpc), SCRATCH);
}

/// Test the surprise flags on function entry and divert to the runtime's
/// function-enter helper when any is set.
///
/// The helper is called from the stubs region with the callee frame as its
/// argument; `fixup` is recorded at its return address.
pub fn emit_check_surprise_flags_enter<F: FixupMap>(s: &mut LinkSession<F>, fixup: Fixup) {
    let flags = mem(VM_TL, s.config.vm_layout.condition_flags);
    let cold = s.blocks.stubs.frontier();

    let mut a = Assembler::new(&mut s.blocks.main);
    a.test_mi32(flags, -1);
    a.jcc_to(Condition::NotEqual, cold);
    let resume = a.frontier();

    let cc = CallingConvention::host();
    let mut astubs = Assembler::new(&mut s.blocks.stubs);
    astubs.mov_rr(cc.int_arg_regs()[0], VM_FP);
    let ret_addr = astubs.call_native(cc, s.config.hooks.function_enter_helper);
    astubs.jmp_to(resume);

    s.fixups.record_sync_point(ret_addr, fixup);
}

// =============================================================================
// Calls
// =============================================================================

/// Emit a call from the main region to `funcd` (or to a callee only known
/// at run time when `None`), whose `n_args` arguments and ActRec are
/// already on the VM stack.
///
/// Returns the number of bytes the caller must still pop from `VM_SP`
/// after the call returns; only the inline native path leaves any.
pub fn emit_bind_call<F: FixupMap>(
    s: &mut LinkSession<F>,
    source_instr: SrcKey,
    funcd: Option<&Func>,
    n_args: u32,
) -> i32 {
    let ar_offset = cells_to_bytes(n_args);

    if let Some(func) = funcd.filter(|f| is_native_impl_call(Some(*f), n_args)) {
        let patch_ip = StoreImmPatcher::new(
            &mut Assembler::new(&mut s.blocks.main),
            mem(VM_SP, ar_offset + AR_SAVED_RIP),
            Gpr::Rax,
        );
        assert_eq!(func.num_locals, func.num_params);
        assert_eq!(func.num_iterators, 0);

        // No locals beyond the arguments, so VM_SP already points at the
        // bottom of the callee frame.
        Assembler::new(&mut s.blocks.main).lea(VM_FP, mem(VM_SP, ar_offset));
        emit_check_surprise_flags_enter(s, Fixup::new(0, n_args as i32));
        let retval = emit_native_impl(s, func, false);

        let resume = s.blocks.main.frontier();
        patch_ip.patch(&mut s.blocks.main, resume as u64);

        tracing::debug!(
            func = %func.full_name,
            resume = format_args!("{resume:#x}"),
            "inlined native call"
        );
        return retval;
    }

    let mut a = Assembler::new(&mut s.blocks.main);
    if s.config.debug {
        a.mov_ri(SCRATCH, UNINITIALIZED_RIP as i64);
        a.mov_mr(mem(VM_SP, ar_offset + AR_SAVED_RIP), SCRATCH);
    }
    // The callee's prologue finds its frame in STASHED_AR.
    a.lea(STASHED_AR, mem(VM_SP, ar_offset));
    emit_bind_call_helper(s, source_instr, funcd, n_args);
    0
}

/// Emit the smashable call and its stub.
fn emit_bind_call_helper<F: FixupMap>(
    s: &mut LinkSession<F>,
    source_instr: SrcKey,
    funcd: Option<&Func>,
    n_args: u32,
) {
    let to_smash = prepare_for_smash(&mut s.blocks.main, CALL_LEN);
    let stub = s.blocks.stubs.frontier();
    Assembler::new(&mut s.blocks.main).call_rel32(stub);

    // Whatever prologue the call is bound to checks the callee at run time;
    // the first callee seen is a decent prediction.
    let request = s.arena.alloc(ServiceRequest::Call(BindCallReq {
        to_smash,
        n_args,
        source_instr,
        is_immutable: funcd.is_some(),
    }));

    let mut astubs = Assembler::new(&mut s.blocks.stubs);
    astubs.pop_m(mem(STASHED_AR, AR_SAVED_RIP));
    emit_service_req_body(
        &mut astubs,
        &s.config.hooks,
        ServiceRequestKind::BindCall,
        request,
        StubArg::Reg(STASHED_AR),
    );

    tracing::debug!(
        to_smash = format_args!("{to_smash:#x}"),
        callee = funcd.map_or("<unknown>", |f| f.full_name.as_str()),
        stub = format_args!("{stub:#x}"),
        %request,
        "will bind call"
    );
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::patcher::{JCC_LEN, JMP_LEN, decode_target};
    use crate::config::BindConfig;
    use crate::runtime::stubs::{EPHEMERAL_STUB_SIZE, decode_stub_header};
    use crate::translator::func::{BuiltinFn, FuncId, Offset};
    use crate::translator::session::TransId;

    fn session() -> LinkSession {
        LinkSession::new(BindConfig::for_testing()).unwrap()
    }

    fn key(off: u32) -> SrcKey {
        SrcKey::new(FuncId(1), Offset(off))
    }

    #[test]
    fn test_bind_jmp_cross_region() {
        let mut s = session();
        let b = emit_bind_jmp(&mut s, RegionId::Main, key(10));
        assert_eq!(b.to_smash, s.main().base());
        assert_eq!(s.main().used(), JMP_LEN);
        assert_eq!(b.stub, s.stubs().base());
        assert_eq!(s.stubs().used(), EPHEMERAL_STUB_SIZE);
        assert_eq!(
            decode_target(SmashKind::Jmp, b.to_smash, s.main().read(b.to_smash, JMP_LEN)),
            Some(b.stub)
        );
        assert_eq!(
            decode_stub_header(s.stubs().read(b.stub, 10)),
            Some((ServiceRequestKind::BindJmp, b.request))
        );
    }

    #[test]
    fn test_bind_jcc_uses_persistent_stub() {
        let mut s = session();
        let b = emit_bind_jcc(&mut s, RegionId::Main, Condition::Equal, key(4));
        assert_eq!(s.main().used(), JCC_LEN);
        assert!(s.stubs().used() < EPHEMERAL_STUB_SIZE);
        let req = s.arena().get(b.request).unwrap();
        assert_eq!(req.as_jump().unwrap().cc, Some(Condition::Equal));
        assert_eq!(
            decode_target(SmashKind::Jcc, b.to_smash, s.main().read(b.to_smash, JCC_LEN)),
            Some(b.stub)
        );
    }

    #[test]
    fn test_bind_jmp_same_region() {
        let mut s = session();
        let b = emit_bind_jmp(&mut s, RegionId::Stubs, key(7));
        // Site first, then the stub right after it.
        assert_eq!(b.to_smash, s.stubs().base());
        assert_eq!(b.stub, b.to_smash + JMP_LEN);
        assert_eq!(s.stubs().used(), JMP_LEN + EPHEMERAL_STUB_SIZE);
        assert_eq!(s.main().used(), 0);
        assert_eq!(
            decode_target(SmashKind::Jmp, b.to_smash, s.stubs().read(b.to_smash, JMP_LEN)),
            Some(b.stub)
        );
    }

    #[test]
    fn test_side_exit_same_region_jcc() {
        let mut s = session();
        let b = emit_bind_side_exit(&mut s, RegionId::Stubs, Condition::Less, key(9));
        assert_eq!(b.stub, b.to_smash + JCC_LEN);
        let bytes = s.stubs().read(b.to_smash, JCC_LEN);
        assert_eq!(bytes[1], 0x8C);
        assert_eq!(decode_target(SmashKind::Jcc, b.to_smash, bytes), Some(b.stub));
        assert_eq!(
            s.arena().get(b.request).unwrap().kind(),
            ServiceRequestKind::BindSideExit
        );
    }

    #[test]
    fn test_jmp_trans_id_recorded() {
        let mut s = session();
        s.begin_translation(TransId(42));
        let b = emit_bind_jmp(&mut s, RegionId::Main, key(0));
        s.end_translation();
        let c = emit_bind_jmp(&mut s, RegionId::Main, key(1));
        assert_eq!(s.jmp_trans_id(b.to_smash), Some(TransId(42)));
        assert_eq!(s.jmp_trans_id(c.to_smash), None);
    }

    #[test]
    fn test_native_impl_call_predicate() {
        let f = Func::native(FuncId(2), "count", 2, BuiltinFn::from_addr(0x1000));
        assert!(is_native_impl_call(Some(&f), 2));
        assert!(!is_native_impl_call(Some(&f), 1));
        assert!(!is_native_impl_call(None, 2));
        assert!(!is_native_impl_call(Some(&Func::new(FuncId(3), "user", 2)), 2));
    }

    #[test]
    fn test_native_impl_return_mode() {
        let mut s = session();
        let f = Func::native(FuncId(2), "count", 2, BuiltinFn::from_addr(0x1000));
        assert_eq!(emit_native_impl(&mut s, &f, true), 0);
        let bytes = s.main().bytes();
        // ... ret; ud2
        assert_eq!(&bytes[bytes.len() - 3..], &[0xC3, 0x0F, 0x0B]);
        assert_eq!(s.fixups().len(), 1);
    }

    #[test]
    fn test_native_impl_adjust_mode() {
        let mut s = session();
        let f = Func::native(FuncId(2), "count", 2, BuiltinFn::from_addr(0x1000));
        // ActRec plus one cell: the second argument's slot.
        assert_eq!(emit_native_impl(&mut s, &f, false), 48 + 16);
        let bytes = s.main().bytes();
        // Ends with mov rbp, [rbp].
        assert_eq!(&bytes[bytes.len() - 4..], &[0x48, 0x8B, 0x6D, 0x00]);
    }

    #[test]
    #[should_panic(expected = "non-parameter locals")]
    fn test_native_impl_rejects_locals() {
        let mut s = session();
        let mut f = Func::native(FuncId(2), "count", 2, BuiltinFn::from_addr(0x1000));
        f.num_locals = 3;
        emit_native_impl(&mut s, &f, false);
    }

    #[test]
    #[should_panic(expected = "more than one instruction")]
    fn test_native_impl_rejects_long_body() {
        let mut s = session();
        let mut f = Func::native(FuncId(2), "count", 1, BuiltinFn::from_addr(0x1000));
        f.body_len = 4;
        emit_native_impl(&mut s, &f, false);
    }

    #[test]
    fn test_eager_sync_point_layout() {
        let mut s = LinkSession::with_fixups(
            BindConfig::for_testing(),
            crate::runtime::fixup::FixupTable::with_eager(|_| true),
        )
        .unwrap();
        let mut f = Func::native(FuncId(2), "count", 0, BuiltinFn::from_addr(0x1000));
        f.entry_pc = 0x5000;
        emit_native_impl(&mut s, &f, false);
        let bytes = s.main().bytes();
        // mov rdi/rcx, rbp; then mov [r12 + vmfp], rbp
        assert_eq!(&bytes[3..8], &[0x49, 0x89, 0x6C, 0x24, 0x08]);
    }

    #[test]
    fn test_surprise_check_round_trip() {
        let mut s = session();
        emit_check_surprise_flags_enter(&mut s, Fixup::new(0, 2));
        let main = s.main().bytes().to_vec();
        // test dword [r12], -1 ; jnz stubs
        assert_eq!(&main[..3], &[0x41, 0xF7, 0x04]);
        let jcc_at = s.main().base() + main.len() - JCC_LEN;
        assert_eq!(
            decode_target(SmashKind::Jcc, jcc_at, &main[main.len() - JCC_LEN..]),
            Some(s.stubs().base())
        );
        // The cold path jumps back to just after the jnz.
        let stubs = s.stubs().bytes();
        let back = s.stubs().base() + stubs.len() - JMP_LEN;
        assert_eq!(
            decode_target(SmashKind::Jmp, back, &stubs[stubs.len() - JMP_LEN..]),
            Some(s.main().frontier())
        );
        // The helper returns just before the jump, or before the shadow
        // space release (add rsp, 32) where the host ABI has one.
        let ret_addr = match CallingConvention::host().shadow_space() {
            0 => back,
            _ => back - 4,
        };
        assert_eq!(s.fixups().lookup(ret_addr), Some(Fixup::new(0, 2)));
    }
}
