//! Property tests for smashable site placement and patching.

use proptest::prelude::{any, prop_assert, prop_assert_eq, proptest};
use proptest::sample::select;

use tclink_jit::backend::x64::assembler::Assembler;
use tclink_jit::backend::x64::encoder::Condition;
use tclink_jit::backend::x64::memory::{CodeRegion, Protection, RegionId};
use tclink_jit::codegen::patcher::{
    JCC_LEN, JMP_LEN, SmashKind, decode_target, is_smashable, prepare_for_smash,
};
use tclink_jit::config::BindConfig;
use tclink_jit::runtime::resolver::{CallResolution, DestinationResolver, Resolution};
use tclink_jit::runtime::service_request::{BindCallReq, BindJumpReq, ServiceRequestKind};
use tclink_jit::translator::bind::{emit_bind_jcc, emit_bind_jmp};
use tclink_jit::translator::func::{FuncId, Offset, SrcKey};
use tclink_jit::translator::session::LinkSession;

struct To(usize);

impl DestinationResolver for To {
    fn resolve_jump(&self, _req: &BindJumpReq) -> Option<usize> {
        Some(self.0)
    }

    fn resolve_call(&self, _req: &BindCallReq, _stashed_ar: usize) -> CallResolution {
        CallResolution {
            target: Some(self.0),
            patch: true,
        }
    }
}

proptest! {

    #[test]
    fn proptest_prepared_site_never_straddles(
        prefix in 0usize..512,
        width in select(vec![5usize, 6]),
    ) {
        let mut region = CodeRegion::new("prop", 4096, Protection::ReadWriteExecute).unwrap();
        Assembler::new(&mut region).nops(prefix);

        let before = region.frontier();
        let site = prepare_for_smash(&mut region, width);
        prop_assert!(is_smashable(site, width));
        prop_assert!(site >= before);
        prop_assert!(site - before < width);
        prop_assert_eq!(region.frontier(), site);
    }

    #[test]
    fn proptest_bound_jump_smash_keeps_frontiers(
        prefix in 0usize..256,
        conditional in any::<bool>(),
        target_off in 0usize..4096,
    ) {
        let mut s = LinkSession::new(BindConfig::for_testing()).unwrap();
        Assembler::new(&mut s.blocks_mut().main).nops(prefix);
        let dest = SrcKey::new(FuncId(1), Offset(prefix as u32));

        let (b, kind, smash, width) = if conditional {
            let b = emit_bind_jcc(&mut s, RegionId::Main, Condition::NotEqual, dest);
            (b, ServiceRequestKind::BindJcc, SmashKind::Jcc, JCC_LEN)
        } else {
            let b = emit_bind_jmp(&mut s, RegionId::Main, dest);
            (b, ServiceRequestKind::BindJmp, SmashKind::Jmp, JMP_LEN)
        };
        prop_assert!(is_smashable(b.to_smash, width));

        let main_frontier = s.main().frontier();
        let stubs_frontier = s.stubs().frontier();
        let target = s.main().base() + target_off;

        let r = s.handler().handle(kind, b.request, b.stub, &To(target)).unwrap();
        prop_assert_eq!(r, Resolution::Bound { target });
        prop_assert_eq!(s.main().frontier(), main_frontier);
        prop_assert_eq!(s.stubs().frontier(), stubs_frontier);
        prop_assert_eq!(
            decode_target(smash, b.to_smash, s.main().read(b.to_smash, width)),
            Some(target)
        );
    }
}
