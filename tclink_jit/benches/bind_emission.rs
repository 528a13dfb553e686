//! Bind Emission Benchmarks
//!
//! Measures the translate-time cost of the bind protocol.
//!
//! # Benchmark Categories
//!
//! 1. **Bind Jumps**: smashable jmp/jcc plus stub, fresh and recycled stubs
//! 2. **Bind Calls**: lazy call path versus the inline native path
//! 3. **Smashing**: rewriting a live site through the handler

use criterion::{BatchSize, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tclink_jit::backend::x64::encoder::Condition;
use tclink_jit::backend::x64::memory::RegionId;
use tclink_jit::config::BindConfig;
use tclink_jit::runtime::resolver::{CallResolution, DestinationResolver};
use tclink_jit::runtime::service_request::{
    BindCallReq, BindJumpReq, RequestId, ServiceRequestKind,
};
use tclink_jit::translator::bind::{emit_bind_call, emit_bind_jcc, emit_bind_jmp};
use tclink_jit::translator::func::{ActRec, BuiltinFn, Func, FuncId, Offset, SrcKey};
use tclink_jit::translator::session::LinkSession;

/// Sites emitted per batch; sized to fit the default regions.
const SITES: usize = 1024;

// =============================================================================
// Benchmark Helpers
// =============================================================================

extern "C" fn builtin_noop(_ar: *mut ActRec) {}

fn session() -> LinkSession {
    LinkSession::new(BindConfig::default()).unwrap()
}

fn key(off: usize) -> SrcKey {
    SrcKey::new(FuncId(1), Offset(off as u32))
}

struct Here(usize);

impl DestinationResolver for Here {
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

// =============================================================================
// Bind Jumps
// =============================================================================

fn bench_bind_jumps(c: &mut Criterion) {
    let mut group = c.benchmark_group("bind_jump");
    group.throughput(Throughput::Elements(SITES as u64));

    group.bench_function("jmp_fresh_stub", |b| {
        b.iter_batched(
            session,
            |mut s| {
                for i in 0..SITES {
                    black_box(emit_bind_jmp(&mut s, RegionId::Main, key(i)));
                }
                s
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("jcc_persistent_stub", |b| {
        b.iter_batched(
            session,
            |mut s| {
                for i in 0..SITES {
                    black_box(emit_bind_jcc(&mut s, RegionId::Main, Condition::Equal, key(i)));
                }
                s
            },
            BatchSize::LargeInput,
        );
    });

    // Every site is bound right away, so each new jump reuses the stub the
    // previous one retired.
    group.bench_function("jmp_recycled_stub", |b| {
        b.iter_batched(
            session,
            |mut s| {
                let here = Here(s.main().base());
                let handler = s.handler();
                for i in 0..SITES {
                    let bound = emit_bind_jmp(&mut s, RegionId::Main, key(i));
                    handler
                        .handle(ServiceRequestKind::BindJmp, bound.request, bound.stub, &here)
                        .unwrap();
                }
                s
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

// =============================================================================
// Bind Calls
// =============================================================================

fn bench_bind_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("bind_call");
    group.throughput(Throughput::Elements(SITES as u64));

    let user = Func::new(FuncId(2), "render", 2);
    let builtin = Func::native(FuncId(3), "count", 2, BuiltinFn::new(builtin_noop));

    group.bench_function("lazy", |b| {
        b.iter_batched(
            session,
            |mut s| {
                for i in 0..SITES {
                    black_box(emit_bind_call(&mut s, key(i), Some(&user), 2));
                }
                s
            },
            BatchSize::LargeInput,
        );
    });

    group.bench_function("native_inline", |b| {
        b.iter_batched(
            session,
            |mut s| {
                for i in 0..SITES {
                    black_box(emit_bind_call(&mut s, key(i), Some(&builtin), 2));
                }
                s
            },
            BatchSize::LargeInput,
        );
    });

    group.finish();
}

// =============================================================================
// Smashing
// =============================================================================

fn bench_smash(c: &mut Criterion) {
    let mut s = session();
    emit_bind_call(&mut s, key(0), None, 0);
    let id = RequestId::from_raw(0);
    let handler = s.handler();
    let targets = [Here(s.main().base()), Here(s.main().base() + 0x100)];

    c.bench_function("smash_call_site", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i += 1;
            handler
                .handle(ServiceRequestKind::BindCall, id, 0, &targets[i & 1])
                .unwrap()
        });
    });
}

criterion_group!(benches, bench_bind_jumps, bench_bind_calls, bench_smash);
criterion_main!(benches);
