//! Diagnostics ring buffer.
//!
//! A fixed-size ring of typed events that generated code can append to
//! through [`ring_buffer_record`]. Recording never blocks on other
//! recorders and never fails: once the ring is full the oldest events are
//! overwritten.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::backend::x64::assembler::Assembler;
use crate::backend::x64::registers::{CallingConvention, Gpr};
use crate::config::BindConfig;

// =============================================================================
// Events
// =============================================================================

/// Kind of a ring-buffer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RingEventKind {
    FuncEntry = 0,
    FuncExit = 1,
    ServiceReq = 2,
    Msg = 3,
}

impl RingEventKind {
    /// Convert from the raw value passed by generated code.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(RingEventKind::FuncEntry),
            1 => Some(RingEventKind::FuncExit),
            2 => Some(RingEventKind::ServiceReq),
            3 => Some(RingEventKind::Msg),
            _ => None,
        }
    }
}

/// One recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingEvent {
    /// Global sequence number, starting at 0.
    pub seq: u64,
    pub kind: RingEventKind,
    pub msg: &'static str,
}

// =============================================================================
// Event Ring
// =============================================================================

/// Fixed-capacity, overwrite-oldest event ring.
#[derive(Debug)]
pub struct EventRing {
    slots: Box<[Mutex<Option<RingEvent>>]>,
    mask: u64,
    next: AtomicU64,
}

impl EventRing {
    /// Create a ring retaining the last `capacity` events.
    ///
    /// # Panics
    /// Panics if `capacity` is not a power of two.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two(),
            "ring capacity {capacity} is not a power of two"
        );
        let slots = (0..capacity).map(|_| Mutex::new(None)).collect();
        EventRing {
            slots,
            mask: capacity as u64 - 1,
            next: AtomicU64::new(0),
        }
    }

    /// Append an event.
    pub fn record(&self, kind: RingEventKind, msg: &'static str) {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        let mut slot = self.slots[(seq & self.mask) as usize].lock();
        // A slower recorder that claimed an older lap must not clobber a
        // newer event.
        if slot.is_none_or(|ev| ev.seq < seq) {
            *slot = Some(RingEvent { seq, kind, msg });
        }
    }

    /// Retained events, oldest first.
    pub fn snapshot(&self) -> Vec<RingEvent> {
        let end = self.next.load(Ordering::Acquire);
        let start = end.saturating_sub(self.capacity() as u64);
        (start..end)
            .filter_map(|seq| {
                let slot = self.slots[(seq & self.mask) as usize].lock();
                slot.filter(|ev| ev.seq == seq)
            })
            .collect()
    }

    /// Total events ever recorded.
    pub fn recorded(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Intern a message for embedding in generated code.
///
/// Interned strings live for the rest of the process, like the function
/// names they usually are.
pub fn intern_msg(msg: &str) -> &'static str {
    static NAMES: LazyLock<Mutex<FxHashSet<&'static str>>> =
        LazyLock::new(|| Mutex::new(FxHashSet::default()));

    let mut names = NAMES.lock();
    if let Some(&interned) = names.get(msg) {
        return interned;
    }
    let interned: &'static str = Box::leak(msg.into());
    names.insert(interned);
    interned
}

/// Entry point generated trace points call.
///
/// Unknown kinds are recorded as [`RingEventKind::Msg`].
///
/// # Safety
/// `ring` must point to a live [`EventRing`] and `msg`/`len` must describe a
/// `'static` UTF-8 string.
pub unsafe extern "C" fn ring_buffer_record(
    ring: *const EventRing,
    msg: *const u8,
    len: usize,
    kind: u32,
) {
    // SAFETY: guaranteed by the caller; emit_rb only embeds `&'static str`s
    // and the session keeps the ring alive as long as its code.
    let (ring, msg) = unsafe {
        (
            &*ring,
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(msg, len)),
        )
    };
    ring.record(RingEventKind::from_u32(kind).unwrap_or(RingEventKind::Msg), msg);
}

// =============================================================================
// Emission
// =============================================================================

/// Emit a call recording `kind`/`msg` into `ring`.
///
/// Emits nothing when ring-buffer tracing is disabled. All caller-saved
/// registers are preserved, so a trace point can be dropped anywhere.
pub fn emit_rb(
    asm: &mut Assembler<'_>,
    config: &BindConfig,
    ring: &EventRing,
    kind: RingEventKind,
    msg: &'static str,
) {
    if !config.ring_buffer {
        return;
    }

    let cc = CallingConvention::host();
    let mut saved: SmallVec<[Gpr; 10]> = cc.volatile_gprs().iter().collect();
    // An even number of pushes keeps the incoming stack alignment.
    if saved.len() % 2 == 1 {
        saved.push(saved[saved.len() - 1]);
    }

    for &reg in &saved {
        asm.push(reg);
    }

    let args = cc.int_arg_regs();
    asm.mov_ri(args[0], ring as *const EventRing as i64);
    asm.mov_ri(args[1], msg.as_ptr() as i64);
    asm.mov_ri(args[2], msg.len() as i64);
    asm.mov_ri(args[3], kind as i64);
    asm.call_native(cc, config.hooks.ring_buffer_helper);

    for &reg in saved.iter().rev() {
        asm.pop(reg);
    }
}

// =============================================================================
// Tests
// =============================================================================
