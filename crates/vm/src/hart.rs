//! Hart state and lifecycle.
//!
//! One hart is one hardware thread: integer/FP register files, privilege
//! mode, CSR bundle, TLB, and a set of atomically-shared signalling words.
//! The architectural state is owned by the hart's OS thread for the duration
//! of a run (a long-held mutex); other threads talk to a running hart only
//! through [`HartShared`].

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::csr::{CsrFile, PrivMode};
use crate::machine::MachineInner;
use crate::mmu::Tlb;

/// `wait_event` values. `Stopped` unwinds the dispatch loop.
pub const WAIT_STOPPED: u32 = 0;
pub const WAIT_RUNNING: u32 = 1;

bitflags::bitflags! {
    /// Bits of the per-hart `pending_events` word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HartEvent: u32 {
        const PAUSE   = 1 << 0;
        const PREEMPT = 1 << 1;
    }
}

/// Interrupt bit positions in `mip`/`mie`.
pub const MIP_SSIP: u64 = 1 << 1;
pub const MIP_MSIP: u64 = 1 << 3;
pub const MIP_STIP: u64 = 1 << 5;
pub const MIP_MTIP: u64 = 1 << 7;
pub const MIP_SEIP: u64 = 1 << 9;
pub const MIP_MEIP: u64 = 1 << 11;

/// All architecturally defined interrupt bits.
pub const IRQ_MASK: u64 = MIP_SSIP | MIP_MSIP | MIP_STIP | MIP_MTIP | MIP_SEIP | MIP_MEIP;

/// Interrupt delivery priority, highest first.
pub const IRQ_PRIORITY: [u32; 6] = [11, 3, 7, 9, 1, 5];

/// Cross-thread face of a hart. Every field is mutated with atomics; the
/// condvar wakes a hart parked in WFI.
pub struct HartShared {
    /// IRQ bits queued by external sources, drained into `ip` by the hart.
    pub pending_irqs: AtomicU64,
    /// [`HartEvent`] bits, consumed with an atomic swap-to-zero.
    pub pending_events: AtomicU32,
    /// [`WAIT_RUNNING`] while the dispatch loop may continue.
    pub wait_event: AtomicU32,
    /// Preemption sleep length in milliseconds.
    pub preempt_ms: AtomicU32,
    /// mip: mutated by interrupt sources concurrently with the hart.
    pub ip: AtomicU64,
    /// mie: owned by the hart, read by interrupt sources.
    pub ie: AtomicU64,
    /// Machine timer comparator, written by the CLINT from any hart thread.
    pub mtimecmp: AtomicU64,
    wfi_lock: Mutex<()>,
    wfi_cond: Condvar,
}

impl HartShared {
    fn new() -> HartShared {
        HartShared {
            pending_irqs: AtomicU64::new(0),
            pending_events: AtomicU32::new(0),
            wait_event: AtomicU32::new(WAIT_STOPPED),
            preempt_ms: AtomicU32::new(0),
            ip: AtomicU64::new(0),
            ie: AtomicU64::new(0),
            mtimecmp: AtomicU64::new(u64::MAX),
            wfi_lock: Mutex::new(()),
            wfi_cond: Condvar::new(),
        }
    }

    /// Stop the dispatch loop and wake the hart if it is parked in WFI.
    pub fn wake(&self) {
        self.wait_event.store(WAIT_STOPPED, Ordering::Release);
        let _guard = self.wfi_lock.lock().unwrap();
        self.wfi_cond.notify_all();
    }

    /// Raise interrupt bits and notify the hart.
    pub fn send_irq(&self, bits: u64) {
        self.pending_irqs.fetch_or(bits, Ordering::AcqRel);
        self.wake();
    }

    /// Lower level-triggered interrupt bits.
    pub fn lower_irq(&self, bits: u64) {
        self.pending_irqs.fetch_and(!bits, Ordering::AcqRel);
        self.ip.fetch_and(!bits, Ordering::AcqRel);
    }

    /// Queue hart events (pause/preempt) and notify.
    pub fn send_event(&self, ev: HartEvent) {
        self.pending_events.fetch_or(ev.bits(), Ordering::AcqRel);
        self.wake();
    }
}

/// A raw view of guest RAM: base physical address, size, host pointer.
/// Copied into each hart so the hot path never chases the machine object.
#[derive(Clone, Copy)]
pub struct RamView {
    pub base: u64,
    pub size: u64,
    pub ptr: *mut u8,
}

// Concurrent access goes through per-address atomics in the MMU layer.
unsafe impl Send for RamView {}
unsafe impl Sync for RamView {}

impl RamView {
    /// Host pointer for a guest physical address, if it lies in RAM.
    #[inline]
    pub fn host_ptr(&self, paddr: u64) -> Option<*mut u8> {
        if paddr.wrapping_sub(self.base) < self.size {
            // SAFETY: offset verified in range.
            Some(unsafe { self.ptr.add((paddr - self.base) as usize) })
        } else {
            None
        }
    }

    /// True if `[paddr, paddr+len)` lies entirely in RAM.
    #[inline]
    pub fn contains(&self, paddr: u64, len: u64) -> bool {
        paddr.wrapping_sub(self.base) < self.size
            && len <= self.size - (paddr - self.base)
    }
}

/// Architectural and per-thread state of one hart.
pub struct HartState {
    pub rv64: bool,
    /// x0..x31. x0 is cleared at the top of every dispatch iteration.
    pub regs: [u64; 32],
    /// f0..f31, 64-bit with NaN boxing for single precision.
    pub fregs: [u64; 32],
    pub pc: u64,
    pub prv: PrivMode,
    pub csr: CsrFile,
    pub tlb: Tlb,
    pub shared: Arc<HartShared>,
    pub ram: RamView,
    /// Set by `trap()`; the outer loop commits `trap_pc` into `pc`.
    pub trap_pending: bool,
    pub trap_pc: u64,
    /// Userland-emulation mode: traps land in the U CSR slots and do not
    /// switch privilege.
    pub user_traps: bool,
    /// LR/SC reservation: (address, loaded value).
    pub reservation: Option<(u64, u64)>,
}

impl HartState {
    pub fn new(rv64: bool, hartid: u64, ram: RamView, shared: Arc<HartShared>) -> HartState {
        let mut h = HartState {
            rv64,
            regs: [0; 32],
            fregs: [0; 32],
            pc: 0,
            prv: PrivMode::Machine,
            csr: CsrFile::new(rv64, hartid),
            tlb: Tlb::new(),
            shared,
            ram,
            trap_pending: false,
            trap_pc: 0,
            user_traps: false,
            reservation: None,
        };
        h.tlb.flush_full();
        h
    }

    /// Reset architectural state for a machine reset. Signalling words are
    /// cleared too; the hart is known to be stopped here.
    pub fn reset(&mut self, pc: u64) {
        self.regs = [0; 32];
        self.fregs = [0; 32];
        self.pc = pc;
        self.prv = PrivMode::Machine;
        self.csr.reset();
        self.tlb.flush_full();
        self.trap_pending = false;
        self.trap_pc = 0;
        self.reservation = None;
        self.shared.pending_irqs.store(0, Ordering::Relaxed);
        self.shared.pending_events.store(0, Ordering::Relaxed);
        self.shared.ip.store(0, Ordering::Relaxed);
        self.shared.ie.store(0, Ordering::Relaxed);
        self.shared.mtimecmp.store(u64::MAX, Ordering::Relaxed);
        self.shared.preempt_ms.store(0, Ordering::Relaxed);
    }

    /// Write an integer register. On RV32 every value is kept as the sign
    /// extension of its low 32 bits so comparisons and arithmetic work on
    /// the full word.
    #[inline(always)]
    pub fn set_x(&mut self, r: usize, v: u64) {
        self.regs[r] = if self.rv64 { v } else { v as i32 as i64 as u64 };
    }

    #[inline(always)]
    pub fn x(&self, r: usize) -> u64 {
        self.regs[r]
    }

    /// Canonicalize an address: RV32 addresses are the low 32 bits.
    #[inline(always)]
    pub fn addr(&self, a: u64) -> u64 {
        if self.rv64 {
            a
        } else {
            a & 0xFFFF_FFFF
        }
    }

    /// Bump PC by an instruction length.
    #[inline(always)]
    pub fn advance_pc(&mut self, len: u64) {
        self.pc = self.addr(self.pc.wrapping_add(len));
    }

    /// Set PC to a jump/branch target.
    #[inline(always)]
    pub fn set_pc(&mut self, target: u64) {
        self.pc = self.addr(target);
    }

    /// Re-evaluate the timer comparators against machine time, setting or
    /// clearing MTIP/STIP. Called from the outer loop and after WFI wakes.
    pub fn sync_timer_irqs(&mut self, m: &MachineInner) {
        let now = m.timer.now();
        if now >= self.shared.mtimecmp.load(Ordering::Relaxed) {
            self.shared.ip.fetch_or(MIP_MTIP, Ordering::AcqRel);
        } else {
            self.shared.ip.fetch_and(!MIP_MTIP, Ordering::AcqRel);
        }
        if self.csr.stce() {
            if now >= self.csr.stimecmp {
                self.shared.ip.fetch_or(MIP_STIP, Ordering::AcqRel);
            } else {
                self.shared.ip.fetch_and(!MIP_STIP, Ordering::AcqRel);
            }
        }
    }

    /// Ticks until the next timer comparator fires, if any is armed.
    fn next_timer_deadline(&self) -> Option<u64> {
        let mut deadline = self.shared.mtimecmp.load(Ordering::Relaxed);
        if self.csr.stce() {
            deadline = deadline.min(self.csr.stimecmp);
        }
        if deadline == u64::MAX {
            None
        } else {
            Some(deadline)
        }
    }

    /// Park in WFI until an enabled interrupt is pending or a hart event
    /// arrives. The wait is bounded by the next timer comparator so timer
    /// interrupts fire without external help.
    pub fn wfi_wait(&mut self, m: &MachineInner) {
        loop {
            let irqs = self.shared.pending_irqs.swap(0, Ordering::AcqRel);
            if irqs != 0 {
                self.shared.ip.fetch_or(irqs, Ordering::AcqRel);
            }
            self.sync_timer_irqs(m);
            let ip = self.shared.ip.load(Ordering::Acquire);
            let ie = self.shared.ie.load(Ordering::Acquire);
            if ip & ie & IRQ_MASK != 0 {
                return;
            }
            if self.shared.pending_events.load(Ordering::Acquire) != 0 {
                return;
            }
            let timeout = match self.next_timer_deadline() {
                Some(deadline) => {
                    let now = m.timer.now();
                    if deadline <= now {
                        // Comparator already passed; loop re-runs the check
                        // with the timer bit set by sync_timer_irqs.
                        continue;
                    }
                    m.timer.ticks_to_duration(deadline - now)
                }
                None => Duration::from_millis(100),
            };
            let guard = self.shared.wfi_lock.lock().unwrap();
            // Re-check under the lock so a wake between the check above and
            // the wait cannot be lost: wakers notify while holding the lock.
            if self.shared.pending_irqs.load(Ordering::Acquire) != 0
                || self.shared.pending_events.load(Ordering::Acquire) != 0
            {
                continue;
            }
            let (_guard, _timeout) = self
                .shared
                .wfi_cond
                .wait_timeout(guard, timeout)
                .unwrap();
        }
    }

    /// The hart's outer loop: runs until a pause event arrives.
    pub fn run(&mut self, m: &MachineInner) {
        loop {
            self.shared.wait_event.store(WAIT_RUNNING, Ordering::Relaxed);

            let irqs = self.shared.pending_irqs.swap(0, Ordering::AcqRel);
            if irqs != 0 {
                self.shared.ip.fetch_or(irqs, Ordering::AcqRel);
            }
            // A WFI wake may have set a timer bit optimistically; clear it
            // if the comparator has not actually fired yet.
            self.sync_timer_irqs(m);

            let events =
                HartEvent::from_bits_truncate(self.shared.pending_events.swap(0, Ordering::AcqRel));
            if events.contains(HartEvent::PAUSE) {
                self.shared.wait_event.store(WAIT_STOPPED, Ordering::Release);
                return;
            }
            if events.contains(HartEvent::PREEMPT) {
                let ms = self.shared.preempt_ms.load(Ordering::Relaxed);
                if ms != 0 {
                    std::thread::sleep(Duration::from_millis(ms as u64));
                }
            }

            self.check_interrupts(m);
            self.dispatch_loop(m);

            if self.trap_pending {
                self.pc = self.trap_pc;
                self.trap_pending = false;
            }
        }
    }
}

/// A hart as the machine owns it: shared signalling plus the (parked)
/// architectural state and the OS thread driving it.
pub struct HartHandle {
    pub shared: Arc<HartShared>,
    pub state: Mutex<HartState>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl HartHandle {
    pub fn new(rv64: bool, hartid: u64, ram: RamView) -> HartHandle {
        let shared = Arc::new(HartShared::new());
        HartHandle {
            state: Mutex::new(HartState::new(rv64, hartid, ram, shared.clone())),
            shared,
            thread: Mutex::new(None),
        }
    }

    /// Spawn the hart thread. The machine must hold the hart in its
    /// `harts` vector at `index`.
    pub fn spawn(&self, m: Arc<MachineInner>, index: usize) {
        let mut slot = self.thread.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let handle = std::thread::Builder::new()
            .name(format!("rvbox-hart{}", index))
            .spawn(move || {
                crate::vma::isolate_thread();
                let hart = &m.harts[index];
                let mut state = hart.state.lock().unwrap();
                state.run(&m);
            })
            .expect("hart thread spawn failed");
        *slot = Some(handle);
    }

    /// Ask the hart to stop at the next outer-loop pass, without waiting.
    pub fn queue_pause(&self) {
        self.shared.send_event(HartEvent::PAUSE);
    }

    /// Stop the hart and join its thread.
    pub fn pause(&self) {
        self.queue_pause();
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Reduce the hart's CPU share by sleeping `ms` out of every 10 ms
    /// scheduling quantum.
    pub fn preempt(&self, ms: u32) {
        self.shared.preempt_ms.store(ms, Ordering::Relaxed);
        self.shared.send_event(HartEvent::PREEMPT);
    }

    pub fn is_spawned(&self) -> bool {
        self.thread.lock().unwrap().is_some()
    }
}
