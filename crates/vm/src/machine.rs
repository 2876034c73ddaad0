//! The machine: guest RAM, harts, MMIO regions, device tree, lifecycle.
//!
//! `Machine` is the owning handle; `MachineInner` is the `Arc`-shared body
//! that hart threads, devices, and the event loop reference. Construction
//! validates the RAM geometry, reset lays out the boot images and device
//! tree, and start/pause spawn and join the hart threads under a
//! process-global lock.

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::elf;
use crate::eventloop;
use crate::fdt::FdtNode;
use crate::hart::{HartHandle, RamView};
use crate::mmio::{self, DirectMapping, MmioDevice, MmioError, MmioSlot, MmioZone};
use crate::mmu::PAGE_MASK;
use crate::vma::{VmaFlags, VmaRegion};

/// Machine power states.
pub const POWER_OFF: u32 = 0;
pub const POWER_ON: u32 = 1;
pub const POWER_RESET: u32 = 2;

/// Kernel image offset from the RAM base.
const KERNEL_OFFSET_RV64: u64 = 0x200000;
const KERNEL_OFFSET_RV32: u64 = 0x400000;

/// Machine timer frequency (CLINT mtime ticks per second).
pub const TIMER_FREQ: u64 = 10_000_000;

const RV32_RAM_LIMIT: u64 = 1 << 30;

#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error("RAM base/size must be page-aligned and non-empty")]
    BadRamGeometry,
    #[error("hart count must be 1..=1024, got {0}")]
    BadHartCount(u32),
    #[error("host memory allocation failed")]
    AllocFailed,
    #[error("image does not fit in guest RAM")]
    ImageTooLarge,
    #[error("malformed ELF image")]
    BadElf,
    #[error("option {0:?} is fixed after machine creation")]
    FixedOption(MachineOpt),
    #[error("invalid value for option {0:?}")]
    BadOptValue(MachineOpt),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Recognised machine options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineOpt {
    Jit,
    JitCache,
    JitHarvard,
    MaxCpuPercent,
    ResetPc,
    MemBase,
    MemSize,
    HartCount,
    DtbAddr,
    HwImitate,
}

/// Mutable option storage.
struct MachineConfig {
    jit: bool,
    jit_cache: u64,
    jit_harvard: bool,
    max_cpu_percent: u32,
    reset_pc: Option<u64>,
    dtb_addr: Option<u64>,
    hw_imitate: bool,
}

impl MachineConfig {
    fn new() -> MachineConfig {
        MachineConfig {
            jit: false,
            jit_cache: 16 << 20,
            jit_harvard: false,
            max_cpu_percent: 100,
            reset_pc: None,
            dtb_addr: None,
            hw_imitate: false,
        }
    }
}

/// Boot image payloads and the kernel command line.
struct BootImages {
    bootrom: Option<Vec<u8>>,
    kernel: Option<Vec<u8>>,
    dtb: Option<Vec<u8>>,
    cmdline: String,
}

/// Guest RAM descriptor plus its backing mapping.
pub struct GuestRam {
    pub base: u64,
    pub size: u64,
    mem: VmaRegion,
}

impl GuestRam {
    pub fn view(&self) -> RamView {
        RamView {
            base: self.base,
            size: self.size,
            ptr: self.mem.as_ptr(),
        }
    }
}

/// Wall-clock-driven guest timer.
pub struct MachineTimer {
    start: Instant,
}

impl MachineTimer {
    fn new() -> MachineTimer {
        MachineTimer {
            start: Instant::now(),
        }
    }

    /// Current mtime value.
    pub fn now(&self) -> u64 {
        let e = self.start.elapsed();
        e.as_secs() * TIMER_FREQ + e.subsec_nanos() as u64 / (1_000_000_000 / TIMER_FREQ)
    }

    pub fn ticks_to_duration(&self, ticks: u64) -> Duration {
        Duration::from_nanos(ticks.saturating_mul(1_000_000_000 / TIMER_FREQ))
    }
}

type ResetHandler = Box<dyn FnMut(&MachineInner) -> bool + Send>;

/// The shared machine body.
pub struct MachineInner {
    pub rv64: bool,
    pub ram: GuestRam,
    pub harts: Vec<HartHandle>,
    pub mmio: RwLock<Vec<MmioSlot>>,
    pub power: AtomicU32,
    pub running: AtomicBool,
    pub timer: MachineTimer,
    config: Mutex<MachineConfig>,
    boot: Mutex<BootImages>,
    /// Device-tree root, regenerated on reset and kept for inspection.
    pub fdt: Mutex<FdtNode>,
    reset_handler: Mutex<Option<ResetHandler>>,
    /// Per-cpu interrupt-controller phandles, fixed at construction.
    intc_phandles: Vec<u32>,
}

// Serialises machine start/pause across the process. Held briefly; a
// watchdog warns if someone wedges it.
static MACHINE_LOCK: Mutex<()> = Mutex::new(());

/// Same lock for the event loop's reset/power-off transitions, so they
/// serialise with user-driven start/pause.
pub(crate) fn lifecycle_lock() -> MutexGuard<'static, ()> {
    global_lock()
}

fn global_lock() -> MutexGuard<'static, ()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(g) = MACHINE_LOCK.try_lock() {
            return g;
        }
        if Instant::now() > deadline {
            warn!("machine lock held for >5s, blocking until it frees");
            return MACHINE_LOCK.lock().unwrap();
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

impl MachineInner {
    /// Page dirtying hook for instruction-translation coherence. The
    /// interpreter reads code through the same RAM the stores hit, so with
    /// the translator disabled there is nothing to invalidate.
    #[inline]
    pub fn mark_page_dirty(&self, _paddr: u64) {}

    /// Ask for a power transition; the event loop carries it out.
    pub fn request_power(&self, state: u32) {
        self.power.store(state, Ordering::Release);
        eventloop::kick();
    }

    pub fn intc_phandles(&self) -> &[u32] {
        &self.intc_phandles
    }

    fn kernel_offset(&self) -> u64 {
        if self.rv64 {
            KERNEL_OFFSET_RV64
        } else {
            KERNEL_OFFSET_RV32
        }
    }

    pub fn pause_harts(&self) {
        for hart in &self.harts {
            hart.queue_pause();
        }
        for hart in &self.harts {
            hart.pause();
        }
    }

    pub fn spawn_harts(this: &Arc<MachineInner>) {
        for (i, hart) in this.harts.iter().enumerate() {
            hart.spawn(Arc::clone(this), i);
        }
    }

    /// Event-loop pass while powered on: timer pokes and preemption.
    pub fn service_harts(&self) {
        let pct = self.config.lock().unwrap().max_cpu_percent;
        let now = self.timer.now();
        for hart in &self.harts {
            let cmp = hart.shared.mtimecmp.load(Ordering::Relaxed);
            if now >= cmp
                && hart.shared.ip.load(Ordering::Relaxed) & crate::hart::MIP_MTIP == 0
            {
                // Comparator fired while the hart was busy; poke it so the
                // outer loop raises MTIP.
                hart.shared.wake();
            }
            if pct < 100 {
                hart.preempt((100 - pct) / 10);
            }
        }
    }

    /// Build the device tree from the current machine state.
    pub fn build_fdt(&self) -> FdtNode {
        let mut root = FdtNode::new("");
        root.prop_u32("#address-cells", 2);
        root.prop_u32("#size-cells", 2);
        root.prop_str("model", "rvbox,generic");
        root.prop_str("compatible", "rvbox,generic");

        let mut chosen = FdtNode::new("chosen");
        let seed: [u8; 64] = {
            let mut s = [0u8; 64];
            rand::Rng::fill(&mut rand::thread_rng(), &mut s[..]);
            s
        };
        chosen.prop_bytes("rng-seed", &seed);
        let cmdline = self.boot.lock().unwrap().cmdline.clone();
        if !cmdline.is_empty() {
            chosen.prop_str("bootargs", &cmdline);
        }
        root.add_child(chosen);

        let mut mem = FdtNode::new_reg("memory", self.ram.base);
        mem.prop_str("device_type", "memory");
        mem.prop_cells(
            "reg",
            &[
                (self.ram.base >> 32) as u32,
                self.ram.base as u32,
                (self.ram.size >> 32) as u32,
                self.ram.size as u32,
            ],
        );
        root.add_child(mem);

        let mut cpus = FdtNode::new("cpus");
        cpus.prop_u32("#address-cells", 1);
        cpus.prop_u32("#size-cells", 0);
        cpus.prop_u32("timebase-frequency", TIMER_FREQ as u32);
        let isa = if self.rv64 {
            "rv64imafdc_zicsr_zifencei_sstc"
        } else {
            "rv32imafdc_zicsr_zifencei_sstc"
        };
        let mmu_type = if self.rv64 {
            "riscv,sv48"
        } else {
            "riscv,sv32"
        };
        for (i, _) in self.harts.iter().enumerate() {
            let mut cpu = FdtNode::new_reg("cpu", i as u64);
            cpu.prop_str("device_type", "cpu");
            cpu.prop_u32("reg", i as u32);
            cpu.prop_str("status", "okay");
            cpu.prop_str("compatible", "riscv");
            cpu.prop_str("riscv,isa", isa);
            cpu.prop_str("mmu-type", mmu_type);
            let mut intc = FdtNode::new("interrupt-controller");
            intc.prop_u32("#interrupt-cells", 1);
            intc.prop_empty("interrupt-controller");
            intc.prop_str("compatible", "riscv,cpu-intc");
            intc.set_phandle(self.intc_phandles[i]);
            cpu.add_child(intc);
            cpus.add_child(cpu);
        }
        root.add_child(cpus);

        let mut soc = FdtNode::new("soc");
        soc.prop_str("compatible", "simple-bus");
        soc.prop_u32("#address-cells", 2);
        soc.prop_u32("#size-cells", 2);
        soc.prop_empty("ranges");
        {
            let slots = self.mmio.read().unwrap();
            for slot in slots.iter() {
                if slot.dead {
                    continue;
                }
                if let Some(dev) = &slot.dev {
                    if let Some(node) = dev.fdt_node(&slot.zone) {
                        soc.add_child(node);
                    }
                }
            }
        }
        root.add_child(soc);
        root
    }

    /// Reset machine state: reload images, rebuild the DTB, reinitialise
    /// every hart. All harts must be stopped.
    pub fn reset_state(&self) -> Result<(), MachineError> {
        self.ram.mem.clean(0, self.ram.size as usize);

        // Generate the DTB first: build_fdt takes the boot lock itself.
        let generated_dtb = {
            let have_external = self.boot.lock().unwrap().dtb.is_some();
            if have_external {
                None
            } else {
                let root = self.build_fdt();
                let blob = root.serialize();
                *self.fdt.lock().unwrap() = root;
                Some(blob)
            }
        };

        let boot = self.boot.lock().unwrap();
        let config = self.config.lock().unwrap();
        let view = self.ram.view();
        let mut elf_entry = None;

        if let Some(bootrom) = &boot.bootrom {
            if !config.hw_imitate && elf::is_elf(bootrom) {
                elf_entry = Some(elf::load(bootrom, &view)?);
            } else {
                if bootrom.len() as u64 > self.ram.size {
                    return Err(MachineError::ImageTooLarge);
                }
                // SAFETY: length checked against RAM size.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        bootrom.as_ptr(),
                        view.ptr,
                        bootrom.len(),
                    );
                }
            }
        }

        if let Some(kernel) = &boot.kernel {
            let offset = self.kernel_offset();
            if !config.hw_imitate && elf::is_elf(kernel) {
                elf::load(kernel, &view)?;
            } else {
                if offset + kernel.len() as u64 > self.ram.size {
                    return Err(MachineError::ImageTooLarge);
                }
                // SAFETY: offset+length checked against RAM size.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        kernel.as_ptr(),
                        view.ptr.add(offset as usize),
                        kernel.len(),
                    );
                }
            }
        }

        let dtb = match &boot.dtb {
            Some(blob) => blob.clone(),
            None => generated_dtb.expect("generated when no external dtb"),
        };
        let dtb_addr = config
            .dtb_addr
            .unwrap_or_else(|| (self.ram.base + self.ram.size - dtb.len() as u64) & !7);
        if !view.contains(dtb_addr, dtb.len() as u64) {
            return Err(MachineError::ImageTooLarge);
        }
        // SAFETY: containment checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                dtb.as_ptr(),
                view.ptr.add((dtb_addr - self.ram.base) as usize),
                dtb.len(),
            );
        }

        let reset_pc = config
            .reset_pc
            .or(elf_entry)
            .unwrap_or(self.ram.base);
        for hart in &self.harts {
            let mut state = hart.state.lock().unwrap();
            state.reset(reset_pc);
            let hartid = state.csr.hartid;
            state.set_x(10, hartid); // a0
            state.set_x(11, dtb_addr); // a1
        }
        drop(config);
        drop(boot);
        self.mmio_reset_all();
        info!(
            "machine reset: pc={:#x} dtb={:#x} harts={}",
            reset_pc,
            dtb_addr,
            self.harts.len()
        );
        Ok(())
    }
}

/// Owning machine handle.
pub struct Machine {
    inner: Arc<MachineInner>,
}

/// Handle to an attached MMIO region (index into the slot list; slots are
/// tombstoned, never removed, so handles stay valid).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmioHandle(pub usize);

impl Machine {
    /// Create a machine with `hart_count` harts and RAM at
    /// `[mem_base, mem_base + mem_size)`.
    pub fn new(
        mem_base: u64,
        mem_size: u64,
        hart_count: u32,
        rv64: bool,
    ) -> Result<Machine, MachineError> {
        if mem_size == 0 || mem_base & PAGE_MASK != 0 || mem_size & PAGE_MASK != 0 {
            return Err(MachineError::BadRamGeometry);
        }
        if hart_count == 0 || hart_count > 1024 {
            return Err(MachineError::BadHartCount(hart_count));
        }
        let mem_size = if !rv64 && mem_size > RV32_RAM_LIMIT {
            // Workaround for 32-bit guests that can't map more anyway.
            warn!("clamping RV32 guest RAM to 1 GiB");
            RV32_RAM_LIMIT
        } else {
            mem_size
        };
        let mem = VmaRegion::alloc(
            mem_size as usize,
            VmaFlags::RDWR | VmaFlags::MERGE | VmaFlags::HUGE,
        )
        .ok_or(MachineError::AllocFailed)?;
        let ram = GuestRam {
            base: mem_base,
            size: mem_size,
            mem,
        };

        let view = ram.view();
        let harts: Vec<HartHandle> = (0..hart_count)
            .map(|i| HartHandle::new(rv64, i as u64, view))
            .collect();

        let mut root = FdtNode::new("");
        let intc_phandles: Vec<u32> = (0..hart_count).map(|_| root.alloc_phandle()).collect();

        let inner = Arc::new(MachineInner {
            rv64,
            ram,
            harts,
            mmio: RwLock::new(Vec::new()),
            power: AtomicU32::new(POWER_OFF),
            running: AtomicBool::new(false),
            timer: MachineTimer::new(),
            config: Mutex::new(MachineConfig::new()),
            boot: Mutex::new(BootImages {
                bootrom: None,
                kernel: None,
                dtb: None,
                cmdline: String::new(),
            }),
            fdt: Mutex::new(root),
            reset_handler: Mutex::new(None),
            intc_phandles,
        });
        Ok(Machine { inner })
    }

    pub fn inner(&self) -> &Arc<MachineInner> {
        &self.inner
    }

    pub fn set_opt(&self, opt: MachineOpt, value: u64) -> Result<(), MachineError> {
        let mut c = self.inner.config.lock().unwrap();
        match opt {
            MachineOpt::Jit => c.jit = value != 0,
            MachineOpt::JitCache => c.jit_cache = value,
            MachineOpt::JitHarvard => c.jit_harvard = value != 0,
            MachineOpt::MaxCpuPercent => {
                if !(1..=100).contains(&value) {
                    return Err(MachineError::BadOptValue(opt));
                }
                c.max_cpu_percent = value as u32;
            }
            MachineOpt::ResetPc => c.reset_pc = Some(value),
            MachineOpt::DtbAddr => c.dtb_addr = Some(value),
            MachineOpt::HwImitate => c.hw_imitate = value != 0,
            MachineOpt::MemBase | MachineOpt::MemSize | MachineOpt::HartCount => {
                return Err(MachineError::FixedOption(opt));
            }
        }
        Ok(())
    }

    pub fn get_opt(&self, opt: MachineOpt) -> u64 {
        let c = self.inner.config.lock().unwrap();
        match opt {
            MachineOpt::Jit => c.jit as u64,
            MachineOpt::JitCache => c.jit_cache,
            MachineOpt::JitHarvard => c.jit_harvard as u64,
            MachineOpt::MaxCpuPercent => c.max_cpu_percent as u64,
            MachineOpt::ResetPc => c.reset_pc.unwrap_or(self.inner.ram.base),
            MachineOpt::MemBase => self.inner.ram.base,
            MachineOpt::MemSize => self.inner.ram.size,
            MachineOpt::HartCount => self.inner.harts.len() as u64,
            MachineOpt::DtbAddr => c.dtb_addr.unwrap_or(0),
            MachineOpt::HwImitate => c.hw_imitate as u64,
        }
    }

    fn check_image_fits(&self, len: usize, offset: u64) -> Result<(), MachineError> {
        if offset + len as u64 > self.inner.ram.size {
            Err(MachineError::ImageTooLarge)
        } else {
            Ok(())
        }
    }

    pub fn load_bootrom(&self, path: &Path) -> Result<(), MachineError> {
        let data = std::fs::read(path)?;
        self.load_bootrom_bytes(data)
    }

    pub fn load_bootrom_bytes(&self, data: Vec<u8>) -> Result<(), MachineError> {
        if !elf::is_elf(&data) {
            self.check_image_fits(data.len(), 0)?;
        }
        self.inner.boot.lock().unwrap().bootrom = Some(data);
        Ok(())
    }

    pub fn load_kernel(&self, path: &Path) -> Result<(), MachineError> {
        let data = std::fs::read(path)?;
        self.load_kernel_bytes(data)
    }

    pub fn load_kernel_bytes(&self, data: Vec<u8>) -> Result<(), MachineError> {
        if !elf::is_elf(&data) {
            self.check_image_fits(data.len(), self.inner.kernel_offset())?;
        }
        self.inner.boot.lock().unwrap().kernel = Some(data);
        Ok(())
    }

    pub fn load_dtb(&self, path: &Path) -> Result<(), MachineError> {
        let data = std::fs::read(path)?;
        self.check_image_fits(data.len(), 0)?;
        self.inner.boot.lock().unwrap().dtb = Some(data);
        Ok(())
    }

    /// Serialize the machine's generated device tree to a file.
    pub fn dump_dtb(&self, path: &Path) -> Result<(), MachineError> {
        let blob = self.inner.build_fdt().serialize();
        std::fs::write(path, blob)?;
        Ok(())
    }

    pub fn set_cmdline(&self, s: &str) {
        self.inner.boot.lock().unwrap().cmdline = s.to_owned();
    }

    pub fn append_cmdline(&self, s: &str) {
        let mut boot = self.inner.boot.lock().unwrap();
        if !boot.cmdline.is_empty() {
            boot.cmdline.push(' ');
        }
        boot.cmdline.push_str(s);
    }

    /// Register a reset interceptor; returning false vetoes the reset and
    /// powers the machine off instead.
    pub fn set_reset_handler(&self, f: impl FnMut(&MachineInner) -> bool + Send + 'static) {
        *self.inner.reset_handler.lock().unwrap() = Some(Box::new(f));
    }

    pub(crate) fn run_reset_handler(inner: &MachineInner) -> bool {
        let mut slot = inner.reset_handler.lock().unwrap();
        match slot.as_mut() {
            Some(f) => f(inner),
            None => true,
        }
    }

    /// Power on: load the reset image set and spawn hart threads.
    pub fn start(&self) -> Result<(), MachineError> {
        let _g = global_lock();
        if self.inner.running.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.inner.power.load(Ordering::Acquire) != POWER_ON {
            self.inner.reset_state()?;
            self.inner.power.store(POWER_ON, Ordering::Release);
        }
        MachineInner::spawn_harts(&self.inner);
        self.inner.running.store(true, Ordering::Release);
        eventloop::register(Arc::clone(&self.inner));
        Ok(())
    }

    /// Stop all hart threads. The machine stays powered and can be resumed
    /// with `start`.
    pub fn pause(&self) {
        let _g = global_lock();
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.pause_harts();
    }

    /// Request a machine reset (asynchronous; the event loop performs it).
    pub fn reset(&self) {
        self.inner.request_power(POWER_RESET);
    }

    /// Request power-off.
    pub fn poweroff(&self) {
        self.inner.request_power(POWER_OFF);
    }

    pub fn powered(&self) -> bool {
        self.inner.power.load(Ordering::Acquire) != POWER_OFF
    }

    /// Block until the machine powers off.
    pub fn wait_for_poweroff(&self) {
        while self.powered() || self.inner.running.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Drive the event loop on the calling thread until power-off, for
    /// embedders that disabled the background event loop.
    pub fn run(&self) -> Result<(), MachineError> {
        self.start()?;
        while eventloop::pass_one(&self.inner) {
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }

    pub fn read_ram(&self, paddr: u64, buf: &mut [u8]) -> bool {
        let view = self.inner.ram.view();
        if !view.contains(paddr, buf.len() as u64) {
            return false;
        }
        // SAFETY: containment checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                view.ptr.add((paddr - view.base) as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        true
    }

    pub fn write_ram(&self, paddr: u64, buf: &[u8]) -> bool {
        let view = self.inner.ram.view();
        if !view.contains(paddr, buf.len() as u64) {
            return false;
        }
        self.inner.mark_page_dirty(paddr);
        // SAFETY: containment checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                view.ptr.add((paddr - view.base) as usize),
                buf.len(),
            );
        }
        true
    }

    /// Raw DMA pointer into guest RAM for device models.
    pub fn dma_ptr(&self, paddr: u64, size: u64) -> Option<*mut u8> {
        let view = self.inner.ram.view();
        if view.contains(paddr, size) {
            view.host_ptr(paddr)
        } else {
            None
        }
    }

    /// Invalidate cached instruction translations after DMA wrote code.
    /// Briefly stops the harts, as translation caches are hart-owned.
    pub fn flush_icache(&self) {
        let was_running = self.inner.running.load(Ordering::Acquire);
        if was_running {
            self.pause();
        }
        for hart in &self.inner.harts {
            hart.state.lock().unwrap().tlb.flush_full();
        }
        if was_running {
            let _ = self.start();
        }
    }

    /// Attach a callback-driven MMIO region.
    pub fn attach_mmio(
        &self,
        dev: Arc<dyn MmioDevice>,
        base: u64,
        size: u64,
        min_op: u32,
        max_op: u32,
        name: &'static str,
    ) -> Result<MmioHandle, MmioError> {
        self.attach_slot(Some(dev), None, base, size, min_op, max_op, name)
    }

    /// Attach a direct-mapped region (RAM-like, cacheable).
    pub fn attach_mmio_direct(
        &self,
        mapping: DirectMapping,
        base: u64,
        size: u64,
        name: &'static str,
    ) -> Result<MmioHandle, MmioError> {
        self.attach_slot(None, Some(mapping), base, size, 1, 8, name)
    }

    #[allow(clippy::too_many_arguments)]
    fn attach_slot(
        &self,
        dev: Option<Arc<dyn MmioDevice>>,
        mapping: Option<DirectMapping>,
        base: u64,
        size: u64,
        min_op: u32,
        max_op: u32,
        name: &'static str,
    ) -> Result<MmioHandle, MmioError> {
        let was_running = self.inner.running.load(Ordering::Acquire);
        if was_running {
            self.pause();
        }
        let result = (|| {
            let (min_op, max_op) =
                mmio::normalize_ops(min_op, max_op).ok_or(MmioError::OpSize(min_op, max_op))?;
            let zone = MmioZone {
                base,
                size,
                min_op,
                max_op,
                name,
                machine: Arc::downgrade(&self.inner),
            };
            let mut slots = self.inner.mmio.write().unwrap();
            if size == 0
                || mmio::zone_collides(
                    &slots,
                    (self.inner.ram.base, self.inner.ram.size),
                    base,
                    size,
                )
            {
                if let Some(dev) = &dev {
                    dev.remove(&zone);
                }
                return Err(MmioError::Overlap(base, size));
            }
            slots.push(MmioSlot {
                zone,
                dev,
                mapping,
                dead: false,
            });
            info!("mmio attach: {} at {:#x}+{:#x}", name, base, size);
            Ok(MmioHandle(slots.len() - 1))
        })();
        if was_running {
            let _ = self.start();
        }
        result
    }

    /// Detach a region, leaving a placeholder so the handle stays valid.
    /// When the machine is off, the zone's size is zeroed so the address
    /// space becomes reusable.
    pub fn detach_mmio(&self, handle: MmioHandle) {
        let was_running = self.inner.running.load(Ordering::Acquire);
        if was_running {
            self.pause();
        }
        let mut had_mapping = false;
        {
            let mut slots = self.inner.mmio.write().unwrap();
            if let Some(slot) = slots.get_mut(handle.0) {
                if let Some(dev) = slot.dev.take() {
                    dev.remove(&slot.zone);
                }
                had_mapping = slot.mapping.take().is_some();
                slot.dead = true;
                if self.inner.power.load(Ordering::Acquire) == POWER_OFF {
                    slot.zone.size = 0;
                }
                info!("mmio detach: {}", slot.zone.name);
            }
        }
        if had_mapping {
            // Cached translations may point into the freed mapping.
            self.inner.flush_all_tlbs();
        }
        if was_running {
            let _ = self.start();
        }
    }

    /// Look up a region's placement by handle.
    pub fn get_mmio(&self, handle: MmioHandle) -> Option<(u64, u64)> {
        let slots = self.inner.mmio.read().unwrap();
        slots.get(handle.0).map(|s| (s.zone.base, s.zone.size))
    }

    /// Find a free zone of `size` bytes at or after `want`.
    pub fn mmio_zone_auto(&self, want: u64, size: u64) -> u64 {
        let slots = self.inner.mmio.read().unwrap();
        mmio::zone_auto(
            &slots,
            (self.inner.ram.base, self.inner.ram.size),
            want,
            size,
        )
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.pause();
        eventloop::unregister(&self.inner);
        // MMIO teardown in reverse attach order; harts and RAM drop with
        // the inner body.
        let mut slots = self.inner.mmio.write().unwrap();
        for slot in slots.iter_mut().rev() {
            if let Some(dev) = slot.dev.take() {
                dev.remove(&slot.zone);
            }
            slot.mapping = None;
            slot.dead = true;
        }
    }
}
