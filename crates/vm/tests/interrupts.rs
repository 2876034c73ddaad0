//! Interrupt delivery, delegation masking, WFI timer wakeup.

mod common;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use common::*;
use rvbox::csr::PrivMode;
use rvbox::hart::{MIP_MSIP, MIP_SSIP, MIP_STIP};
use rvbox::machine::TIMER_FREQ;

#[test]
fn delegated_s_irq_is_masked_in_m_mode() {
    let m = machine(true, 1);
    m.inner().reset_state().unwrap();
    let inner = m.inner().clone();
    let mut st = inner.harts[0].state.lock().unwrap();

    st.csr.ideleg[PrivMode::Machine as usize] = MIP_SSIP;
    st.shared.ip.store(MIP_SSIP, Ordering::Relaxed);
    st.shared.ie.store(MIP_SSIP, Ordering::Relaxed);
    st.prv = PrivMode::Machine;
    st.pc = MEM_BASE;

    // In M-mode a delegated supervisor IRQ is never deliverable, with or
    // without mstatus.MIE.
    st.check_interrupts(&inner);
    assert_eq!(st.pc, MEM_BASE);
    st.csr.status |= 1 << 3; // MIE
    st.check_interrupts(&inner);
    assert_eq!(st.pc, MEM_BASE);

    // Dropping to S-mode with SIE set delivers it through stvec.
    st.csr.status |= 1 << 1; // SIE
    st.csr.tvec[PrivMode::Supervisor as usize] = MEM_BASE + 0x100;
    st.prv = PrivMode::Supervisor;
    st.check_interrupts(&inner);
    assert_eq!(st.pc, MEM_BASE + 0x100);
    assert_eq!(
        st.csr.cause[PrivMode::Supervisor as usize],
        (1 << 63) | 1
    );
    assert_eq!(st.prv, PrivMode::Supervisor);
}

#[test]
fn undelegated_irq_preempts_s_mode_into_m() {
    let m = machine(true, 1);
    m.inner().reset_state().unwrap();
    let inner = m.inner().clone();
    let mut st = inner.harts[0].state.lock().unwrap();

    st.shared.ip.store(MIP_MSIP, Ordering::Relaxed);
    st.shared.ie.store(MIP_MSIP, Ordering::Relaxed);
    st.prv = PrivMode::Supervisor;
    st.pc = MEM_BASE + 8;
    st.csr.tvec[PrivMode::Machine as usize] = MEM_BASE + 0x200;

    // Machine-level IRQ in S-mode is taken regardless of mstatus.MIE.
    st.check_interrupts(&inner);
    assert_eq!(st.prv, PrivMode::Machine);
    assert_eq!(st.pc, MEM_BASE + 0x200);
    assert_eq!(st.csr.epc[PrivMode::Machine as usize], MEM_BASE + 8);
    assert_eq!(st.csr.cause[PrivMode::Machine as usize], (1 << 63) | 3);
}

#[test]
fn vectored_dispatch_adds_cause_offset() {
    let m = machine(true, 1);
    m.inner().reset_state().unwrap();
    let inner = m.inner().clone();
    let mut st = inner.harts[0].state.lock().unwrap();

    st.shared.ip.store(MIP_MSIP, Ordering::Relaxed);
    st.shared.ie.store(MIP_MSIP, Ordering::Relaxed);
    st.prv = PrivMode::User;
    st.csr.tvec[PrivMode::Machine as usize] = (MEM_BASE + 0x200) | 1;
    st.check_interrupts(&inner);
    assert_eq!(st.pc, MEM_BASE + 0x200 + 4 * 3);
}

#[test]
fn wfi_wakes_on_stimecmp_and_traps_past_the_wfi() {
    // Sstc timer interrupt delivered out of WFI in S-mode: the handler at
    // stvec records scause and sepc into RAM.
    let m = machine(true, 1);
    m.inner().reset_state().unwrap();

    let stvec = MEM_BASE + 0x100;
    let scratch = MEM_BASE + 0x2000;
    // At reset PC: wfi; j .
    write_code(&m, MEM_BASE, &[WFI, J_SELF]);
    // Handler: sw scause→0(x6); sw sepc→4(x6); j .
    write_code(
        &m,
        stvec,
        &[
            csrrs(5, 0x142, 0), // scause
            sw(5, 6, 0),
            csrrs(5, 0x141, 0), // sepc
            sw(5, 6, 4),
            J_SELF,
        ],
    );

    {
        let inner = m.inner().clone();
        let mut st = inner.harts[0].state.lock().unwrap();
        st.prv = PrivMode::Supervisor;
        st.pc = MEM_BASE;
        st.set_x(6, scratch);
        st.csr.tvec[PrivMode::Supervisor as usize] = stvec;
        st.csr.ideleg[PrivMode::Machine as usize] = MIP_STIP;
        st.csr.envcfg[PrivMode::Machine as usize] = 1 << 63; // STCE
        st.csr.status |= 1 << 1; // SIE
        st.shared.ie.store(MIP_STIP, Ordering::Relaxed);
        st.csr.stimecmp = inner.timer.now() + TIMER_FREQ / 1000; // +1 ms
    }

    let inner = m.inner().clone();
    rvbox::machine::MachineInner::spawn_harts(&inner);

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut seen = None;
    while Instant::now() < deadline {
        let mut buf = [0u8; 8];
        assert!(m.read_ram(scratch, &mut buf));
        let scause = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if scause != 0 {
            seen = Some(buf);
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    inner.pause_harts();

    let buf = seen.expect("timer interrupt did not arrive");
    let scause32 = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let sepc32 = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    // The handler stored the low words: cause 5 with the interrupt bit in
    // the high word (not visible here), sepc just past the WFI.
    assert_eq!(scause32, 5);
    assert_eq!(sepc32 as u64, (MEM_BASE + 4) & 0xFFFF_FFFF);

    let st = inner.harts[0].state.lock().unwrap();
    assert_eq!(st.csr.cause[PrivMode::Supervisor as usize], (1 << 63) | 5);
}

#[test]
fn clint_msip_interrupts_a_running_hart() {
    use rvbox::devices::Clint;
    use std::sync::Arc;

    let m = machine(true, 1);
    m.attach_mmio(
        Arc::new(Clint::new()),
        0x0200_0000,
        rvbox::devices::clint::CLINT_SIZE,
        4,
        8,
        "clint",
    )
    .unwrap();
    m.inner().reset_state().unwrap();

    let mtvec = MEM_BASE + 0x100;
    let scratch = MEM_BASE + 0x2000;
    write_code(&m, MEM_BASE, &[J_SELF]);
    write_code(
        &m,
        mtvec,
        &[
            csrrs(5, 0x342, 0), // mcause
            sw(5, 6, 0),
            J_SELF,
        ],
    );
    {
        let inner = m.inner().clone();
        let mut st = inner.harts[0].state.lock().unwrap();
        st.set_x(6, scratch);
        st.csr.tvec[PrivMode::Machine as usize] = mtvec;
        st.csr.status |= 1 << 3; // MIE
        st.shared.ie.store(MIP_MSIP, Ordering::Relaxed);
    }

    let inner = m.inner().clone();
    rvbox::machine::MachineInner::spawn_harts(&inner);

    // Ring the software interrupt through the CLINT register, as a store
    // from "another hart" would.
    {
        use rvbox::mmio::{mmio_access, MmioBuf};
        use rvbox::mmu::Access;
        match mmio_access(&inner, 0x0200_0000, MmioBuf::Write(&1u32.to_le_bytes()), Access::Write) {
            rvbox::mmio::MmioOutcome::Done => {}
            _ => panic!("msip write failed"),
        }
    }

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut fired = false;
    while Instant::now() < deadline {
        let mut buf = [0u8; 4];
        assert!(m.read_ram(scratch, &mut buf));
        if u32::from_le_bytes(buf) == 3 {
            fired = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    inner.pause_harts();
    assert!(fired, "MSIP never delivered");
}
