//! End-to-end boot and reset behaviour.

mod common;

use common::*;
use rvbox::csr::PrivMode;
use rvbox::fdt;
use rvbox::machine::Machine;

#[test]
fn flat_bootrom_traps_with_ecall_from_m() {
    // addi a0, x0, 7; ecall — the hart should take an environment call
    // from M with mepc at the reset PC and a0 intact.
    let m = machine(false, 1);
    let mut image = Vec::new();
    image.extend_from_slice(&addi(10, 0, 7).to_le_bytes());
    image.extend_from_slice(&ECALL.to_le_bytes());
    m.load_bootrom_bytes(image).unwrap();
    m.inner().reset_state().unwrap();

    run_until_trap(&m);

    let st = m.inner().harts[0].state.lock().unwrap();
    assert_eq!(st.csr.cause[PrivMode::Machine as usize], 11);
    assert_eq!(st.csr.epc[PrivMode::Machine as usize], MEM_BASE + 4);
    assert_eq!(st.x(10), 7);
    assert_eq!(st.prv, PrivMode::Machine);
}

#[test]
fn reset_lays_out_kernel_dtb_and_boot_registers() {
    let m = machine(true, 2);
    let kernel: Vec<u8> = (0u32..64).flat_map(|x| x.to_le_bytes()).collect();
    m.load_kernel_bytes(kernel.clone()).unwrap();
    m.set_cmdline("console=ttyS0");
    m.inner().reset_state().unwrap();

    // Kernel image at the RV64 offset.
    let mut buf = vec![0u8; kernel.len()];
    assert!(m.read_ram(MEM_BASE + 0x200000, &mut buf));
    assert_eq!(buf, kernel);

    for (i, hart) in m.inner().harts.iter().enumerate() {
        let st = hart.state.lock().unwrap();
        assert_eq!(st.x(10), i as u64, "a0 carries the hart index");
        let a1 = st.x(11);
        let mut magic = [0u8; 4];
        assert!(m.read_ram(a1, &mut magic), "a1 points into RAM");
        assert_eq!(magic, [0xD0, 0x0D, 0xFE, 0xED]);
        assert_eq!(st.pc, MEM_BASE);
        assert_eq!(st.prv, PrivMode::Machine);
    }
}

#[test]
fn reset_restores_clobbered_kernel_image() {
    let m = machine(true, 1);
    let kernel = vec![0xA5u8; 4096];
    m.load_kernel_bytes(kernel.clone()).unwrap();
    m.inner().reset_state().unwrap();

    assert!(m.write_ram(MEM_BASE + 0x200000, &[0u8; 4096]));
    m.inner().reset_state().unwrap();

    let mut buf = vec![0u8; 4096];
    assert!(m.read_ram(MEM_BASE + 0x200000, &mut buf));
    assert_eq!(buf, kernel);
}

#[test]
fn cmdline_round_trips_through_fdt() {
    let m = machine(true, 1);
    m.set_cmdline("root=/dev/vda");
    m.append_cmdline("quiet");
    let blob = m.inner().build_fdt().serialize();
    assert_eq!(
        fdt::bootargs_from_blob(&blob).as_deref(),
        Some("root=/dev/vda quiet")
    );
}

#[test]
fn dtb_lands_at_requested_address() {
    let m = machine(true, 1);
    m.set_opt(rvbox::MachineOpt::DtbAddr, MEM_BASE + 0x10_0000)
        .unwrap();
    m.inner().reset_state().unwrap();
    let st = m.inner().harts[0].state.lock().unwrap();
    assert_eq!(st.x(11), MEM_BASE + 0x10_0000);
}

#[test]
fn images_load_from_disk_and_dtb_dumps() {
    let dir = tempfile::tempdir().unwrap();
    let rom = dir.path().join("boot.bin");
    let dtb = dir.path().join("out.dtb");
    let mut image = Vec::new();
    image.extend_from_slice(&addi(10, 0, 9).to_le_bytes());
    image.extend_from_slice(&ECALL.to_le_bytes());
    std::fs::write(&rom, &image).unwrap();

    let m = machine(true, 1);
    m.load_bootrom(&rom).unwrap();
    m.set_cmdline("earlycon");
    m.dump_dtb(&dtb).unwrap();

    let blob = std::fs::read(&dtb).unwrap();
    assert_eq!(&blob[..4], &[0xD0, 0x0D, 0xFE, 0xED]);
    assert_eq!(fdt::bootargs_from_blob(&blob).as_deref(), Some("earlycon"));

    m.inner().reset_state().unwrap();
    run_until_trap(&m);
    let st = m.inner().harts[0].state.lock().unwrap();
    assert_eq!(st.x(10), 9);
}

#[test]
fn bad_geometry_is_rejected() {
    assert!(Machine::new(MEM_BASE + 1, MEM_SIZE, 1, true).is_err());
    assert!(Machine::new(MEM_BASE, MEM_SIZE + 5, 1, true).is_err());
    assert!(Machine::new(MEM_BASE, MEM_SIZE, 0, true).is_err());
    assert!(Machine::new(MEM_BASE, MEM_SIZE, 2000, true).is_err());
}

#[test]
fn oversized_flat_image_is_rejected() {
    let m = machine(true, 1);
    assert!(m
        .load_bootrom_bytes(vec![0u8; (MEM_SIZE + 4096) as usize])
        .is_err());
}

#[test]
fn read_only_csr_write_raises_illegal() {
    // csrrw x0, mhartid, x1 → illegal instruction with the insn as tval.
    let m = machine(true, 1);
    let insn = csrrw(0, 0xF14, 1);
    let mut image = Vec::new();
    image.extend_from_slice(&insn.to_le_bytes());
    m.load_bootrom_bytes(image).unwrap();
    m.inner().reset_state().unwrap();

    run_until_trap(&m);

    let st = m.inner().harts[0].state.lock().unwrap();
    assert_eq!(st.csr.cause[PrivMode::Machine as usize], 2);
    assert_eq!(st.csr.tval[PrivMode::Machine as usize], insn as u64);
    assert_eq!(st.csr.epc[PrivMode::Machine as usize], MEM_BASE);
}

#[test]
fn fence_i_makes_stored_code_visible() {
    // Overwrite the instruction at +0x40 (initially addi a0, x0, 1) with
    // addi a0, x0, 42, fence.i, then jump to it; a0 shows which one ran.
    // RV32: lui-built addresses are plain 32-bit there.
    let m = machine(false, 1);
    let target = MEM_BASE + 0x40;

    let patch = addi(10, 0, 42);
    let prog = [
        lui(1, 0x80000),          // x1 = 0x80000000
        addi(1, 1, 0x40),         // x1 = target
        lui(2, patch >> 12),      // x2 = patch (upper)
        addi(2, 2, (patch & 0xFFF) as i32), // patch bits 11:0 < 0x800, no carry
        sw(2, 1, 0),
        FENCE_I,
        jal(0, 0x40 - 0x18),      // jump to target from pc = base+0x18
    ];
    m.inner().reset_state().unwrap();
    write_code(&m, MEM_BASE, &prog);
    write_code(&m, target, &[addi(10, 0, 1), ECALL]);

    run_until_trap(&m);

    let st = m.inner().harts[0].state.lock().unwrap();
    assert_eq!(st.csr.cause[PrivMode::Machine as usize], 11);
    assert_eq!(st.x(10), 42, "the freshly stored instruction executed");
}
