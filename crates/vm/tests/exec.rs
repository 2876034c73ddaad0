//! Interpreter semantics: integer edge cases, compressed forms, atomics,
//! FP conversions, privileged returns.

mod common;

use common::*;
use rvbox::csr::{PrivMode, MSTATUS_MPP, MSTATUS_MPRV, MSTATUS_TW};

fn op(funct7: u32, rs2: u32, rs1: u32, f3: u32, rd: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (f3 << 12) | (rd << 7) | 0x33
}

fn amo(funct5: u32, rs2: u32, rs1: u32, f3: u32, rd: u32) -> u32 {
    (funct5 << 27) | (rs2 << 20) | (rs1 << 15) | (f3 << 12) | (rd << 7) | 0x2F
}

fn op_fp(funct7: u32, rs2: u32, rs1: u32, rm: u32, rd: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (rm << 12) | (rd << 7) | 0x53
}

fn slli(rd: u32, rs1: u32, sh: u32) -> u32 {
    (sh << 20) | (rs1 << 15) | (1 << 12) | (rd << 7) | 0x13
}

fn srli(rd: u32, rs1: u32, sh: u32) -> u32 {
    (sh << 20) | (rs1 << 15) | (5 << 12) | (rd << 7) | 0x13
}

/// lui sign-extends on RV64; chase it with slli/srli to get a plain
/// 32-bit physical address into `rd`.
fn load_addr32(rd: u32, imm20: u32) -> [u32; 3] {
    [lui(rd, imm20), slli(rd, rd, 32), srli(rd, rd, 32)]
}

fn run_program(m: &rvbox::Machine, words: &[u32]) {
    m.inner().reset_state().unwrap();
    write_code(m, MEM_BASE, words);
    run_until_trap(m);
}

#[test]
fn division_edge_cases() {
    let m = machine(true, 1);
    run_program(
        &m,
        &[
            addi(5, 0, -1),       // x5 = -1
            addi(6, 0, 0),        // x6 = 0
            op(1, 6, 5, 4, 7),    // div x7, x5, x6  → -1
            op(1, 6, 5, 6, 28),   // rem x28, x5, x6 → x5
            addi(8, 0, 1),
            slli(8, 8, 63),       // x8 = i64::MIN
            op(1, 5, 8, 4, 9),    // div x9, x8, x5  → MIN (overflow)
            op(1, 5, 8, 6, 29),   // rem x29, x8, x5 → 0
            op(1, 6, 5, 5, 30),   // divu x30, x5, x6 → all-ones
            ECALL,
        ],
    );
    let st = m.inner().harts[0].state.lock().unwrap();
    assert_eq!(st.x(7), u64::MAX);
    assert_eq!(st.x(28), u64::MAX);
    assert_eq!(st.x(9), 1u64 << 63);
    assert_eq!(st.x(29), 0);
    assert_eq!(st.x(30), u64::MAX);
}

#[test]
fn mulh_variants() {
    let m = machine(true, 1);
    run_program(
        &m,
        &[
            addi(5, 0, -1),
            op(1, 5, 5, 3, 6), // mulhu x6 = (2^64-1)^2 >> 64
            op(1, 5, 5, 1, 7), // mulh  x7 = (-1 * -1) >> 64 = 0
            op(1, 5, 5, 2, 8), // mulhsu x8 = (-1 * unsigned -1) >> 64 = -1? no: -(2^64-1) >> 64
            ECALL,
        ],
    );
    let st = m.inner().harts[0].state.lock().unwrap();
    assert_eq!(st.x(6), u64::MAX - 1);
    assert_eq!(st.x(7), 0);
    assert_eq!(st.x(8), u64::MAX);
}

#[test]
fn rv32_registers_stay_sign_extended() {
    let m = machine(false, 1);
    run_program(
        &m,
        &[
            lui(5, 0x80000),   // x5 = 0x80000000 (negative as i32)
            op(0, 0, 5, 5, 6), // srl x6, x5, x0 → unchanged low word
            addi(7, 5, -1),    // x7 = 0x7FFFFFFF
            ECALL,
        ],
    );
    let st = m.inner().harts[0].state.lock().unwrap();
    assert_eq!(st.x(5), 0xFFFF_FFFF_8000_0000);
    assert_eq!(st.x(7), 0x7FFF_FFFF);
    // Unsigned comparison sees the 32-bit ordering.
    assert!(st.x(7) < st.x(5));
}

#[test]
fn branches_follow_comparison_results() {
    // beq not taken, then bne taken over a poison instruction.
    let beq = |rs1: u32, rs2: u32, off: u32| -> u32 {
        (((off >> 12) & 1) << 31)
            | (((off >> 5) & 0x3F) << 25)
            | (rs2 << 20)
            | (rs1 << 15)
            | (((off >> 1) & 0xF) << 8)
            | (((off >> 11) & 1) << 7)
            | 0x63
    };
    let bne = |rs1: u32, rs2: u32, off: u32| beq(rs1, rs2, off) | (1 << 12);

    let m = machine(true, 1);
    run_program(
        &m,
        &[
            addi(5, 0, 1),
            beq(5, 0, 8),     // not taken
            addi(6, 0, 2),    // executes
            bne(5, 0, 8),     // taken, skips the poison addi
            addi(6, 0, 99),
            ECALL,
        ],
    );
    let st = m.inner().harts[0].state.lock().unwrap();
    assert_eq!(st.x(6), 2);
}

#[test]
fn compressed_li_and_ebreak() {
    let m = machine(true, 1);
    m.inner().reset_state().unwrap();
    // c.li a0, 5 ; c.ebreak packed into one 32-bit word.
    write_code(&m, MEM_BASE, &[0x9002_4515]);
    run_until_trap(&m);
    let st = m.inner().harts[0].state.lock().unwrap();
    assert_eq!(st.x(10), 5);
    assert_eq!(st.csr.cause[PrivMode::Machine as usize], 3);
    assert_eq!(st.csr.epc[PrivMode::Machine as usize], MEM_BASE + 2);
}

#[test]
fn amoadd_and_lr_sc_sequence() {
    let m = machine(true, 1);
    let cell = 0x1000;
    let [a, b, c] = load_addr32(5, 0x80001); // x5 = 0x80001000
    run_program(
        &m,
        &[
            a,
            b,
            c,
            addi(7, 0, 10),
            sw(7, 5, 0),          // [cell] = 10
            addi(7, 0, 5),
            amo(0x00, 7, 5, 2, 6), // amoadd.w x6 ← 10, [cell] = 15
            amo(0x02, 0, 5, 2, 8), // lr.w x8 ← 15
            amo(0x03, 7, 5, 2, 9), // sc.w → success, [cell] = 5
            amo(0x03, 7, 5, 2, 28), // sc.w again → fails, no reservation
            ECALL,
        ],
    );
    let st = m.inner().harts[0].state.lock().unwrap();
    assert_eq!(st.x(6), 10);
    assert_eq!(st.x(8), 15);
    assert_eq!(st.x(9), 0, "first sc succeeds");
    assert_eq!(st.x(28), 1, "second sc fails");
    drop(st);
    let mut bytes = [0u8; 4];
    assert!(m.read_ram(MEM_BASE + cell, &mut bytes));
    assert_eq!(u32::from_le_bytes(bytes), 5);
}

#[test]
fn misaligned_amo_traps() {
    let m = machine(true, 1);
    let [a, b, c] = load_addr32(5, 0x80001);
    run_program(
        &m,
        &[
            a,
            b,
            c,
            addi(5, 5, 2),         // misaligned by 2
            amo(0x00, 0, 5, 2, 6), // amoadd.w
        ],
    );
    let st = m.inner().harts[0].state.lock().unwrap();
    assert_eq!(st.csr.cause[PrivMode::Machine as usize], 6);
    assert_eq!(
        st.csr.tval[PrivMode::Machine as usize],
        MEM_BASE + 0x1002
    );
}

#[test]
fn fp_requires_fs_enabled_then_converts() {
    let m = machine(true, 1);
    run_program(
        &m,
        &[
            lui(5, 6),               // x5 = 0x6000 (FS = dirty)
            csrrs(0, 0x300, 5),      // enable FP in mstatus
            addi(6, 0, 3),
            op_fp(0x69, 0, 6, 0, 0), // fcvt.d.w f0, x6
            op_fp(0x01, 0, 0, 0, 1), // fadd.d f1, f0, f0
            op_fp(0x61, 0, 1, 1, 7), // fcvt.w.d x7, f1 (RTZ)
            ECALL,
        ],
    );
    let st = m.inner().harts[0].state.lock().unwrap();
    assert_eq!(st.fregs[0], 3.0f64.to_bits());
    assert_eq!(st.fregs[1], 6.0f64.to_bits());
    assert_eq!(st.x(7), 6);
}

#[test]
fn fp_with_fs_off_is_illegal() {
    let m = machine(true, 1);
    run_program(&m, &[op_fp(0x01, 0, 0, 0, 1)]); // fadd.d with FS = Off
    let st = m.inner().harts[0].state.lock().unwrap();
    assert_eq!(st.csr.cause[PrivMode::Machine as usize], 2);
}

#[test]
fn illegal_instruction_reports_bits() {
    let m = machine(true, 1);
    run_program(&m, &[0xFFFF_FFFF]);
    let st = m.inner().harts[0].state.lock().unwrap();
    assert_eq!(st.csr.cause[PrivMode::Machine as usize], 2);
    assert_eq!(st.csr.tval[PrivMode::Machine as usize], 0xFFFF_FFFF);
}

#[test]
fn mret_pops_the_privilege_stack() {
    let m = machine(true, 1);
    m.inner().reset_state().unwrap();
    let inner = m.inner().clone();
    let mut st = inner.harts[0].state.lock().unwrap();

    st.csr.epc[PrivMode::Machine as usize] = MEM_BASE + 0x40;
    st.csr.status |= 1 << 11; // MPP = S
    st.csr.status |= MSTATUS_MPRV | (1 << 7); // MPRV on, MPIE = 1
    assert!(st.mret());
    assert_eq!(st.prv, PrivMode::Supervisor);
    assert_eq!(st.pc, MEM_BASE + 0x40);
    assert_ne!(st.csr.status & (1 << 3), 0, "MIE restored from MPIE");
    assert_eq!(st.csr.status & MSTATUS_MPP, 0, "MPP reset to U");
    assert_eq!(st.csr.status & MSTATUS_MPRV, 0, "MPRV cleared leaving M");

    // From S-mode, mret is illegal.
    assert!(!st.mret());
}

#[test]
fn wfi_traps_when_tw_is_set_below_m() {
    let m = machine(true, 1);
    m.inner().reset_state().unwrap();
    write_code(&m, MEM_BASE, &[WFI]);
    {
        let inner = m.inner().clone();
        let mut st = inner.harts[0].state.lock().unwrap();
        st.csr.status |= MSTATUS_TW;
        st.prv = PrivMode::Supervisor;
    }
    run_until_trap(&m);
    let st = m.inner().harts[0].state.lock().unwrap();
    assert_eq!(st.csr.cause[PrivMode::Machine as usize], 2);
}

#[test]
fn x0_reads_zero_after_every_instruction() {
    let m = machine(true, 1);
    run_program(
        &m,
        &[
            addi(0, 0, 123), // write to x0 is discarded
            op(0, 0, 0, 0, 5), // add x5, x0, x0
            ECALL,
        ],
    );
    let st = m.inner().harts[0].state.lock().unwrap();
    assert_eq!(st.x(0), 0);
    assert_eq!(st.x(5), 0);
}

#[test]
fn aligned_u64_stores_are_never_torn() {
    // Two harts share one RAM cell: one flips it between two patterns
    // through the store path, the other reads it through the load path.
    let m = machine(true, 2);
    m.inner().reset_state().unwrap();
    let inner = m.inner().clone();
    let cell = MEM_BASE + 0x3000;

    const A: u64 = 0xAAAA_AAAA_AAAA_AAAA;
    const B: u64 = 0x5555_5555_5555_5555;

    let writer = {
        let inner = inner.clone();
        std::thread::spawn(move || {
            let mut st = inner.harts[0].state.lock().unwrap();
            for _ in 0..200_000 {
                assert!(st.store_u64(&inner, cell, A));
                assert!(st.store_u64(&inner, cell, B));
            }
        })
    };

    {
        let mut st = inner.harts[1].state.lock().unwrap();
        for _ in 0..200_000 {
            let v = st.load_u64(&inner, cell).unwrap();
            assert!(v == 0 || v == A || v == B, "torn value {:#x}", v);
        }
    }
    writer.join().unwrap();
}

#[test]
fn sc_to_a_different_address_fails() {
    let m = machine(true, 1);
    let [a, b, c] = load_addr32(5, 0x80001);
    run_program(
        &m,
        &[
            a,
            b,
            c,
            amo(0x02, 0, 5, 2, 8),  // lr.w at 0x80001000
            addi(5, 5, 64),
            amo(0x03, 8, 5, 2, 9),  // sc.w at 0x80001040 → fails
            ECALL,
        ],
    );
    let st = m.inner().harts[0].state.lock().unwrap();
    assert_eq!(st.x(9), 1);
}
