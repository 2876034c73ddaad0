//! rvbox CLI: boot a RISC-V machine from the command line.
//!
//! ```text
//! rvbox --bootrom fw_payload.bin [--kernel Image] [--rv32] [--harts N]
//!       [--mem MiB] [--cmdline "..."] [--dtb file] [--dump-dtb file]
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::info;

use rvbox::devices::{uart::UartSink, Clint, Ns16550, Syscon};
use rvbox::machine::{Machine, MachineOpt};

const DEFAULT_MEM_BASE: u64 = 0x8000_0000;

struct Args {
    rv32: bool,
    harts: u32,
    mem_mib: u64,
    bootrom: Option<PathBuf>,
    kernel: Option<PathBuf>,
    dtb: Option<PathBuf>,
    dump_dtb: Option<PathBuf>,
    cmdline: Option<String>,
    max_cpu: Option<u64>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        rv32: false,
        harts: 1,
        mem_mib: 256,
        bootrom: None,
        kernel: None,
        dtb: None,
        dump_dtb: None,
        cmdline: None,
        max_cpu: None,
    };
    let mut it = std::env::args().skip(1);
    while let Some(a) = it.next() {
        let mut value = || {
            it.next()
                .with_context(|| format!("{} needs a value", a))
        };
        match a.as_str() {
            "--rv32" => args.rv32 = true,
            "--harts" => args.harts = value()?.parse()?,
            "--mem" => args.mem_mib = value()?.parse()?,
            "--bootrom" => args.bootrom = Some(value()?.into()),
            "--kernel" => args.kernel = Some(value()?.into()),
            "--dtb" => args.dtb = Some(value()?.into()),
            "--dump-dtb" => args.dump_dtb = Some(value()?.into()),
            "--cmdline" => args.cmdline = Some(value()?),
            "--max-cpu" => args.max_cpu = Some(value()?.parse()?),
            "--help" | "-h" => {
                eprintln!(
                    "usage: rvbox --bootrom FILE [--kernel FILE] [--dtb FILE] \
                     [--dump-dtb FILE] [--rv32] [--harts N] [--mem MiB] \
                     [--cmdline STR] [--max-cpu PCT]"
                );
                std::process::exit(0);
            }
            other => bail!("unknown argument: {}", other),
        }
    }
    Ok(args)
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .init();

    let args = parse_args()?;
    if args.bootrom.is_none() && args.dump_dtb.is_none() {
        bail!("nothing to do: pass --bootrom (or --dump-dtb)");
    }

    let machine = Machine::new(
        DEFAULT_MEM_BASE,
        args.mem_mib << 20,
        args.harts,
        !args.rv32,
    )?;
    if let Some(pct) = args.max_cpu {
        machine.set_opt(MachineOpt::MaxCpuPercent, pct)?;
    }

    // The canonical virt-style peripherals.
    machine.attach_mmio(
        Arc::new(Clint::new()),
        0x0200_0000,
        rvbox::devices::clint::CLINT_SIZE,
        4,
        8,
        "clint",
    )?;
    machine.attach_mmio(
        Arc::new(Syscon::new()),
        0x0010_0000,
        0x1000,
        1,
        4,
        "syscon",
    )?;
    machine.attach_mmio(
        Arc::new(Ns16550::new(UartSink::Stdout)),
        0x1000_0000,
        0x100,
        1,
        1,
        "uart",
    )?;

    if let Some(s) = &args.cmdline {
        machine.set_cmdline(s);
    }
    if let Some(p) = &args.bootrom {
        machine.load_bootrom(p).context("loading bootrom")?;
    }
    if let Some(p) = &args.kernel {
        machine.load_kernel(p).context("loading kernel")?;
    }
    if let Some(p) = &args.dtb {
        machine.load_dtb(p).context("loading dtb")?;
    }
    if let Some(p) = &args.dump_dtb {
        machine.dump_dtb(p).context("dumping dtb")?;
        info!("device tree written to {}", p.display());
        if args.bootrom.is_none() {
            return Ok(());
        }
    }

    info!(
        "starting {} machine: {} hart(s), {} MiB RAM",
        if args.rv32 { "RV32" } else { "RV64" },
        args.harts,
        args.mem_mib
    );
    machine.start()?;
    machine.wait_for_poweroff();
    rvbox::eventloop::shutdown();
    Ok(())
}
