//! Run a raw RV64 image on the soft-MMU engine.

mod syscall;

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use log::info;
use smtcg_backend::TciCodeGen;
use smtcg_exec::{spawn_vcpu, Engine, RoundRobin, TcgConfig};
use smtcg_frontend::{RiscvCpu, RiscvFrontend};
use smtcg_mmu::{AddressSpace, GuestMemory, MemoryMap, PageFlags, TARGET_PAGE_SIZE};

use crate::syscall::Host;

fn parse_u64(s: &str) -> Result<u64, String> {
    let r = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(&hex.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    r.map_err(|e| format!("{s:?}: {e}"))
}

#[derive(Parser, Debug)]
#[command(name = "smtcg-run", version, about = "Run a raw RV64 image")]
struct Cli {
    /// Raw binary image.
    image: PathBuf,
    /// Guest address the image and RAM start at.
    #[arg(long, default_value = "0x80000000", value_parser = parse_u64)]
    load_addr: u64,
    /// Entry point; defaults to the load address.
    #[arg(long, value_parser = parse_u64)]
    entry: Option<u64>,
    /// Guest RAM size in bytes.
    #[arg(long, default_value = "0x4000000", value_parser = parse_u64)]
    mem_size: u64,
    /// Number of vCPUs; each starts with its hart id in a0.
    #[arg(long, default_value_t = 1)]
    vcpus: usize,
    /// Time-slice all vCPUs on one thread instead of one thread each.
    #[arg(long)]
    rr: bool,
    /// Guest instructions per block.
    #[arg(long)]
    max_insns: Option<u32>,
    /// Code arena size in MiB.
    #[arg(long)]
    tb_size: Option<usize>,
    /// Log per-vCPU statistics on exit.
    #[arg(long)]
    stats: bool,
}

impl Cli {
    fn config(&self) -> TcgConfig {
        let mut cfg = TcgConfig::from_env();
        if let Some(n) = self.max_insns {
            cfg = cfg.with_max_insns(n);
        }
        if let Some(mib) = self.tb_size {
            cfg = cfg.with_code_gen_buffer_size(mib.saturating_mul(1 << 20));
        }
        if self.stats {
            cfg = cfg.with_stats(true);
        }
        cfg
    }
}

fn run(cli: &Cli) -> Result<i32> {
    if cli.vcpus == 0 {
        bail!("--vcpus must be at least 1");
    }
    if cli.load_addr % TARGET_PAGE_SIZE != 0 || cli.mem_size % TARGET_PAGE_SIZE != 0 {
        bail!("--load-addr and --mem-size must be multiples of {TARGET_PAGE_SIZE:#x}");
    }
    let image = std::fs::read(&cli.image).with_context(|| format!("reading {}", cli.image.display()))?;
    if image.len() as u64 > cli.mem_size {
        bail!("image of {} bytes does not fit in {:#x} bytes of RAM", image.len(), cli.mem_size);
    }

    let space = Arc::new(GuestMemory::new(cli.mem_size as usize).context("allocating guest RAM")?);
    space.map_ram(cli.load_addr, cli.mem_size, 0)?;
    space
        .write_guest(cli.load_addr, &image)
        .context("loading the image")?;
    let mem = Arc::new(MemoryMap::new(space));

    let engine = Engine::new(cli.config(), mem, Arc::new(RiscvFrontend), Arc::new(TciCodeGen::new()))?;
    let ram_end = cli
        .load_addr
        .checked_add(cli.mem_size)
        .context("RAM extends past the top of the address space")?;
    engine
        .notify_permission_changed(cli.load_addr, ram_end, PageFlags::VALID | PageFlags::RWX | PageFlags::USER)
        .context("mapping guest RAM")?;

    let entry = cli.entry.unwrap_or(cli.load_addr);
    info!(
        "{}: {} bytes at {:#x}, entry {entry:#x}, {} vCPUs ({})",
        cli.image.display(),
        image.len(),
        cli.load_addr,
        cli.vcpus,
        if cli.rr { "round-robin" } else { "mttcg" }
    );

    let host = Arc::new(Host::new(Arc::clone(&engine)));
    let cpus = (0..cli.vcpus).map(|hart| {
        let mut cpu = RiscvCpu::new(entry);
        cpu.set_gpr(10, hart as u64);
        cpu
    });

    if cli.rr {
        let mut rr = RoundRobin::new(Arc::clone(&engine));
        for cpu in cpus {
            rr.add_cpu(Box::new(cpu));
        }
        rr.run(|hart, cpu, _, reason| host.handle_exit(hart, cpu, reason));
    } else {
        let mut handles = Vec::with_capacity(cli.vcpus);
        for (hart, cpu) in cpus.enumerate() {
            let host = Arc::clone(&host);
            let (_, h) = spawn_vcpu(Arc::clone(&engine), cpu, move |cpu, _, reason| {
                host.handle_exit(hart, cpu, reason)
            })
            .context("spawning a vCPU thread")?;
            handles.push(h);
        }
        for h in handles {
            if h.join().is_err() {
                bail!("a vCPU thread panicked");
            }
        }
    }

    Ok(host.exit_code().unwrap_or(0))
}

fn main() {
    let cli = Cli::parse();
    let default_filter = if cli.stats { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    match run(&cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("smtcg-run: {e:#}");
            process::exit(1);
        }
    }
}
