//! Execution engine: TB cache and per-vCPU dispatcher.
//!
//! Drives the lookup → translate → execute cycle for any number of
//! vCPUs sharing one guest address space, one code arena and one TB
//! cache, and keeps translated code coherent with guest memory
//! (self-modifying code, permission changes, flushes).
//!
//! Reference: `~/qemu/accel/tcg/cpu-exec.c`,
//! `~/qemu/accel/tcg/translate-all.c`, `~/qemu/accel/tcg/tb-maint.c`,
//! `~/qemu/cpu-common.c`.

pub mod config;
pub mod cpu;
pub mod debug;
pub mod error;
pub mod exclusive;
pub mod exec_loop;
mod fetch;
pub mod invalidate;
pub mod mttcg;
pub mod rr;
pub mod stats;
pub mod tb_maint;
pub mod tb_store;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use log::info;
use parking_lot::{Mutex, RwLock};
use smtcg_backend::{CodeBuffer, HostCodeGen};
use smtcg_frontend::GuestFrontend;
use smtcg_mmu::MemoryMap;

pub use config::TcgConfig;
pub use cpu::{CpuWork, VCpu};
pub use error::{ExecError, GuestFault};
pub use exclusive::{ExecSection, Exclusive, ExclusiveGuard};
pub use exec_loop::{Dispatcher, ExitReason};
pub use mttcg::{spawn_vcpu, Control};
pub use rr::RoundRobin;
pub use stats::ExecStats;
pub use tb_store::{TbInsert, TbStore};

use tb_maint::PageIndex;

/// State shared by every vCPU of one emulated machine.
pub struct Engine {
    config: TcgConfig,
    mem: Arc<MemoryMap>,
    frontend: Arc<dyn GuestFrontend>,
    backend: Arc<dyn HostCodeGen>,
    code_buf: CodeBuffer,
    tbs: TbStore,
    /// Guest page → TBs translated from it. Lock order: exclusive
    /// section, big lock, page flags, this, TB hash, TB jump lock, TLB.
    pages: Mutex<PageIndex>,
    flush_count: AtomicU32,
    exclusive: Exclusive,
    breakpoints: RwLock<BTreeSet<u64>>,
    next_cpu_index: AtomicUsize,
}

impl Engine {
    pub fn new(
        config: TcgConfig,
        mem: Arc<MemoryMap>,
        frontend: Arc<dyn GuestFrontend>,
        backend: Arc<dyn HostCodeGen>,
    ) -> Result<Arc<Self>, ExecError> {
        config.validate()?;
        let code_buf = CodeBuffer::new(config.code_gen_buffer_size).map_err(ExecError::Arena)?;
        info!(
            "engine: guest {} host {} arena {} KiB, {} TBs max",
            frontend.name(),
            backend.name(),
            config.code_gen_buffer_size / 1024,
            config.max_tbs
        );
        Ok(Arc::new(Self {
            tbs: TbStore::new(config.max_tbs),
            config,
            mem,
            frontend,
            backend,
            code_buf,
            pages: Mutex::new(PageIndex::default()),
            flush_count: AtomicU32::new(0),
            exclusive: Exclusive::new(),
            breakpoints: RwLock::new(BTreeSet::new()),
            next_cpu_index: AtomicUsize::new(0),
        }))
    }

    pub fn config(&self) -> &TcgConfig {
        &self.config
    }

    pub fn mem(&self) -> &Arc<MemoryMap> {
        &self.mem
    }

    pub fn frontend(&self) -> &dyn GuestFrontend {
        &*self.frontend
    }

    pub fn backend(&self) -> &dyn HostCodeGen {
        &*self.backend
    }

    pub fn code_buf(&self) -> &CodeBuffer {
        &self.code_buf
    }

    pub fn tb_store(&self) -> &TbStore {
        &self.tbs
    }

    /// Number of completed code cache flushes.
    pub fn flush_count(&self) -> u32 {
        self.flush_count.load(Ordering::Acquire)
    }

    pub fn exclusive(&self) -> &Exclusive {
        &self.exclusive
    }

    /// Stop every vCPU at a block boundary until the guard drops.
    pub fn start_exclusive(&self) -> ExclusiveGuard<'_> {
        self.exclusive.start_exclusive()
    }

    /// Registered vCPUs.
    pub fn vcpus(&self) -> Vec<VCpu> {
        self.exclusive.cpus()
    }

    /// Look up a live TB by key in the shared cache.
    pub fn tb_lookup(&self, pc: u64, flags: u32, cflags: u32) -> Option<usize> {
        self.tbs.lookup(pc, flags, cflags)
    }

    pub(crate) fn alloc_cpu_index(&self) -> usize {
        self.next_cpu_index.fetch_add(1, Ordering::Relaxed)
    }
}
