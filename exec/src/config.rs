//! Engine configuration.

use std::env;
use std::str::FromStr;

use log::warn;
use smtcg_core::tb::cflags::CF_COUNT_MASK;

use crate::error::ExecError;

const MIB: usize = 1024 * 1024;
const MIN_CODE_GEN_BUFFER_SIZE: usize = MIB;
const MAX_CODE_GEN_BUFFER_SIZE: usize = 2048 * MIB;

/// Tunables of the translation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcgConfig {
    /// Size of the shared code arena in bytes.
    pub code_gen_buffer_size: usize,
    /// Capacity of the TB slab; reaching it triggers a flush.
    pub max_tbs: usize,
    /// Default guest instruction budget per block.
    pub max_insns: u32,
    /// log2 of the TLB entries per MMU mode.
    pub tlb_bits: u32,
    pub nb_mmu_modes: usize,
    /// Code-page writes before a page gets a code bitmap.
    pub smc_bitmap_threshold: u32,
    /// Print per-vCPU statistics when a vCPU thread ends.
    pub stats: bool,
}

impl Default for TcgConfig {
    fn default() -> Self {
        Self {
            code_gen_buffer_size: 32 * MIB,
            max_tbs: 65536,
            max_insns: 512,
            tlb_bits: 8,
            nb_mmu_modes: 2,
            smc_bitmap_threshold: 10,
            stats: false,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring {name}={raw:?}: not a valid value");
            None
        }
    }
}

impl TcgConfig {
    /// Defaults overridden by `SMTCG_TB_SIZE` (MiB), `SMTCG_MAX_INSNS`,
    /// `SMTCG_TLB_BITS` and `SMTCG_STATS`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(mib) = env_parse::<usize>("SMTCG_TB_SIZE") {
            cfg = cfg.with_code_gen_buffer_size(mib.saturating_mul(MIB));
        }
        if let Some(n) = env_parse("SMTCG_MAX_INSNS") {
            cfg.max_insns = n;
        }
        if let Some(bits) = env_parse("SMTCG_TLB_BITS") {
            cfg.tlb_bits = bits;
        }
        if let Some(v) = env::var_os("SMTCG_STATS") {
            cfg.stats = !matches!(v.to_str(), Some("" | "0" | "false" | "no"));
        }
        cfg
    }

    /// Arena size, clamped to 1 MiB..=2 GiB.
    pub fn with_code_gen_buffer_size(mut self, size: usize) -> Self {
        self.code_gen_buffer_size = size.clamp(MIN_CODE_GEN_BUFFER_SIZE, MAX_CODE_GEN_BUFFER_SIZE);
        self
    }

    pub fn with_max_tbs(mut self, n: usize) -> Self {
        self.max_tbs = n;
        self
    }

    pub fn with_max_insns(mut self, n: u32) -> Self {
        self.max_insns = n;
        self
    }

    pub fn with_tlb_bits(mut self, bits: u32) -> Self {
        self.tlb_bits = bits;
        self
    }

    pub fn with_nb_mmu_modes(mut self, n: usize) -> Self {
        self.nb_mmu_modes = n;
        self
    }

    pub fn with_smc_bitmap_threshold(mut self, n: u32) -> Self {
        self.smc_bitmap_threshold = n;
        self
    }

    pub fn with_stats(mut self, on: bool) -> Self {
        self.stats = on;
        self
    }

    pub fn validate(&self) -> Result<(), ExecError> {
        if !(MIN_CODE_GEN_BUFFER_SIZE..=MAX_CODE_GEN_BUFFER_SIZE).contains(&self.code_gen_buffer_size) {
            return Err(ExecError::InvalidConfig(format!(
                "code buffer size {:#x} out of range",
                self.code_gen_buffer_size
            )));
        }
        if self.max_tbs == 0 {
            return Err(ExecError::InvalidConfig("max_tbs must be positive".into()));
        }
        if self.max_insns == 0 || self.max_insns > CF_COUNT_MASK {
            return Err(ExecError::InvalidConfig(format!(
                "max_insns {} out of range 1..={CF_COUNT_MASK}",
                self.max_insns
            )));
        }
        if !(4..=16).contains(&self.tlb_bits) {
            return Err(ExecError::InvalidConfig(format!(
                "tlb_bits {} out of range 4..=16",
                self.tlb_bits
            )));
        }
        if self.nb_mmu_modes == 0 || self.nb_mmu_modes > 16 {
            return Err(ExecError::InvalidConfig(format!(
                "nb_mmu_modes {} out of range 1..=16",
                self.nb_mmu_modes
            )));
        }
        Ok(())
    }
}
