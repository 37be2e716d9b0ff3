use std::fmt;

use smtcg_mmu::TlbStats;

/// Per-vCPU dispatcher counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecStats {
    /// Blocks found in the jump cache.
    pub jc_hits: u64,
    /// Blocks found in the shared hash table.
    pub hash_hits: u64,
    /// Blocks translated by this vCPU.
    pub translations: u64,
    /// Translations discarded because another vCPU published first.
    pub dup_translations: u64,
    pub chain_links: u64,
    pub insns: u64,

    pub exit_chain: u64,
    pub exit_nochain: u64,
    pub exit_requested: u64,
    pub exit_budget: u64,
    pub exit_exception: u64,
    pub exit_fault: u64,
    pub exit_smc: u64,

    /// Code cache flushes observed.
    pub flushes: u64,
    pub tlb: TlbStats,
}

impl ExecStats {
    pub fn lookups(&self) -> u64 {
        self.jc_hits + self.hash_hits + self.translations
    }
}

impl fmt::Display for ExecStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pct = |n: u64| {
            if self.lookups() == 0 {
                0.0
            } else {
                n as f64 * 100.0 / self.lookups() as f64
            }
        };
        writeln!(f, "TB lookups         {}", self.lookups())?;
        writeln!(f, "  jump cache       {} ({:.1}%)", self.jc_hits, pct(self.jc_hits))?;
        writeln!(f, "  hash table       {} ({:.1}%)", self.hash_hits, pct(self.hash_hits))?;
        writeln!(f, "  translated       {} ({:.1}%)", self.translations, pct(self.translations))?;
        writeln!(f, "  duplicates       {}", self.dup_translations)?;
        writeln!(f, "chain links        {}", self.chain_links)?;
        writeln!(f, "guest insns        {}", self.insns)?;
        writeln!(
            f,
            "exits              chain {} nochain {} requested {} budget {} exception {} fault {} smc {}",
            self.exit_chain,
            self.exit_nochain,
            self.exit_requested,
            self.exit_budget,
            self.exit_exception,
            self.exit_fault,
            self.exit_smc
        )?;
        writeln!(f, "code flushes       {}", self.flushes)?;
        write!(
            f,
            "TLB                fills {} victim hits {} flushes {} range flushes {}",
            self.tlb.fills, self.tlb.victim_hits, self.tlb.flushes, self.tlb.range_flushes
        )
    }
}
