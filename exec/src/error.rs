use smtcg_mmu::MapError;
use thiserror::Error;

pub use smtcg_frontend::GuestFault;

/// Failures constructing an engine. Guest-visible faults never show up
/// here; they go through [`GuestFault`].
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("cannot allocate the code arena: {0}")]
    Arena(#[source] std::io::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Map(#[from] MapError),
}
