//! Integration tests, one module tree per layer.

#[cfg(test)]
mod core;
#[cfg(test)]
mod frontend;
#[cfg(test)]
mod mmu;

pub mod rv;
