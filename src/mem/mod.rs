pub mod backend;
pub mod controller;
pub mod ddr;
pub mod device;
pub mod request;

#[cfg(test)]
mod unit_tests;

pub use backend::{MemBackend, MemoryTiers, Md1Memory, SimpleMemory};
pub use controller::MemoryController;
pub use ddr::DdrMemory;
pub use request::{AccessKind, CoherenceOp, MemRequest, MesiState, RecordKind};

/// Process-wide simulator parameters, passed explicitly instead of living
/// in a global.
#[derive(Debug, Clone, Copy)]
pub struct SimContext {
    /// Cache line size in bytes.
    pub line_size: u32,
    pub sys_freq_mhz: u32,
    /// Accesses before warmup completes are timed at the bound-phase
    /// minimum only.
    pub warmup_done: bool,
}

impl Default for SimContext {
    fn default() -> Self {
        Self {
            line_size: 64,
            sys_freq_mhz: 4000,
            warmup_done: true,
        }
    }
}
