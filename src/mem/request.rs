use crate::Cycle;

/// Coherence operation issued by the LLC model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoherenceOp {
    GetShared,
    GetExclusive,
    PutShared,
    PutExclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MesiState {
    Modified,
    Exclusive,
    Shared,
    #[default]
    Invalid,
}

/// Loads are the GET ops, stores everything else (dirty and clean
/// writebacks both count as stores for hit/miss accounting).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Load,
    Store,
}

/// How a back-end access relates to the event record under construction:
/// a fresh record, an append on the critical path, or a side chain that
/// consumes bandwidth without delaying the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    NewRecord,
    CriticalPath,
    SideChain,
}

pub mod flags {
    /// GetShared may not be upgraded to Exclusive.
    pub const NO_EXCL: u32 = 1 << 0;
}

#[derive(Debug, Clone)]
pub struct MemRequest {
    pub line_addr: u64,
    pub op: CoherenceOp,
    pub cycle: Cycle,
    pub src_id: u32,
    pub flags: u32,
    pub initial_state: MesiState,
    /// Post-access coherence state, written by the MESI table.
    pub state: MesiState,
}

impl MemRequest {
    pub fn new(line_addr: u64, op: CoherenceOp, cycle: Cycle) -> Self {
        Self {
            line_addr,
            op,
            cycle,
            src_id: 0,
            flags: 0,
            initial_state: MesiState::Invalid,
            state: MesiState::Invalid,
        }
    }

    pub fn is(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn kind(&self) -> AccessKind {
        match self.op {
            CoherenceOp::GetShared | CoherenceOp::GetExclusive => AccessKind::Load,
            CoherenceOp::PutShared | CoherenceOp::PutExclusive => AccessKind::Store,
        }
    }

    /// Fixed MESI table: writebacks invalidate, GetShared yields S or E per
    /// the NO_EXCL flag, GetExclusive yields M.
    pub fn apply_mesi(&mut self) {
        self.state = match self.op {
            CoherenceOp::PutShared | CoherenceOp::PutExclusive => MesiState::Invalid,
            CoherenceOp::GetShared => {
                if self.is(flags::NO_EXCL) {
                    MesiState::Shared
                } else {
                    MesiState::Exclusive
                }
            }
            CoherenceOp::GetExclusive => MesiState::Modified,
        };
    }

    /// Internal request a scheme issues on behalf of this one (tag probes,
    /// fills, writebacks); inherits timing and identity.
    pub fn derived(&self, line_addr: u64, op: CoherenceOp) -> MemRequest {
        MemRequest {
            line_addr,
            op,
            cycle: self.cycle,
            src_id: self.src_id,
            flags: self.flags,
            initial_state: self.initial_state,
            state: MesiState::Invalid,
        }
    }
}
