//! Execution back-ends: interchangeable implementations of "execute the instruction at `pc`".

pub mod interpreter;
pub mod jit;

use crate::bus::Bus;
use crate::config::{Config, Extensions, Xlen};
use crate::csr::CsrFile;
use crate::error::CoreError;
use crate::registers::Registers;

/// All mutable state a single hart's execution depends on, independent of which back-end drives
/// it. Both the interpreter and the JIT operate purely in terms of this struct plus the
/// instruction stream obtained from `bus`.
#[derive(Debug)]
pub struct HartState {
    pub registers: Registers,
    pub csrs: CsrFile,
    pub bus: Bus,
    pub xlen: Xlen,
    pub extensions: Extensions,
}

impl HartState {
    pub fn new(config: &Config) -> Self {
        Self {
            registers: Registers::new(config.xlen, config.num_gprs(), config.reset_vector),
            csrs: CsrFile::new(),
            bus: Bus::new(),
            xlen: config.xlen,
            extensions: config.extensions,
        }
    }
}

/// An execution back-end: something that can advance a [`HartState`] by one instruction.
///
/// Implementors must ensure `step` always either executes exactly one guest instruction and
/// advances `state.registers`'s `pc` past it, or returns `Err` without having advanced `pc` (so a
/// caller can safely retry after, e.g., routing the error through the abort latch).
///
/// `Send` is required because a [`Core`](crate::Core) may hand its backend to a
/// [`SteppingThread`](crate::stepping::SteppingThread) worker; access is always serialized
/// through the `Core`'s internal lock, so no back-end needs to be `Sync`.
pub trait Backend: std::fmt::Debug + Send {
    /// Executes a single instruction at the current `pc`. Must retire exactly one guest
    /// instruction, whatever internal caching or batching the back-end otherwise does.
    fn step(&mut self, state: &mut HartState) -> Result<(), CoreError>;

    /// Executes at least one guest instruction, advancing `pc` as far as this back-end can
    /// profitably batch in a single call (e.g. a whole cached basic block for the JIT). Used only
    /// by the continuous run-loop driver (`Core::run`'s worker thread), which has no use for
    /// per-instruction granularity and benefits from the batching. Defaults to [`Backend::step`]
    /// for back-ends (like the interpreter) that have no wider unit of work to offer.
    fn run_step(&mut self, state: &mut HartState) -> Result<(), CoreError> {
        self.step(state)
    }

    /// Number of entries currently resident in this back-end's block cache, or `None` for a
    /// back-end with no such cache (the interpreter). Exposed for inspection/testing of the
    /// JIT's cache-eviction behaviour without downcasting the trait object.
    fn cached_block_count(&self) -> Option<usize> {
        None
    }

    /// Returns `true` if a compiled block for `start_pc` is currently cached. Always `false` for
    /// a back-end with no block cache.
    fn has_cached_block(&self, start_pc: u64) -> bool {
        let _ = start_pc;
        false
    }
}
