//! Error taxonomy and the shared abort latch.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use thiserror::Error;

/// Which subsystem raised a [`CoreError`], recorded by the abort latch so a caller inspecting a
/// stopped [`Core`](crate::Core) can tell which component is "guilty".
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Subsystem {
    Core,
    Bus,
    Decode,
    Jit,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Subsystem::Core => "core",
            Subsystem::Bus => "bus",
            Subsystem::Decode => "decode",
            Subsystem::Jit => "jit",
        })
    }
}

/// Errors that can abort execution of a [`Core`](crate::Core).
///
/// Every variant corresponds to one entry of the error taxonomy: an unrecognised instruction
/// encoding, a reference to an extension that isn't enabled, an out-of-range CSR access, a bus
/// access outside of any mapped resource, or a JIT compilation/execution failure.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("could not decode instruction {word:#010x} at pc {pc:#010x}")]
    Decode { pc: u64, word: u32 },

    #[error("instruction at pc {pc:#010x} requires extension {extension:?}, which is not enabled")]
    ExtensionNotEnabled {
        pc: u64,
        extension: crate::config::Extension,
    },

    #[error("bus access out of range: {kind} at address {address:#010x}")]
    Bus {
        kind: &'static str,
        address: u32,
    },

    #[error("CSR address {0:#05x} is out of range (must be < 4096)")]
    CsrOutOfRange(u16),

    #[error("JIT error: {0}")]
    Jit(#[from] JitError),

    #[error("instruction at pc {pc:#010x} decoded successfully but cannot be executed without trap/privileged support: {mnemonic}")]
    Unimplemented { pc: u64, mnemonic: &'static str },

    #[error("could not open image file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("not a valid ELF image: {0}")]
    Elf(String),

    #[error("core is aborted ({subsystem}: {message}); call Core::reset to resume")]
    Aborted { subsystem: Subsystem, message: String },
}

impl From<crate::bus::BusError> for CoreError {
    fn from(error: crate::bus::BusError) -> Self {
        match error {
            crate::bus::BusError::UnmappedRead(address) => CoreError::Bus { kind: "read", address },
            crate::bus::BusError::UnmappedWrite(address) => CoreError::Bus { kind: "write", address },
        }
    }
}

/// Errors specific to the JIT back-end.
#[derive(Error, Debug)]
pub enum JitError {
    #[error("failed to initialize LLVM execution engine")]
    EngineInit,
    #[error("failed to compile basic block starting at pc {0:#010x}")]
    Compile(u64),
    #[error("failed to resolve compiled entry point for block at pc {0:#010x}")]
    Resolve(u64),
}

/// Shared latch set by any subsystem that wants to halt execution permanently.
///
/// Once set, `aborted()` reports `true` and the recorded [`Subsystem`] and [`CoreError`] stay
/// readable until [`AbortState::reset`] is called. There is no way to resume from an abort other
/// than a full `Core::reset`.
#[derive(Debug, Default)]
pub struct AbortState {
    aborted: AtomicBool,
    detail: Mutex<Option<(Subsystem, String)>>,
}

impl AbortState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the latch has been tripped.
    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Trips the latch, recording `subsystem` as the guilty party and `error`'s message.
    ///
    /// Idempotent: if the latch is already tripped, the previously recorded subsystem/error are
    /// left untouched (the first fault wins).
    pub fn abort(&self, subsystem: Subsystem, error: &CoreError) {
        if self
            .aborted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.detail.lock().unwrap() = Some((subsystem, error.to_string()));
        }
    }

    /// Returns the recorded guilty subsystem and error message, if the latch is tripped.
    pub fn detail(&self) -> Option<(Subsystem, String)> {
        self.detail.lock().unwrap().clone()
    }

    /// Clears the latch. Only meaningful as part of a full `Core::reset`.
    pub fn reset(&self) {
        self.aborted.store(false, Ordering::SeqCst);
        *self.detail.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_latches_first_fault() {
        let state = AbortState::new();
        assert!(!state.aborted());
        state.abort(Subsystem::Bus, &CoreError::CsrOutOfRange(5000));
        assert!(state.aborted());
        let (subsystem, _) = state.detail().unwrap();
        assert_eq!(Subsystem::Bus, subsystem);

        // Second abort from a different subsystem does not overwrite the first.
        state.abort(Subsystem::Jit, &CoreError::Jit(JitError::EngineInit));
        let (subsystem, _) = state.detail().unwrap();
        assert_eq!(Subsystem::Bus, subsystem);

        state.reset();
        assert!(!state.aborted());
        assert!(state.detail().is_none());
    }
}
