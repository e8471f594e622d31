//! The Core facade: owns a single hart plus its selected back-end, and exposes the lifecycle
//! (step/run/stop/reset) and inspection hooks (`pc`, `register`, `csr`, `read32`/`write32`) an
//! external driver (a CLI or a debugger UI) uses, without exposing either back-end's internals.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;
use log::{debug, info, warn};

use crate::backend::{Backend, HartState};
use crate::backend::interpreter::Interpreter;
use crate::backend::jit::Jit;
use crate::bus::UartSink;
use crate::config::{BackendKind, Config};
use crate::error::{AbortState, CoreError, Subsystem};
use crate::instruction::decode;
use crate::registers::Specifier;
use crate::stepping::{Flags, SteppingThread};

/// State mutated on every step: the hart plus the back-end driving it. Bundled into one struct
/// so `Core` can guard both behind a single lock, since the stepping-thread worker and the owning
/// thread never need independent access to one without the other.
struct Inner {
    state: HartState,
    backend: Box<dyn Backend>,
}

impl Inner {
    /// Executes one instruction. On failure, trips `abort` with the guilty subsystem and
    /// propagates the error; the caller is responsible for not calling `step` again afterwards
    /// without a full `Core::reset`.
    fn step(&mut self, abort: &AbortState) -> Result<(), CoreError> {
        self.run_with(abort, Backend::step)
    }

    /// Like `step`, but drives the back-end's batched [`Backend::run_step`] instead — used only
    /// by the continuous run-loop worker, which has no need for per-instruction granularity.
    fn run_step(&mut self, abort: &AbortState) -> Result<(), CoreError> {
        self.run_with(abort, Backend::run_step)
    }

    fn run_with(
        &mut self,
        abort: &AbortState,
        f: fn(&mut dyn Backend, &mut HartState) -> Result<(), CoreError>,
    ) -> Result<(), CoreError> {
        match f(self.backend.as_mut(), &mut self.state) {
            Ok(()) => {
                self.state.registers.set_x(Specifier::X0, 0);
                Ok(())
            }
            Err(error) => {
                let subsystem = match &error {
                    CoreError::Bus { .. } | CoreError::Io { .. } | CoreError::Elf(_) => Subsystem::Bus,
                    CoreError::Decode { .. } | CoreError::ExtensionNotEnabled { .. } => Subsystem::Decode,
                    CoreError::Jit(_) => Subsystem::Jit,
                    CoreError::CsrOutOfRange(_) | CoreError::Unimplemented { .. } => Subsystem::Core,
                    CoreError::Aborted { subsystem, .. } => *subsystem,
                };
                abort.abort(subsystem, &error);
                Err(error)
            }
        }
    }
}

/// The facade a host driver constructs, configures, and runs.
///
/// Owns exactly one [`HartState`] and one boxed [`Backend`] (interpreter or JIT, fixed at
/// construction), plus the shared abort latch and (once [`Core::run`] has been called) a
/// background [`SteppingThread`].
pub struct Core {
    inner: Arc<Mutex<Inner>>,
    abort: Arc<AbortState>,
    worker: Option<SteppingThread>,
    worker_flags: Option<Arc<Flags>>,
    config: Config,
}

impl Core {
    /// Builds a `Core` bound to a fresh hart and the back-end `config.backend` selects. Mirrors
    /// the external "assign a hart and a back-end kind" contract: construction *is* the
    /// assignment, since this emulator never rebinds a `Core` to a different hart or back-end
    /// after the fact.
    pub fn new(config: Config) -> Self {
        let state = HartState::new(&config);
        let backend: Box<dyn Backend> = match config.backend {
            BackendKind::Interpreter => Box::new(Interpreter::new()),
            BackendKind::Jit => Box::new(Jit::new()),
        };
        Self {
            inner: Arc::new(Mutex::new(Inner { state, backend })),
            abort: Arc::new(AbortState::new()),
            worker: None,
            worker_flags: None,
            config,
        }
    }

    /// Installs the sink UART transmit lines are flushed to.
    ///
    /// Must only be called while the stepping thread is stopped, per the shared-resource policy:
    /// the `Bus` (and by extension its UART device) is mutated only by the worker while running.
    pub fn set_uart_sink(&mut self, sink: UartSink) {
        self.inner.lock().unwrap().state.bus.set_uart_sink(sink);
    }

    /// Executes exactly one instruction. Returns the error (and trips the abort latch) if the
    /// instruction could not be decoded or executed.
    pub fn step(&self) -> Result<(), CoreError> {
        if let Some((subsystem, message)) = self.abort.detail() {
            return Err(CoreError::Aborted { subsystem, message });
        }
        self.inner.lock().unwrap().step(&self.abort)
    }

    /// Spawns the background stepping thread, which drives the back-end's batched
    /// [`Backend::run_step`] in a loop until [`Core::stop`] is called or a step fails. A no-op if
    /// already running. Unlike [`Core::step`], a single loop iteration may retire more than one
    /// guest instruction when the back-end can profitably batch them (the JIT does, over a cached
    /// block); this loop has no use for per-instruction granularity.
    pub fn run(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let abort = self.abort.clone();
        let thread = SteppingThread::spawn(move || {
            if abort.aborted() {
                return false;
            }
            inner.lock().unwrap().run_step(&abort).is_ok()
        });
        self.worker_flags = Some(thread.flags());
        self.worker = Some(thread);
    }

    /// Stops the background stepping thread (if running) and joins it. Idempotent.
    ///
    /// Must not be called from inside a step handler — doing so would deadlock attempting to
    /// join the worker thread from the worker thread itself.
    pub fn stop(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
        self.worker_flags = None;
    }

    /// Returns `true` if the background stepping thread is currently running.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(SteppingThread::is_running)
    }

    /// Polls whether at least one step has completed since the last call, clearing the flag.
    /// Returns `false` if [`Core::run`] was never called or the worker has since stopped.
    pub fn check_and_clear_update_flag(&self) -> bool {
        self.worker_flags
            .as_ref()
            .is_some_and(|flags| flags.check_and_clear_update_flag())
    }

    /// Resets the general-purpose registers to zero and the program counter to
    /// `config.reset_vector`. Does **not** clear CSRs (a documented gap, not a bug) and does
    /// **not** touch DRAM contents or the JIT block cache's compiled code, so a program loaded
    /// before `reset` is still present afterwards.
    pub fn reset(&mut self) {
        let mut inner = self.inner.lock().unwrap();
        let num_gprs = inner.state.registers.len();
        inner.state.registers = crate::registers::Registers::new(
            self.config.xlen,
            num_gprs,
            self.config.reset_vector,
        );
        self.abort.reset();
    }

    /// Clears the abort latch without otherwise touching hart state. A host driver normally
    /// pairs this with [`Core::reset`] (which also clears it); exposed separately for a debugger
    /// UI that wants to dismiss an error dialog before deciding whether to reset.
    pub fn reset_aborted(&self) {
        self.abort.reset();
    }

    /// Returns `true` if the abort latch has been tripped.
    pub fn aborted(&self) -> bool {
        self.abort.aborted()
    }

    /// Returns the guilty subsystem and error message recorded by the abort latch, if tripped.
    pub fn abort_detail(&self) -> Option<(Subsystem, String)> {
        self.abort.detail()
    }

    /// Sets the program counter directly. Used by a debugger UI to redirect execution.
    pub fn set_pc(&self, value: u64) {
        self.inner.lock().unwrap().state.registers.set_pc(value);
    }

    /// Returns the current program counter.
    pub fn pc(&self) -> u64 {
        self.inner.lock().unwrap().state.registers.pc()
    }

    /// Returns the value of general-purpose register `index` (`0..32`, or `0..16` for an
    /// embedded hart; out-of-range indices for this hart's register file read as zero).
    pub fn get_register(&self, index: u8) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .state
            .registers
            .x(Specifier::from_u5(index))
    }

    /// Sets the value of general-purpose register `index`. Writes to `x0` are ignored.
    pub fn set_register(&self, index: u8, value: u64) {
        self.inner
            .lock()
            .unwrap()
            .state
            .registers
            .set_x(Specifier::from_u5(index), value);
    }

    /// Reads CSR `addr`. Fails with [`CoreError::CsrOutOfRange`] if `addr >= 4096`.
    pub fn get_csr(&self, addr: u16) -> Result<u64, CoreError> {
        self.inner.lock().unwrap().state.csrs.read(addr)
    }

    /// Writes CSR `addr`. Fails with [`CoreError::CsrOutOfRange`] if `addr >= 4096`.
    pub fn set_csr(&self, addr: u16, value: u64) -> Result<(), CoreError> {
        self.inner.lock().unwrap().state.csrs.write(addr, value)
    }

    /// Reads a single byte at `addr` through the bus. Exposed so a host driver can poke the UART
    /// THR (or any other byte-granular device) directly.
    pub fn read8(&self, addr: u32) -> Result<u8, CoreError> {
        Ok(self.inner.lock().unwrap().state.bus.read8(addr)?)
    }

    /// Writes a single byte at `addr` through the bus.
    pub fn write8(&self, addr: u32, value: u8) -> Result<(), CoreError> {
        Ok(self.inner.lock().unwrap().state.bus.write8(addr, value)?)
    }

    /// Reads a 32-bit word at `addr` through the bus. Exposed for a debugger/disassembler to
    /// inspect memory without going through the instruction-fetch path.
    pub fn read32(&self, addr: u32) -> Result<u32, CoreError> {
        Ok(self.inner.lock().unwrap().state.bus.read32(addr)?)
    }

    /// Writes a 32-bit word at `addr` through the bus.
    pub fn write32(&self, addr: u32, value: u32) -> Result<(), CoreError> {
        Ok(self.inner.lock().unwrap().state.bus.write32(addr, value)?)
    }

    /// Fetches and decodes the instruction at `pc`, returning its disassembly. Used by a
    /// debugger UI's disassembly window; reuses the same decode path the interpreter and JIT do.
    pub fn disassemble_at(&self, pc: u32) -> Result<String, CoreError> {
        let inner = self.inner.lock().unwrap();
        let word = inner.state.bus.read32(pc)?;
        let (instruction, _) = decode(word).map_err(|e| CoreError::Decode { pc: pc as u64, word: e.word })?;
        Ok(crate::disassemble::disassemble(pc as u64, &instruction))
    }

    /// The configuration this `Core` was constructed with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of blocks resident in the JIT's block cache, or `None` if this `Core` was built
    /// with the interpreter back-end.
    pub fn jit_cached_block_count(&self) -> Option<usize> {
        self.inner.lock().unwrap().backend.cached_block_count()
    }

    /// Returns `true` if the JIT has a compiled block cached for `start_pc`. Always `false` for
    /// the interpreter back-end.
    pub fn jit_has_cached_block(&self, start_pc: u64) -> bool {
        self.inner.lock().unwrap().backend.has_cached_block(start_pc)
    }

    /// Loads a raw binary image into DRAM at offset `0` (guest physical
    /// [`crate::bus::DRAM_BASE`]). Does not touch `pc`; call [`Core::reset`] first if a fresh
    /// start is wanted. Must only be called while the stepping thread is stopped.
    pub fn load_binary(&self, path: impl AsRef<Path>) -> Result<(), CoreError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| CoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.inner.lock().unwrap().state.bus.load_binary(&bytes);
        info!("loaded raw binary image: {} bytes from {}", bytes.len(), path.display());
        Ok(())
    }

    /// Parses an ELF image, copies every `PT_LOAD` segment word-by-word into DRAM at `p_vaddr`,
    /// zero-fills the `p_memsz - p_filesz` BSS tail, and sets `pc` to the entry point. Fails on
    /// open failure or a header goblin cannot parse as ELF.
    pub fn load_elf(&self, path: impl AsRef<Path>) -> Result<(), CoreError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| CoreError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let elf = Elf::parse(&bytes).map_err(|e| CoreError::Elf(e.to_string()))?;

        let mut inner = self.inner.lock().unwrap();
        for header in elf.program_headers.iter().filter(|h| h.p_type == PT_LOAD) {
            debug!(
                "loading PT_LOAD segment: file range [{:#x}..{:#x}] to vaddr [{:#x}..{:#x}]",
                header.p_offset,
                header.p_offset + header.p_filesz,
                header.p_vaddr,
                header.p_vaddr + header.p_memsz,
            );
            let segment = &bytes[header.file_range()];
            let base = header.p_vaddr as u32;

            let whole_words = segment.len() / 4;
            for i in 0..whole_words {
                let word = u32::from_le_bytes(segment[i * 4..i * 4 + 4].try_into().unwrap());
                inner.state.bus.write32(base.wrapping_add((i * 4) as u32), word)?;
            }
            for (i, &byte) in segment[whole_words * 4..].iter().enumerate() {
                inner
                    .state
                    .bus
                    .write8(base.wrapping_add((whole_words * 4 + i) as u32), byte)?;
            }

            let bss_start = base.wrapping_add(header.p_filesz as u32);
            let bss_len = header.p_memsz.saturating_sub(header.p_filesz) as u32;
            for offset in 0..bss_len {
                inner.state.bus.write8(bss_start.wrapping_add(offset), 0)?;
            }
        }

        inner.state.registers.set_pc(elf.entry);
        info!("loaded ELF image, entry point {:#010x}", elf.entry);
        Ok(())
    }
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("pc", &self.pc())
            .field("aborted", &self.aborted())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("dropping a Core whose stepping thread was still running; stopping it first");
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Extension, Extensions};

    fn write_program(core: &Core, words: &[u32]) {
        for (i, &word) in words.iter().enumerate() {
            core.write32(core.config().reset_vector + (i as u32 * 4), word).unwrap();
        }
    }

    fn addi(rd: u8, rs1: u8, imm: i32) -> u32 {
        ((imm as u32 & 0xFFF) << 20) | ((rs1 as u32) << 15) | (0b000 << 12) | ((rd as u32) << 7) | 0b0010011
    }

    fn add(rd: u8, rs1: u8, rs2: u8) -> u32 {
        ((rs2 as u32) << 20) | ((rs1 as u32) << 15) | (0b000 << 12) | ((rd as u32) << 7) | 0b0110011
    }

    fn jal(rd: u8, imm: i32) -> u32 {
        let imm = imm as u32;
        (((imm >> 20) & 1) << 31)
            | (((imm >> 12) & 0xFF) << 12)
            | (((imm >> 11) & 1) << 20)
            | (((imm >> 1) & 0x3FF) << 21)
            | ((rd as u32) << 7)
            | 0b1101111
    }

    #[test]
    fn test_scenario_add_two_immediates() {
        let core = Core::new(Config::default());
        write_program(&core, &[addi(1, 0, 5), addi(2, 0, 7), add(3, 1, 2), jal(0, 0)]);
        for _ in 0..3 {
            core.step().unwrap();
        }
        assert_eq!(5, core.get_register(1));
        assert_eq!(7, core.get_register(2));
        assert_eq!(12, core.get_register(3));
        assert_eq!(0x8000_000C, core.pc());
    }

    #[test]
    fn test_reset_preserves_memory_and_csrs() {
        let mut core = Core::new(Config::default());
        write_program(&core, &[addi(1, 0, 5)]);
        core.step().unwrap();
        core.set_csr(crate::csr::address::MSCRATCH, 0xABCD).unwrap();
        core.reset();
        assert_eq!(0, core.get_register(1));
        assert_eq!(core.config().reset_vector as u64, core.pc());
        assert_eq!(0xABCD, core.get_csr(crate::csr::address::MSCRATCH).unwrap());
        // Memory (the program we wrote) is untouched by reset.
        assert_eq!(addi(1, 0, 5), core.read32(core.config().reset_vector).unwrap());
    }

    #[test]
    fn test_run_and_stop() {
        let mut core = Core::new(Config {
            extensions: Extensions::from_iter([Extension::M, Extension::A, Extension::Zicsr, Extension::Zifencei]),
            ..Config::default()
        });
        // jal x0, 0: an infinite self-loop, so the worker keeps stepping until stopped.
        write_program(&core, &[jal(0, 0)]);
        core.run();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(core.is_running());
        assert!(core.check_and_clear_update_flag());
        core.stop();
        assert!(!core.is_running());
    }

    #[test]
    fn test_abort_on_decode_error_stops_worker() {
        let mut core = Core::new(Config::default());
        // No instruction written: fetching all-zero bytes at the reset vector is not a valid
        // opcode (opcode field 0 doesn't match any decoded class), so the very first step aborts.
        core.run();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(core.aborted());
        assert!(!core.is_running());
        core.stop();
    }

    #[test]
    fn test_load_binary_then_step() {
        let core = Core::new(Config::default());
        let image = addi(1, 0, 42).to_le_bytes();
        let dir = std::env::temp_dir();
        let path = dir.join(format!("riscv_emu_test_{}.bin", std::process::id()));
        std::fs::write(&path, image).unwrap();
        core.load_binary(&path).unwrap();
        std::fs::remove_file(&path).ok();
        core.step().unwrap();
        assert_eq!(42, core.get_register(1));
    }
}
