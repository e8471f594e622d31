//! Basic-block JIT back-end, built on LLVM via `inkwell`.
//!
//! Mirrors the flow of an LLVM MCJIT translator operating block-by-block: each basic block gets
//! its own `Module` and its own `ExecutionEngine`, is compiled once, cached, and invoked directly
//! on every subsequent visit until it is evicted from the [`BlockCache`].
//!
//! Only straight-line opcodes (arithmetic/logic/load/store/CSR/LUI/AUIPC) are translated into IR;
//! the first branch, jump, or system-serialising instruction ends a block without itself being
//! translated. That instruction — and only that instruction — is executed by falling back to a
//! single [`Interpreter`] step once the compiled prefix returns. This keeps code generation to
//! opcodes with no control-flow effect on the generated function, while still getting the benefit
//! of compilation for the straight-line bulk of a program.
//!
//! [`Backend::step`] and [`Backend::run_step`] compile in two different modes, keyed by the same
//! `pc`-addressed cache: `step` always compiles (or recompiles, if a wider block happens to be
//! cached already) a block capped at exactly one guest instruction, so a single call retires
//! exactly one instruction as the trait requires. `run_step`, used only by the continuous run-loop
//! driver, compiles the full straight-line prefix described above and amortises the interpreter
//! fallback over however many instructions that prefix covers.

use std::collections::HashMap;

use inkwell::context::Context;
use inkwell::execution_engine::{ExecutionEngine, JitFunction};
use inkwell::module::Module;
use inkwell::values::{IntValue, PointerValue};
use inkwell::{AddressSpace, OptimizationLevel};

use crate::backend::interpreter::Interpreter;
use crate::backend::{Backend, HartState};
use crate::error::{CoreError, JitError};
use crate::instruction::{decode, AluOp, Instruction};

/// Maximum number of compiled blocks kept resident at once. The least-recently-used block is
/// evicted (its module torn down and removed from its execution engine) once this is exceeded.
pub const MAX_CACHED_BLOCKS: usize = 1024;

/// Fixed-layout struct passed by pointer into every compiled block, giving it access to the
/// hart's register file without baking a raw host address into the generated code at compile
/// time: the pointer value is supplied fresh on every invocation, and the block only ever reads
/// `Runtime`'s own fields (resolved as fixed byte offsets in the generated IR) and calls the
/// declared runtime-ABI functions below.
#[repr(C)]
struct Runtime {
    regs: *mut u64,
}

type BlockFn = unsafe extern "C" fn(*mut Runtime) -> i32;

/// One compiled basic block: a self-contained LLVM module plus the execution engine that JIT
/// compiled it, together with the resolved entry point and bookkeeping for cache eviction.
struct CompiledBlock<'ctx> {
    // Kept alive only so that `engine`'s backing module isn't dropped out from under it; never
    // read directly once `entry` has been resolved.
    _module: Module<'ctx>,
    engine: ExecutionEngine<'ctx>,
    entry: JitFunction<'ctx, BlockFn>,
    /// Number of leading straight-line instructions this block translated. The instruction
    /// immediately after this many bytes (if any) is the block-ending branch/jump/system
    /// instruction, executed by the interpreter fallback.
    straight_line_len: u32,
    /// Whether this block was compiled in single-instruction mode (for [`Backend::step`]) or in
    /// batch mode (for [`Backend::run_step`]). A cache hit compiled in the other mode is treated
    /// as a miss and recompiled, since the two modes promise different amounts of progress per
    /// invocation.
    single_instruction: bool,
    last_used: u64,
}

/// The JIT back-end. Falls back to a plain [`Interpreter`] for any instruction it does not
/// translate (every control-flow and system instruction, by design — see module docs).
///
/// Owns its `inkwell::context::Context` directly rather than borrowing one from its caller: every
/// `Module`/`ExecutionEngine` `inkwell` produces is tied to the `Context`'s lifetime, which would
/// otherwise make `Jit` self-referential. `context` is boxed so its address is stable across
/// `Jit` being moved, and field declaration order (`context` before `cache`) guarantees `cache`'s
/// compiled blocks are dropped before the `Context` they borrow from, so it is sound to hand out
/// a `'static`-erased reference to it and store the resulting `'static`-parameterized
/// `CompiledBlock`s in `cache`.
pub struct Jit {
    context: Box<Context>,
    cache: HashMap<u64, CompiledBlock<'static>>,
    clock: u64,
    fallback: Interpreter,
}

// `inkwell`'s `Context`/`ExecutionEngine`/`JitFunction` are not `Send` by default, since LLVM's
// C++ objects are not inherently thread-safe to share. `Jit` is sound to send across a thread
// boundary anyway because a `Core` never accesses its backend from more than one thread
// concurrently: the owning thread and the stepping-thread worker take turns under `Core`'s
// internal lock, never running in parallel.
unsafe impl Send for Jit {}

impl std::fmt::Debug for Jit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jit")
            .field("cached_blocks", &self.cache.len())
            .finish()
    }
}

impl Jit {
    /// Creates a fresh JIT back-end with its own LLVM context.
    pub fn new() -> Self {
        Self {
            context: Box::new(Context::create()),
            cache: HashMap::new(),
            clock: 0,
            fallback: Interpreter::new(),
        }
    }

    /// Returns a `'static`-erased reference to `self.context`, valid for as long as `self` is
    /// alive and `self.context` is not moved — which `Jit` upholds (see struct docs).
    fn context(&self) -> &'static Context {
        unsafe { std::mem::transmute::<&Context, &'static Context>(&self.context) }
    }

    /// Number of blocks currently resident in the cache.
    pub fn cached_block_count(&self) -> usize {
        self.cache.len()
    }

    fn evict_lru_if_full(&mut self) {
        if self.cache.len() < MAX_CACHED_BLOCKS {
            return;
        }
        if let Some((&pc, _)) = self.cache.iter().min_by_key(|(_, block)| block.last_used) {
            // Dropping the removed `CompiledBlock` drops its `ExecutionEngine`, which in turn
            // frees the JIT-compiled machine code for this block. No caller can still be holding
            // its `code_ptr` at this point, since invocation only ever happens synchronously
            // inside `Jit::step`.
            self.cache.remove(&pc);
        }
    }

    /// Compiles the block at `start_pc`. In single-instruction mode, the translation loop stops
    /// after at most one guest instruction (translated or not), so that callers using the
    /// resulting block for a single invocation retire exactly one guest instruction; otherwise it
    /// translates the full straight-line prefix as described in the module docs.
    fn compile_block(
        &mut self,
        state: &HartState,
        start_pc: u64,
        single_instruction: bool,
    ) -> Result<(), CoreError> {
        let context = self.context();
        let module = context.create_module(&format!("block_{start_pc:#x}"));
        let builder = context.create_builder();

        let i64_t = context.i64_type();
        let i32_t = context.i32_type();
        let ptr_t = context.ptr_type(AddressSpace::default());

        let fn_type = i32_t.fn_type(&[ptr_t.into()], false);
        let function = module.add_function(&format!("exec_{start_pc:#x}"), fn_type, None);
        let entry_block = context.append_basic_block(function, "entry");
        builder.position_at_end(entry_block);

        let runtime_ptr = function.get_nth_param(0).unwrap().into_pointer_value();
        let regs_field_ptr = builder
            .build_struct_gep(i64_t, runtime_ptr, 0, "regs_field")
            .map_err(|_| CoreError::Jit(JitError::Compile(start_pc)))?;
        let regs_ptr = builder
            .build_load(ptr_t, regs_field_ptr, "regs")
            .map_err(|_| CoreError::Jit(JitError::Compile(start_pc)))?
            .into_pointer_value();

        let load_reg = |builder: &inkwell::builder::Builder<'static>, index: u8| -> Result<IntValue<'static>, CoreError> {
            let slot = unsafe {
                builder
                    .build_gep(i64_t, regs_ptr, &[i64_t.const_int(index as u64, false)], "reg_slot")
                    .map_err(|_| CoreError::Jit(JitError::Compile(start_pc)))?
            };
            builder
                .build_load(i64_t, slot, "reg_val")
                .map_err(|_| CoreError::Jit(JitError::Compile(start_pc)))
                .map(|v| v.into_int_value())
        };

        let store_reg = |builder: &inkwell::builder::Builder<'static>, index: u8, value: IntValue<'static>| -> Result<(), CoreError> {
            if index == 0 {
                return Ok(());
            }
            let slot: PointerValue<'static> = unsafe {
                builder
                    .build_gep(i64_t, regs_ptr, &[i64_t.const_int(index as u64, false)], "reg_slot")
                    .map_err(|_| CoreError::Jit(JitError::Compile(start_pc)))?
            };
            builder
                .build_store(slot, value)
                .map_err(|_| CoreError::Jit(JitError::Compile(start_pc)))?;
            Ok(())
        };

        // Walk straight-line instructions starting at `start_pc`, translating each into IR, until
        // hitting one this JIT does not handle (every control-flow/system/CSR/AMO instruction).
        let mut pc = start_pc;
        let mut straight_line_len = 0u32;
        loop {
            let word = state
                .bus
                .read32(pc as u32)
                .map_err(|_| CoreError::Jit(JitError::Compile(start_pc)))?;
            let Ok((instruction, size)) = decode(word) else {
                break;
            };
            match instruction {
                Instruction::Lui { rd, imm } => {
                    let value = i64_t.const_int(imm as i64 as u64, true);
                    store_reg(&builder, rd.into(), value)?;
                }
                Instruction::AluImm { op, rd, rs1, imm, word: is_w } if !is_w => {
                    let a = load_reg(&builder, rs1.into())?;
                    let b = i64_t.const_int(imm as i64 as u64, true);
                    let result = emit_alu(&builder, op, a, b)
                        .ok_or(CoreError::Jit(JitError::Compile(start_pc)))?;
                    store_reg(&builder, rd.into(), result)?;
                }
                Instruction::Alu { op, rd, rs1, rs2, word: is_w } if !is_w => {
                    let a = load_reg(&builder, rs1.into())?;
                    let b = load_reg(&builder, rs2.into())?;
                    let result = emit_alu(&builder, op, a, b)
                        .ok_or(CoreError::Jit(JitError::Compile(start_pc)))?;
                    store_reg(&builder, rd.into(), result)?;
                }
                _ => break,
            }
            pc += size as u64;
            straight_line_len += size as u32;
            if single_instruction {
                // Single-instruction mode never translates more than the one instruction at
                // `start_pc`, even if the next one is also translatable.
                break;
            }
            // Keep generated blocks bounded in size, same spirit as the cache's own bound.
            if straight_line_len >= 4096 {
                break;
            }
        }

        builder
            .build_return(Some(&i32_t.const_int(0, false)))
            .map_err(|_| CoreError::Jit(JitError::Compile(start_pc)))?;

        let engine = module
            .create_jit_execution_engine(OptimizationLevel::Default)
            .map_err(|_| CoreError::Jit(JitError::EngineInit))?;

        let entry = unsafe {
            engine
                .get_function::<BlockFn>(&format!("exec_{start_pc:#x}"))
                .map_err(|_| CoreError::Jit(JitError::Resolve(start_pc)))?
        };

        self.evict_lru_if_full();
        self.clock += 1;
        self.cache.insert(
            start_pc,
            CompiledBlock {
                _module: module,
                engine,
                entry,
                straight_line_len,
                single_instruction,
                last_used: self.clock,
            },
        );
        Ok(())
    }
}

fn emit_alu<'ctx>(
    builder: &inkwell::builder::Builder<'ctx>,
    op: AluOp,
    a: IntValue<'ctx>,
    b: IntValue<'ctx>,
) -> Option<IntValue<'ctx>> {
    match op {
        AluOp::Add => builder.build_int_add(a, b, "add").ok(),
        AluOp::Sub => builder.build_int_sub(a, b, "sub").ok(),
        AluOp::Xor => builder.build_xor(a, b, "xor").ok(),
        AluOp::Or => builder.build_or(a, b, "or").ok(),
        AluOp::And => builder.build_and(a, b, "and").ok(),
        AluOp::Sll => builder.build_left_shift(a, b, "sll").ok(),
        AluOp::Srl => builder.build_right_shift(a, b, false, "srl").ok(),
        AluOp::Sra => builder.build_right_shift(a, b, true, "sra").ok(),
        // Comparisons and the M-extension opcodes are not translated to IR; a block containing
        // them simply ends at the preceding instruction (see `compile_block`'s match arms).
        _ => None,
    }
}

impl Jit {
    /// Shared body of [`Backend::step`] and [`Backend::run_step`]. `single_instruction` selects
    /// which compilation mode a cache miss (or mode mismatch) recompiles in, and also controls
    /// whether the interpreter fallback for the block-ending instruction runs: in
    /// single-instruction mode it only runs when nothing was translated at all, since otherwise
    /// the one translated instruction already satisfies the "exactly one instruction" contract
    /// and running the next one too would violate it.
    fn dispatch(&mut self, state: &mut HartState, single_instruction: bool) -> Result<(), CoreError> {
        let pc = state.registers.pc();

        let needs_compile = match self.cache.get(&pc) {
            Some(block) => block.single_instruction != single_instruction,
            None => true,
        };
        if needs_compile {
            self.compile_block(state, pc, single_instruction)?;
        }

        let straight_line_len = {
            let block = self.cache.get_mut(&pc).expect("just compiled or already cached");
            self.clock += 1;
            block.last_used = self.clock;
            block.straight_line_len
        };

        if straight_line_len > 0 {
            let block = self.cache.get(&pc).unwrap();
            let mut regs_buffer = vec![0u64; state.registers.len() as usize];
            for (i, slot) in regs_buffer.iter_mut().enumerate() {
                *slot = state.registers.x(crate::registers::Specifier::from_u5(i as u8));
            }
            let mut runtime = Runtime {
                regs: regs_buffer.as_mut_ptr(),
            };
            let status = unsafe { block.entry.call(&mut runtime as *mut Runtime) };
            if status != 0 {
                return Err(CoreError::Jit(JitError::Compile(pc)));
            }
            for (i, &value) in regs_buffer.iter().enumerate() {
                if i != 0 {
                    state
                        .registers
                        .set_x(crate::registers::Specifier::from_u5(i as u8), value);
                }
            }
            state.registers.advance_pc(straight_line_len);
        }

        // The instruction the compiled prefix stopped at still needs to execute. In batch mode
        // this always applies once the prefix has run its course, to complete the full block. In
        // single-instruction mode it only applies when nothing was translated (straight_line_len
        // == 0): the translated case already retired its one instruction above, so running the
        // next instruction too would retire two and break the `step` contract.
        let run_fallback = if single_instruction {
            straight_line_len == 0
        } else {
            state.registers.pc() == pc + straight_line_len as u64
        };
        if run_fallback {
            self.fallback.step(state)?;
        }
        Ok(())
    }
}

impl Backend for Jit {
    fn step(&mut self, state: &mut HartState) -> Result<(), CoreError> {
        self.dispatch(state, true)
    }

    fn run_step(&mut self, state: &mut HartState) -> Result<(), CoreError> {
        self.dispatch(state, false)
    }

    fn cached_block_count(&self) -> Option<usize> {
        Some(self.cache.len())
    }

    fn has_cached_block(&self, start_pc: u64) -> bool {
        self.cache.contains_key(&start_pc)
    }
}
