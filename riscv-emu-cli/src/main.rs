//! Headless host driver for `riscv-emu-core`.
//!
//! Loads a binary or ELF image, builds a [`Core`] per the requested configuration, and runs it
//! to completion (or until it aborts), printing UART output as it streams in. This is the
//! external collaborator boundary `spec.md` describes: no disassembly window, no register view,
//! no symbol file support — just enough to exercise the core from a terminal.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::{error, info};
use riscv_emu_core::config::{BackendKind, Config, Extension, Extensions, Xlen};
use riscv_emu_core::Core;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Image to load: a raw binary blob unless `--elf` is passed.
    image: PathBuf,

    /// Treat `image` as an ELF file instead of a raw binary.
    #[arg(long)]
    elf: bool,

    /// Use RV64I instead of the default RV32I.
    #[arg(long)]
    rv64: bool,

    /// Use the RV32E embedded register file (16 GPRs). Ignored with `--rv64`.
    #[arg(long)]
    embedded: bool,

    /// Run with the JIT back-end instead of the interpreter.
    #[arg(long)]
    jit: bool,

    /// Disabled extensions, by name (`m`, `a`, `c`, `zicsr`, `zifencei`). All are enabled by
    /// default.
    #[arg(long, value_delimiter = ',')]
    disable: Vec<String>,

    /// Maximum number of instructions to execute before stopping, if the program does not abort
    /// or loop forever on its own. Absent means run until the core aborts.
    #[arg(long)]
    max_steps: Option<u64>,
}

fn parse_extensions(disable: &[String]) -> Extensions {
    let disabled: Vec<&str> = disable.iter().map(String::as_str).collect();
    let all = [
        Extension::M,
        Extension::A,
        Extension::C,
        Extension::Zicsr,
        Extension::Zifencei,
    ];
    Extensions::from_iter(all.into_iter().filter(|ext| {
        let name = match ext {
            Extension::M => "m",
            Extension::A => "a",
            Extension::C => "c",
            Extension::Zicsr => "zicsr",
            Extension::Zifencei => "zifencei",
        };
        !disabled.iter().any(|d| d.eq_ignore_ascii_case(name))
    }))
}

fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let args = Args::parse();

    let config = Config {
        xlen: if args.rv64 { Xlen::Rv64 } else { Xlen::Rv32 },
        embedded: args.embedded && !args.rv64,
        extensions: parse_extensions(&args.disable),
        backend: if args.jit { BackendKind::Jit } else { BackendKind::Interpreter },
        ..Config::default()
    };

    let mut core = Core::new(config);
    core.set_uart_sink(Box::new(|line: &str| println!("{line}")));

    let load_result = if args.elf {
        core.load_elf(&args.image)
    } else {
        core.load_binary(&args.image)
    };
    if let Err(error) = load_result {
        error!("failed to load {}: {error}", args.image.display());
        std::process::exit(1);
    }

    info!("starting at pc {:#010x}", core.pc());

    match args.max_steps {
        Some(max_steps) => run_bounded(&core, max_steps),
        None => run_until_abort(&mut core),
    }

    if let Some((subsystem, message)) = core.abort_detail() {
        error!("core aborted ({subsystem}): {message}");
        std::process::exit(1);
    }
}

/// Steps the core directly from this thread, up to `max_steps` times or until it aborts.
fn run_bounded(core: &Core, max_steps: u64) {
    for _ in 0..max_steps {
        if core.step().is_err() {
            break;
        }
    }
}

/// Runs the core's background stepping thread until it aborts, polling at a modest interval
/// rather than busy-waiting on this thread as well.
fn run_until_abort(core: &mut Core) {
    core.run();
    while core.is_running() {
        std::thread::sleep(Duration::from_millis(10));
    }
    core.stop();
}
