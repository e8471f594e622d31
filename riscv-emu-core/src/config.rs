//! Configuration of a [`Core`](crate::Core) prior to construction.

use std::fmt;

/// The width of the integer registers a hart operates on.
///
/// > RV32 and RV64 both have 32 of these registers, while RV128 has... the widths are named
/// > XLEN=32 and XLEN=64 respectively.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Xlen {
    /// 32-bit integer registers (RV32I, or RV32E when [`Config::embedded`] is set).
    Rv32,
    /// 64-bit integer registers (RV64I).
    Rv64,
}

impl Xlen {
    /// The number of bits in a general-purpose register for this [`Xlen`].
    pub fn bits(self) -> u32 {
        match self {
            Xlen::Rv32 => 32,
            Xlen::Rv64 => 64,
        }
    }

    /// Sign-extends and masks `value` down to this [`Xlen`]'s width, returning it as a `u64`.
    pub fn truncate(self, value: u64) -> u64 {
        match self {
            Xlen::Rv32 => value as u32 as u64,
            Xlen::Rv64 => value,
        }
    }
}

impl fmt::Display for Xlen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Xlen::Rv32 => "RV32",
            Xlen::Rv64 => "RV64",
        })
    }
}

/// A single optional standard extension to the base integer ISA.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Extension {
    /// "M": integer multiplication and division.
    M,
    /// "A": atomic instructions.
    A,
    /// "C": compressed (16-bit) instructions. Only `C.ADDI`/`C.NOP` are currently decoded.
    C,
    /// "Zicsr": control and status register instructions.
    Zicsr,
    /// "Zifencei": instruction-fetch fence.
    Zifencei,
}

/// Which back-end a [`Core`](crate::Core) executes instructions with.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum BackendKind {
    /// Direct-threaded interpreter. Always available.
    #[default]
    Interpreter,
    /// Basic-block JIT compiler backed by LLVM (via `inkwell`).
    Jit,
}

/// A fixed set of [`Extension`]s, implemented as a small bitset.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Extensions(u8);

impl Extensions {
    /// The empty set: base integer ISA only.
    pub const NONE: Self = Self(0);

    fn bit(extension: Extension) -> u8 {
        1 << match extension {
            Extension::M => 0,
            Extension::A => 1,
            Extension::C => 2,
            Extension::Zicsr => 3,
            Extension::Zifencei => 4,
        }
    }

    /// Returns a set containing every `extension` in `extensions`.
    pub fn from_iter(extensions: impl IntoIterator<Item = Extension>) -> Self {
        let mut set = Self::NONE;
        for extension in extensions {
            set = set.with(extension);
        }
        set
    }

    /// Returns a copy of this set with `extension` added.
    pub fn with(self, extension: Extension) -> Self {
        Self(self.0 | Self::bit(extension))
    }

    /// Returns `true` if `extension` is present in this set.
    pub fn contains(self, extension: Extension) -> bool {
        self.0 & Self::bit(extension) != 0
    }
}

/// Configuration used to construct a [`Core`](crate::Core).
///
/// Corresponds to the external "Core configuration options" interface: XLEN, embedded-register
/// mode, the enabled extension set, and the selected execution back-end.
#[derive(Debug, Clone)]
pub struct Config {
    /// The integer register width.
    pub xlen: Xlen,
    /// Whether to use the RV32E embedded register file (16 integer registers instead of 32).
    ///
    /// Only meaningful when `xlen == Xlen::Rv32`.
    pub embedded: bool,
    /// The set of enabled standard extensions.
    pub extensions: Extensions,
    /// Which execution back-end `Core::run`/`Core::step` dispatch to.
    pub backend: BackendKind,
    /// Address the program counter is initialized to on construction and on [`Core::reset`].
    ///
    /// Defaults to [`crate::bus::RESET_VECTOR`].
    pub reset_vector: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            xlen: Xlen::Rv32,
            embedded: false,
            extensions: Extensions::from_iter([
                Extension::M,
                Extension::A,
                Extension::Zicsr,
                Extension::Zifencei,
            ]),
            backend: BackendKind::Interpreter,
            reset_vector: crate::bus::RESET_VECTOR,
        }
    }
}

impl Config {
    /// The number of general-purpose integer registers implied by this configuration: 16 for
    /// RV32E, 32 otherwise.
    pub fn num_gprs(&self) -> u8 {
        if self.xlen == Xlen::Rv32 && self.embedded {
            16
        } else {
            32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(0x0000_0000_FFFF_FFFF, Xlen::Rv32.truncate(0xFFFF_FFFF_FFFF_FFFF));
        assert_eq!(0xFFFF_FFFF_FFFF_FFFF, Xlen::Rv64.truncate(0xFFFF_FFFF_FFFF_FFFF));
    }

    #[test]
    fn test_extensions() {
        let set = Extensions::from_iter([Extension::M, Extension::C]);
        assert!(set.contains(Extension::M));
        assert!(set.contains(Extension::C));
        assert!(!set.contains(Extension::A));
    }

    #[test]
    fn test_num_gprs() {
        let mut config = Config {
            xlen: Xlen::Rv32,
            embedded: true,
            ..Config::default()
        };
        assert_eq!(16, config.num_gprs());
        config.embedded = false;
        assert_eq!(32, config.num_gprs());
        config.xlen = Xlen::Rv64;
        config.embedded = true;
        assert_eq!(32, config.num_gprs());
    }
}
