//! The memory/bus subsystem: flat DRAM plus a minimal UART MMIO device.
//!
//! Addresses are 32-bit physical addresses regardless of the hart's [`Xlen`](crate::config::Xlen);
//! on an RV64 hart the upper address bits of a 64-bit effective address are simply discarded
//! before reaching the bus, mirroring the "no MMU" non-goal.

use thiserror::Error;

/// Physical base address of the 16 MiB DRAM region.
pub const DRAM_BASE: u32 = 0x8000_0000;

/// Size of the DRAM region, in bytes.
pub const DRAM_SIZE: u32 = 16 * 1024 * 1024;

/// Start of the tolerant aliased region directly below [`DRAM_BASE`]. Reads here always return
/// zero instead of raising a [`BusError`]; writes are ignored. This exists so that a guest image
/// which conservatively probes a region just below its load address doesn't immediately fault.
pub const ALIASED_REGION_START: u32 = 0x7F00_0000;

/// Base address of the UART device's MMIO register window.
pub const UART_BASE: u32 = 0x1000_0000;

/// Offset of the Transmit Holding Register (write-only) within the UART window.
pub const UART_THR: u32 = 0x00;

/// Offset of the Line Status Register (read-only) within the UART window.
pub const UART_LSR: u32 = 0x05;

/// Fixed value returned by a read of [`UART_LSR`]: transmit holding register and transmitter both
/// always empty, no errors. `0x60 == 0b0110_0000`.
pub const UART_LSR_VALUE: u8 = 0x60;

/// Number of bytes the UART's internal line buffer holds before it is flushed even without a
/// trailing newline.
pub const UART_FLUSH_THRESHOLD: usize = 256;

/// The address a [`Core`](crate::Core)'s program counter is initialized to on construction and
/// reset.
pub const RESET_VECTOR: u32 = DRAM_BASE;

/// Errors raised by an out-of-range or otherwise invalid bus access.
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum BusError {
    #[error("read out of any mapped region at address {0:#010x}")]
    UnmappedRead(u32),
    #[error("write out of any mapped region at address {0:#010x}")]
    UnmappedWrite(u32),
}

/// Sink that UART transmit lines are flushed to.
///
/// The default sink (installed when no callback is provided) emits each flushed line through
/// [`log::info!`] under the `"uart"` target, so headless use still observes UART output.
pub type UartSink = Box<dyn FnMut(&str) + Send>;

fn default_sink(line: &str) {
    log::info!(target: "uart", "{line}");
}

/// UART device state: a write-only transmit holding register that buffers bytes until a newline
/// or [`UART_FLUSH_THRESHOLD`] bytes accumulate, at which point the buffered line is flushed to
/// the installed [`UartSink`].
///
/// The buffer is raw bytes, not a `String`: bytes are written one at a time straight off the bus,
/// and counting/flushing must happen on byte length, not on however many `char`s those bytes
/// happen to decode to (a byte `>= 0x80` pushed onto a `String` would encode as multiple UTF-8
/// bytes, shifting the flush threshold and corrupting the emitted content). Only the flushed line
/// is converted to text, at the sink boundary.
struct Uart {
    buffer: Vec<u8>,
    sink: Option<UartSink>,
}

impl std::fmt::Debug for Uart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uart")
            .field("buffer_len", &self.buffer.len())
            .finish()
    }
}

impl Uart {
    fn new() -> Self {
        Self {
            buffer: Vec::new(),
            sink: None,
        }
    }

    fn write_thr(&mut self, byte: u8) {
        self.buffer.push(byte);
        if byte == b'\n' || self.buffer.len() >= UART_FLUSH_THRESHOLD {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let bytes = std::mem::take(&mut self.buffer);
        let bytes = bytes.strip_suffix(b"\n").unwrap_or(&bytes);
        let line = String::from_utf8_lossy(bytes);
        match &mut self.sink {
            Some(sink) => sink(&line),
            None => default_sink(&line),
        }
    }
}

/// The memory/bus subsystem.
///
/// Owns the flat DRAM array and the UART device, and dispatches 8/16/32(/64)-bit accesses to
/// whichever is mapped at the requested address.
#[derive(Debug)]
pub struct Bus {
    dram: Vec<u8>,
    uart: Uart,
}

impl Bus {
    /// Creates a fresh, zero-initialized bus.
    pub fn new() -> Self {
        Self {
            dram: vec![0u8; DRAM_SIZE as usize],
            uart: Uart::new(),
        }
    }

    /// Installs the callback UART transmit lines are flushed to, replacing any previously
    /// installed sink (or the default logging sink).
    pub fn set_uart_sink(&mut self, sink: UartSink) {
        self.uart.sink = Some(sink);
    }

    fn dram_offset(address: u32) -> Option<usize> {
        address
            .checked_sub(DRAM_BASE)
            .filter(|&offset| offset < DRAM_SIZE)
            .map(|offset| offset as usize)
    }

    fn in_aliased_region(address: u32) -> bool {
        (ALIASED_REGION_START..DRAM_BASE).contains(&address)
    }

    /// Reads a single byte.
    pub fn read8(&self, address: u32) -> Result<u8, BusError> {
        if let Some(offset) = Self::dram_offset(address) {
            return Ok(self.dram[offset]);
        }
        if address == UART_BASE + UART_THR {
            return Ok(0);
        }
        if address == UART_BASE + UART_LSR {
            return Ok(UART_LSR_VALUE);
        }
        if Self::in_aliased_region(address) {
            return Ok(0);
        }
        Err(BusError::UnmappedRead(address))
    }

    /// Writes a single byte.
    pub fn write8(&mut self, address: u32, value: u8) -> Result<(), BusError> {
        if let Some(offset) = Self::dram_offset(address) {
            self.dram[offset] = value;
            return Ok(());
        }
        if address == UART_BASE + UART_THR {
            self.uart.write_thr(value);
            return Ok(());
        }
        if Self::in_aliased_region(address) {
            return Ok(());
        }
        Err(BusError::UnmappedWrite(address))
    }

    /// Reads a little-endian 16-bit halfword.
    pub fn read16(&self, address: u32) -> Result<u16, BusError> {
        let lo = self.read8(address)? as u16;
        let hi = self.read8(address.wrapping_add(1))? as u16;
        Ok(lo | (hi << 8))
    }

    /// Writes a little-endian 16-bit halfword.
    pub fn write16(&mut self, address: u32, value: u16) -> Result<(), BusError> {
        self.write8(address, value as u8)?;
        self.write8(address.wrapping_add(1), (value >> 8) as u8)
    }

    /// Reads a little-endian 32-bit word.
    pub fn read32(&self, address: u32) -> Result<u32, BusError> {
        let lo = self.read16(address)? as u32;
        let hi = self.read16(address.wrapping_add(2))? as u32;
        Ok(lo | (hi << 16))
    }

    /// Writes a little-endian 32-bit word.
    pub fn write32(&mut self, address: u32, value: u32) -> Result<(), BusError> {
        self.write16(address, value as u16)?;
        self.write16(address.wrapping_add(2), (value >> 16) as u16)
    }

    /// Reads a little-endian 64-bit doubleword. Only meaningful for RV64I (`LD`).
    pub fn read64(&self, address: u32) -> Result<u64, BusError> {
        let lo = self.read32(address)? as u64;
        let hi = self.read32(address.wrapping_add(4))? as u64;
        Ok(lo | (hi << 32))
    }

    /// Writes a little-endian 64-bit doubleword. Only meaningful for RV64I (`SD`).
    pub fn write64(&mut self, address: u32, value: u64) -> Result<(), BusError> {
        self.write32(address, value as u32)?;
        self.write32(address.wrapping_add(4), (value >> 32) as u32)
    }

    /// Copies a raw binary image into DRAM starting at offset `0` (i.e. at [`DRAM_BASE`]).
    pub fn load_binary(&mut self, image: &[u8]) {
        let len = image.len().min(self.dram.len());
        self.dram[..len].copy_from_slice(&image[..len]);
    }

    /// Force the DRAM contents back to all-zero. UART state is reset as well. Does not touch
    /// registers, CSRs, or the block cache — callers of `Core::reset` are responsible for those.
    pub fn reset(&mut self) {
        self.dram.fill(0);
        self.uart = Uart::new();
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dram_round_trip() {
        let mut bus = Bus::new();
        bus.write32(DRAM_BASE, 0xDEAD_BEEF).unwrap();
        assert_eq!(0xDEAD_BEEF, bus.read32(DRAM_BASE).unwrap());
    }

    #[test]
    fn test_unmapped_access_errors() {
        let bus = Bus::new();
        assert!(matches!(bus.read8(0x0000_0000), Err(BusError::UnmappedRead(0))));
    }

    #[test]
    fn test_aliased_region_tolerant() {
        let mut bus = Bus::new();
        assert_eq!(0, bus.read8(ALIASED_REGION_START).unwrap());
        assert_eq!(0, bus.read8(DRAM_BASE - 1).unwrap());
        // Writes into the aliased region are silently discarded, not persisted anywhere.
        bus.write8(DRAM_BASE - 1, 0xFF).unwrap();
        assert_eq!(0, bus.read8(DRAM_BASE - 1).unwrap());
    }

    #[test]
    fn test_uart_lsr_fixed_value() {
        let bus = Bus::new();
        assert_eq!(UART_LSR_VALUE, bus.read8(UART_BASE + UART_LSR).unwrap());
    }

    #[test]
    fn test_uart_thr_reads_as_zero() {
        let bus = Bus::new();
        assert_eq!(0, bus.read8(UART_BASE + UART_THR).unwrap());
    }

    #[test]
    fn test_uart_threshold_counts_raw_bytes_not_chars() {
        let mut bus = Bus::new();
        let flush_count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let flush_count_clone = flush_count.clone();
        bus.set_uart_sink(Box::new(move |_line: &str| {
            flush_count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        // Bytes >= 0x80 must count as one byte each towards the threshold, not expand into a
        // multi-byte UTF-8 sequence that would flush at half the configured threshold.
        for _ in 0..(UART_FLUSH_THRESHOLD - 1) {
            bus.write8(UART_BASE + UART_THR, 0xFF).unwrap();
        }
        assert_eq!(0, flush_count.load(std::sync::atomic::Ordering::SeqCst));
        bus.write8(UART_BASE + UART_THR, 0xFF).unwrap();
        assert_eq!(1, flush_count.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_uart_flush_on_newline() {
        let mut bus = Bus::new();
        let lines = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let lines_clone = lines.clone();
        bus.set_uart_sink(Box::new(move |line: &str| {
            lines_clone.lock().unwrap().push(line.to_owned());
        }));
        for byte in b"hi\n" {
            bus.write8(UART_BASE + UART_THR, *byte).unwrap();
        }
        assert_eq!(vec!["hi".to_owned()], *lines.lock().unwrap());
    }

    #[test]
    fn test_uart_flush_on_threshold() {
        let mut bus = Bus::new();
        let lines = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let lines_clone = lines.clone();
        bus.set_uart_sink(Box::new(move |line: &str| {
            lines_clone.lock().unwrap().push(line.to_owned());
        }));
        for _ in 0..UART_FLUSH_THRESHOLD {
            bus.write8(UART_BASE + UART_THR, b'x').unwrap();
        }
        assert_eq!(1, lines.lock().unwrap().len());
    }

    #[test]
    fn test_load_binary() {
        let mut bus = Bus::new();
        bus.load_binary(&[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(0x0403_0201, bus.read32(DRAM_BASE).unwrap());
    }
}
