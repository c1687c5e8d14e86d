//! The hart's flat, byte-addressable address space.

use thiserror::Error;

macro_rules! access_fns {
    ( $( $read_fn:ident, $write_fn:ident => $u:ident ),* $(,)? ) => {
        $(
            /// Read a little-endian value at `address`.
            ///
            /// The address doesn't need to be naturally aligned.
            pub fn $read_fn(&self, address: u32) -> Result<$u, MemoryError> {
                let mut buf = [0u8; std::mem::size_of::<$u>()];
                self.read(address, &mut buf).map(|()| $u::from_le_bytes(buf))
            }

            /// Write `value` at `address` in little-endian byte order.
            ///
            /// The address doesn't need to be naturally aligned.
            pub fn $write_fn(&mut self, address: u32, value: $u) -> Result<(), MemoryError> {
                self.write(address, &value.to_le_bytes())
            }
        )*
    };
}

/// A fixed-size buffer of bytes starting at address `0`.
///
/// Every access is bounds checked: an access of `width` bytes at `address` succeeds iff
/// `address + width <= size`. Failed accesses never touch the buffer. Multi-byte values are
/// little-endian and may be unaligned.
#[derive(Clone)]
pub struct Memory {
    bytes: Box<[u8]>,
}

impl Memory {
    /// Allocates `size` zeroed bytes.
    pub fn new(size: u32) -> Self {
        Self {
            bytes: vec![0; size as usize].into_boxed_slice(),
        }
    }

    /// Size of the address space in bytes.
    pub fn size(&self) -> u32 {
        // The buffer is created from a `u32` size and never resized.
        self.bytes.len() as u32
    }

    /// Copies `image` into memory starting at `offset`.
    pub fn load(&mut self, offset: u32, image: &[u8]) -> Result<(), MemoryError> {
        self.write(offset, image)
    }

    /// Fills `buf` with the bytes starting at `address`.
    pub fn read(&self, address: u32, buf: &mut [u8]) -> Result<(), MemoryError> {
        let range = self.range(address, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    /// Writes all of `buf` starting at `address`.
    pub fn write(&mut self, address: u32, buf: &[u8]) -> Result<(), MemoryError> {
        let range = self.range(address, buf.len())?;
        self.bytes[range].copy_from_slice(buf);
        Ok(())
    }

    pub fn read_byte(&self, address: u32) -> Result<u8, MemoryError> {
        let mut buf = [0];
        self.read(address, &mut buf).map(|()| buf[0])
    }

    pub fn write_byte(&mut self, address: u32, value: u8) -> Result<(), MemoryError> {
        self.write(address, &[value])
    }

    access_fns! {
        read_halfword, write_halfword => u16,
        read_word, write_word => u32,
    }

    /// Debugger read of a single byte.
    pub fn peek(&self, address: u32) -> Result<u8, MemoryError> {
        self.read_byte(address)
    }

    /// Debugger write of a single byte.
    pub fn poke(&mut self, address: u32, value: u8) -> Result<(), MemoryError> {
        self.write_byte(address, value)
    }

    fn range(&self, address: u32, width: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        let start = address as usize;
        match start.checked_add(width) {
            Some(end) if end <= self.bytes.len() => Ok(start..end),
            _ => Err(MemoryError::OutOfBounds { address, width }),
        }
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("size", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum MemoryError {
    #[error("access of {width} byte(s) at {address:#010x} is outside the address space")]
    OutOfBounds { address: u32, width: usize },
}
