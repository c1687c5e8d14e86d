#[macro_use]
extern crate static_assertions;

use std::num::NonZeroU32;

#[cfg(test)]
mod asm;
pub mod debug;
mod execute;
pub mod gdb;
pub mod handler;
pub mod hart;
pub mod instruction;
pub mod memory;
pub mod registers;

pub use debug::{BreakpointKind, DebugState, DebugStub, StopReason};
pub use handler::{HandlerKind, HandlerTable, Handlers};
pub use hart::{Halt, Hart};
pub use memory::{Memory, MemoryError};

/// Default size of the address space, 32 KiB.
pub const DEFAULT_MEMORY_SIZE: u32 = 32 * 1024;

/// Default number of cycles between two calls of the interrupt handler.
pub const DEFAULT_INTERRUPT_PERIOD: NonZeroU32 = match NonZeroU32::new(500) {
    Some(period) => period,
    None => panic!("interrupt period must be non-zero"),
};

/// Settings of a single simulation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Size of the flat address space in bytes.
    pub memory_size: u32,
    /// The interrupt handler runs every time the cycle counter is a multiple of this.
    pub interrupt_period: NonZeroU32,
    /// Stop normally once this many cycles have executed.
    pub timeout: Option<u64>,
    /// Print one line per executed instruction to the console.
    pub trace: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            interrupt_period: DEFAULT_INTERRUPT_PERIOD,
            timeout: None,
            trace: false,
        }
    }
}

/// Fatal simulation errors. A run that ends with one of these is "halted in error".
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("memory access at pc {pc:#010x} failed")]
    Memory {
        #[source]
        source: MemoryError,
        pc: u32,
    },
    #[error("invalid instruction {raw:#010x} at pc {pc:#010x}")]
    InvalidInstruction { raw: u32, pc: u32 },
    #[error("pc {pc:#010x} is outside the address space")]
    PcOutOfRange { pc: u32 },
}

impl Error {
    /// POSIX error number the command line front end exits with.
    pub fn exit_code(&self) -> i32 {
        match self {
            // EFAULT
            Self::Memory { .. } | Self::PcOutOfRange { .. } => 14,
            // EILSEQ
            Self::InvalidInstruction { .. } => 84,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(32768, config.memory_size);
        assert_eq!(500, config.interrupt_period.get());
        assert_eq!(None, config.timeout);
        assert!(!config.trace);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(84, Error::InvalidInstruction { raw: 0, pc: 4 }.exit_code());
        assert_eq!(14, Error::PcOutOfRange { pc: 0x10_0000 }.exit_code());
        let error = Error::Memory {
            source: MemoryError::OutOfBounds {
                address: 0x8000,
                width: 4,
            },
            pc: 0x10,
        };
        assert_eq!(14, error.exit_code());
        assert_eq!("memory access at pc 0x00000010 failed", error.to_string());
    }
}
