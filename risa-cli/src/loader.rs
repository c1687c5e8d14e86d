use goblin::elf::program_header::PT_LOAD;
use goblin::elf::Elf;
use log::{debug, info};
use risa_core::Hart;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("program image of {size} bytes does not fit in {memory_size} bytes of memory")]
    ImageTooLarge { size: usize, memory_size: u32 },
    #[error("ELF segment [{start:#010x}..{end:#010x}) does not fit in {memory_size} bytes of memory")]
    SegmentOutOfRange {
        start: u64,
        end: u64,
        memory_size: u32,
    },
    #[error("ELF segment at {address:#010x} points outside of the file")]
    TruncatedSegment { address: u64 },
    #[error("failed to parse ELF file")]
    Elf(#[from] goblin::error::Error),
}

/// Copies a flat binary into memory starting at address `0`.
pub fn load_raw(hart: &mut Hart, image: &[u8]) -> Result<(), LoadError> {
    let memory = hart.memory_mut();
    memory
        .load(0, image)
        .map_err(|_| LoadError::ImageTooLarge {
            size: image.len(),
            memory_size: memory.size(),
        })?;
    info!("Loaded {} byte program image", image.len());
    Ok(())
}

/// Copies every `PT_LOAD` segment of an ELF file into memory and returns the entry point.
///
/// Bytes between a segment's file size and memory size are left zeroed.
pub fn load_elf(hart: &mut Hart, program_elf: &[u8]) -> Result<u32, LoadError> {
    let elf = Elf::parse(program_elf)?;
    let memory = hart.memory_mut();
    let memory_size = memory.size();

    for header in elf.program_headers.iter().filter(|h| h.p_type == PT_LOAD) {
        let start = header.p_vaddr;
        let end = start.saturating_add(header.p_memsz);
        if end > u64::from(memory_size) {
            return Err(LoadError::SegmentOutOfRange {
                start,
                end,
                memory_size,
            });
        }
        let data = program_elf
            .get(header.file_range())
            .ok_or(LoadError::TruncatedSegment { address: start })?;
        debug!(
            "Loading segment into memory at [{:#010x}..{:#010x})",
            start,
            start + data.len() as u64
        );
        // `end` fits in memory, so the start address fits in a `u32`
        memory
            .load(start as u32, data)
            .map_err(|_| LoadError::SegmentOutOfRange {
                start,
                end,
                memory_size,
            })?;
    }

    let entry = elf.entry as u32;
    info!("Loaded ELF file with entry point {entry:#010x}");
    Ok(entry)
}
