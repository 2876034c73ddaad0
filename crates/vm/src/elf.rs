//! Minimal ELF image loading for bootrom/kernel payloads.
//!
//! PT_LOAD segments are copied to their physical addresses (guest RAM has
//! been zeroed beforehand, so BSS tails need no work) and the entry point
//! becomes the reset PC. Anything that is not a loadable ELF is treated as
//! a flat binary by the caller.

use object::{Object, ObjectSegment};

use crate::hart::RamView;
use crate::machine::MachineError;

/// Cheap magic check so flat binaries skip the parser entirely.
pub fn is_elf(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == [0x7F, b'E', b'L', b'F']
}

/// Load the segments of an ELF image into guest RAM; returns the entry
/// point. Both ELF32 and ELF64 are accepted.
pub fn load(data: &[u8], ram: &RamView) -> Result<u64, MachineError> {
    let file = object::File::parse(data).map_err(|_| MachineError::BadElf)?;
    for seg in file.segments() {
        let bytes = seg.data().map_err(|_| MachineError::BadElf)?;
        if bytes.is_empty() {
            continue;
        }
        let addr = seg.address();
        if !ram.contains(addr, bytes.len() as u64) {
            return Err(MachineError::ImageTooLarge);
        }
        // SAFETY: containment checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                ram.ptr.add((addr - ram.base) as usize),
                bytes.len(),
            );
        }
    }
    Ok(file.entry())
}
