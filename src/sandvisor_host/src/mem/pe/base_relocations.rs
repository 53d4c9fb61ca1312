use super::section_table::calculate_offset_from_rva;
use crate::{new_error, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use goblin::pe::optional_header::OptionalHeader;
use std::io::Cursor;

/// One entry from a PE base relocation block: the page it relocates and
/// the type of fixup to apply within that page.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BaseRelocation {
    /// The RVA of the 4KiB page this relocation applies to.
    pub(crate) page_base_rva: u32,
    /// The byte offset within the page to patch.
    pub(crate) page_offset: u16,
    /// The relocation type (`IMAGE_REL_BASED_*`).
    pub(crate) typ: u8,
}

/// Parse every entry out of `payload`'s base relocation directory.
///
/// `payload` is re-parsed here (rather than threading a `goblin::pe::PE`
/// through `PEInfo`) because only the section table is needed to resolve
/// the directory's RVA to a file offset.
pub(crate) fn get_base_relocations(
    payload: &[u8],
    optional_header: OptionalHeader,
) -> Result<Vec<BaseRelocation>> {
    let pe = goblin::pe::PE::parse(payload)?;

    let dir = match optional_header.data_directories.get_base_relocation_table() {
        Some(dir) if dir.size > 0 => dir,
        _ => return Ok(Vec::new()),
    };

    let start_offset = calculate_offset_from_rva(&pe.sections, dir.virtual_address as u64)
        .ok_or_else(|| new_error!("could not resolve base relocation table RVA to a file offset"))?;
    let end_offset = start_offset + dir.size as u64;

    let mut cur = Cursor::new(payload);
    let mut relocations = Vec::new();

    cur.set_position(start_offset);
    while cur.position() < end_offset {
        let page_rva = cur.read_u32::<LittleEndian>()?;
        let block_size = cur.read_u32::<LittleEndian>()?;
        if block_size < 8 {
            break;
        }

        let entry_count = (block_size - 8) / 2;
        for _ in 0..entry_count {
            let entry = cur.read_u16::<LittleEndian>()?;
            relocations.push(BaseRelocation {
                page_base_rva: page_rva,
                page_offset: entry & 0x0FFF,
                typ: (entry >> 12) as u8,
            });
        }
    }

    Ok(relocations)
}
