use anyhow::bail;

use crate::format::elf::{
    ElfFile, Rela, Section, Symbol, RELA_SIZE, SECTION_HEADER_SIZE, SHF_ALLOC, SHF_EXECINSTR,
    SHF_WRITE, SHN_LORESERVE, SHT_NOBITS, SHT_PROGBITS, SHT_REL, SHT_RELA, SHT_RPL_CRCS,
    SHT_RPL_EXPORTS, SHT_RPL_FILEINFO, SHT_RPL_IMPORTS, SHT_STRTAB, SHT_SYMTAB, STT_FUNC,
    STT_OBJECT, STT_SECTION, SYMBOL_SIZE,
};
use crate::rpl::LOAD_BASE_ADDRESS;

#[must_use]
pub fn align_up(value: u32, align: u32) -> u32 {
    let mask = align.saturating_sub(1);
    value.saturating_add(mask) & !mask
}

/// Reorders the section list into the loader's canonical ordering and
/// rewrites every field that stores a section index through the inverse
/// permutation: the file's `shstrndx`, each header's `link`, each RELA
/// header's `info`, and each symbol's `shndx` below `SHN_LORESERVE`.
///
/// Expected order:
///   NULL
///   > executable PROGBITS
///   > RPL_EXPORTS
///   > read-only PROGBITS > writable PROGBITS > NOBITS
///   > REL / RELA
///   > RPL_IMPORTS
///   > SYMTAB / STRTAB
///
/// # Errors
/// Fails when a section fits no bucket, or when an index-valued field
/// references a section that does not exist.
pub fn reorder_sections(file: &mut ElfFile) -> anyhow::Result<()> {
    let order = canonical_order(&file.sections);
    if order.len() != file.sections.len() {
        bail!("invalid section in elf file");
    }

    let mut old: Vec<Option<Section>> = file.sections.drain(..).map(Some).collect();
    let mut inverse = vec![0u16; old.len()];
    for (new_index, &old_index) in order.iter().enumerate() {
        inverse[old_index] = new_index as u16;
    }
    for &old_index in &order {
        match old[old_index].take() {
            Some(section) => file.sections.push(section),
            None => bail!("invalid section in elf file"),
        }
    }

    file.header.shstrndx = remap(&inverse, u32::from(file.header.shstrndx))? as u16;
    for section in &mut file.sections {
        section.header.link = remap(&inverse, section.header.link)?;
    }
    for section in &mut file.sections {
        if section.header.sh_type == SHT_RELA {
            section.header.info = remap(&inverse, section.header.info)?;
        }
    }
    for section in &mut file.sections {
        if section.header.sh_type != SHT_SYMTAB {
            continue;
        }
        for record in section.data.chunks_exact_mut(SYMBOL_SIZE) {
            let mut symbol = Symbol::parse(record);
            if symbol.shndx < SHN_LORESERVE {
                symbol.shndx = remap(&inverse, u32::from(symbol.shndx))? as u16;
                symbol.emit(record);
            }
        }
    }
    Ok(())
}

fn canonical_order(sections: &[Section]) -> Vec<usize> {
    let buckets: [&dyn Fn(&Section) -> bool; 8] = [
        &|s| s.header.sh_type == SHT_PROGBITS && s.header.flags & SHF_EXECINSTR != 0,
        &|s| s.header.sh_type == SHT_RPL_EXPORTS,
        &|s| {
            s.header.sh_type == SHT_PROGBITS && s.header.flags & (SHF_EXECINSTR | SHF_WRITE) == 0
        },
        &|s| {
            s.header.sh_type == SHT_PROGBITS
                && s.header.flags & SHF_EXECINSTR == 0
                && s.header.flags & SHF_WRITE != 0
        },
        &|s| s.header.sh_type == SHT_NOBITS,
        &|s| matches!(s.header.sh_type, SHT_REL | SHT_RELA),
        &|s| s.header.sh_type == SHT_RPL_IMPORTS,
        &|s| matches!(s.header.sh_type, SHT_SYMTAB | SHT_STRTAB),
    ];

    let mut order = Vec::with_capacity(sections.len());
    order.push(0);
    for bucket in buckets {
        for (index, section) in sections.iter().enumerate() {
            if index != 0 && bucket(section) {
                order.push(index);
            }
        }
    }
    order
}

fn remap(inverse: &[u16], index: u32) -> anyhow::Result<u32> {
    match inverse.get(index as usize) {
        Some(&new_index) => Ok(u32::from(new_index)),
        None => bail!("section index {index} is out of range"),
    }
}

/// The loader requires fixed alignments per section kind.
pub fn apply_section_alignment(file: &mut ElfFile) {
    for section in &mut file.sections {
        match section.header.sh_type {
            SHT_PROGBITS => section.header.addralign = 32,
            SHT_NOBITS => section.header.addralign = 64,
            SHT_RPL_IMPORTS => section.header.addralign = 4,
            _ => {}
        }
    }
}

/// Moves the loader-visible sections into the load segment at
/// `LOAD_BASE_ADDRESS`, in the order the loader expects:
///   .fexports > .dexports > .symtab > .strtab > .shstrtab > RPL_IMPORTS.
///
/// The linker script leaves symtab and strtab outside the load segment, so
/// they also gain the ALLOC flag here. The cursor advances by payload
/// length; each section is placed at the cursor rounded up to its own
/// alignment.
pub fn assign_loader_addresses(file: &mut ElfFile) {
    let mut addr = LOAD_BASE_ADDRESS;

    for name in [".fexports", ".dexports"] {
        if let Some(index) = file.section_index(name) {
            let aligned = align_up(addr, file.sections[index].header.addralign);
            relocate_section(file, index, aligned);
            addr += file.sections[index].data.len() as u32;
        }
    }

    for name in [".symtab", ".strtab", ".shstrtab"] {
        if let Some(index) = file.section_index(name) {
            let aligned = align_up(addr, file.sections[index].header.addralign);
            relocate_section(file, index, aligned);
            file.sections[index].header.flags |= SHF_ALLOC;
            addr += file.sections[index].data.len() as u32;
        }
    }

    let imports: Vec<usize> = file
        .sections
        .iter()
        .enumerate()
        .filter(|(_, s)| s.header.sh_type == SHT_RPL_IMPORTS)
        .map(|(index, _)| index)
        .collect();
    for index in imports {
        let aligned = align_up(addr, file.sections[index].header.addralign);
        relocate_section(file, index, aligned);
        addr += file.sections[index].data.len() as u32;
    }
}

/// Moves one section to `new_addr` and shifts everything that pointed into
/// it by the same delta: object/function/section symbols and RELA offsets
/// whose value lies in the inclusive window `[addr, addr + size]`. The
/// inclusive upper bound admits boundary symbols pointing one past the
/// section's final byte.
pub fn relocate_section(file: &mut ElfFile, index: usize, new_addr: u32) {
    let old_addr = file.sections[index].header.addr;
    let size = if file.sections[index].data.is_empty() {
        file.sections[index].header.size
    } else {
        file.sections[index].data.len() as u32
    };
    let old_end = old_addr.saturating_add(size);

    for section in &mut file.sections {
        match section.header.sh_type {
            SHT_SYMTAB => {
                for record in section.data.chunks_exact_mut(SYMBOL_SIZE) {
                    let mut symbol = Symbol::parse(record);
                    if !matches!(symbol.sym_type(), STT_OBJECT | STT_FUNC | STT_SECTION) {
                        continue;
                    }
                    if symbol.value >= old_addr && symbol.value <= old_end {
                        symbol.value = (symbol.value - old_addr) + new_addr;
                        symbol.emit(record);
                    }
                }
            }
            SHT_RELA => {
                for record in section.data.chunks_exact_mut(RELA_SIZE) {
                    let mut rela = Rela::parse(record);
                    if rela.offset >= old_addr && rela.offset <= old_end {
                        rela.offset = (rela.offset - old_addr) + new_addr;
                        rela.emit(record);
                    }
                }
            }
            _ => {}
        }
    }

    file.sections[index].header.addr = new_addr;
}

/// Assigns final file offsets in the on-disk traversal order:
///   RPL_CRCS > RPL_FILEINFO
///   > non-executable PROGBITS > RPL_EXPORTS > RPL_IMPORTS
///   > SYMTAB / STRTAB > executable PROGBITS > REL / RELA.
///
/// Every visited header's size is rewritten to the payload length. NOBITS
/// sections are not visited and keep offset 0.
pub fn assign_file_offsets(file: &mut ElfFile) {
    let mut offset = file.header.shoff
        + align_up(
            file.sections.len() as u32 * SECTION_HEADER_SIZE as u32,
            64,
        );

    let mut place = |section: &mut Section| {
        section.header.offset = offset;
        section.header.size = section.data.len() as u32;
        offset += section.header.size;
    };

    if let Some(section) = file
        .sections
        .iter_mut()
        .find(|s| s.header.sh_type == SHT_RPL_CRCS)
    {
        place(section);
    }
    if let Some(section) = file
        .sections
        .iter_mut()
        .find(|s| s.header.sh_type == SHT_RPL_FILEINFO)
    {
        place(section);
    }
    for section in &mut file.sections {
        if section.header.sh_type == SHT_PROGBITS && section.header.flags & SHF_EXECINSTR == 0 {
            place(section);
        }
    }
    for section in &mut file.sections {
        if section.header.sh_type == SHT_RPL_EXPORTS {
            place(section);
        }
    }
    for section in &mut file.sections {
        if section.header.sh_type == SHT_RPL_IMPORTS {
            place(section);
        }
    }
    for section in &mut file.sections {
        if matches!(section.header.sh_type, SHT_SYMTAB | SHT_STRTAB) {
            place(section);
        }
    }
    for section in &mut file.sections {
        if section.header.sh_type == SHT_PROGBITS && section.header.flags & SHF_EXECINSTR != 0 {
            place(section);
        }
    }
    for section in &mut file.sections {
        if matches!(section.header.sh_type, SHT_REL | SHT_RELA) {
            place(section);
        }
    }
}
