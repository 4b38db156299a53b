use anyhow::Context;

use crate::cli::Args;
use crate::format::elf::{ElfFile, SHT_NOBITS};
use crate::layout::{
    apply_section_alignment, assign_file_offsets, assign_loader_addresses, reorder_sections,
};
use crate::relocs::lower_relocations;
use crate::rpl::{append_file_info, finalize_header, insert_crc_table};
use crate::writer::{deflate_sections, write_rpl};

/// Runs the whole ELF-to-RPL pipeline: read, fix up, synthesize the RPL
/// sections, compress, lay out, write. Passes run in a fixed order and the
/// first failure aborts the conversion.
///
/// # Errors
/// Returns the failing pass's diagnostic.
pub fn run(args: Args) -> anyhow::Result<()> {
    let input = std::fs::read(&args.src)
        .with_context(|| format!("could not open {} for reading", args.src))?;
    let mut file = ElfFile::parse(&input).map_err(|err| anyhow::anyhow!("{}: {err}", args.src))?;
    if args.verbose {
        println!("parsed {}: {} sections", args.src, file.sections.len());
    }

    normalize_bss(&mut file)?;
    reorder_sections(&mut file)?;
    lower_relocations(&mut file)?;
    apply_section_alignment(&mut file);
    assign_loader_addresses(&mut file);

    let info = append_file_info(&mut file);
    if args.verbose {
        println!(
            "segment sizes: text={:#x} data={:#x} load={:#x} temp={:#x}",
            info.text_size, info.data_size, info.load_size, info.temp_size
        );
    }
    insert_crc_table(&mut file);
    finalize_header(&mut file);

    deflate_sections(&mut file, args.uncompressed_relocs)?;
    assign_file_offsets(&mut file);
    write_rpl(&args.dst, &file)?;
    if args.verbose {
        println!("wrote {}: {} sections", args.dst, file.sections.len());
    }
    Ok(())
}

/// The linker script sometimes materializes `.bss` as PROGBITS. The loader
/// insists on NOBITS, so an all-zero payload is dropped again.
fn normalize_bss(file: &mut ElfFile) -> anyhow::Result<()> {
    let Some(section) = file.section_by_name_mut(".bss") else {
        return Ok(());
    };
    if section.data.iter().any(|&b| b != 0) {
        anyhow::bail!("BSS has non-zero content");
    }
    section.header.sh_type = SHT_NOBITS;
    section.header.offset = 0;
    section.data.clear();
    Ok(())
}
