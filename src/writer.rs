use std::io::Write;

use anyhow::{Context, Result};
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::format::elf::{
    ElfFile, FILE_HEADER_SIZE, SECTION_HEADER_SIZE, SHF_DEFLATED, SHT_REL, SHT_RELA,
    SHT_RPL_CRCS, SHT_RPL_FILEINFO,
};

/// Sections smaller than this are not worth a DEFLATE stream.
pub const DEFLATE_MIN_SECTION_SIZE: usize = 0x18;

/// Compresses every eligible section payload in place.
///
/// An eligible payload is at least `DEFLATE_MIN_SECTION_SIZE` bytes and not
/// the CRC table or FILEINFO, which the loader reads before it can inflate
/// anything. The replacement payload is a 4-byte big-endian inflated size
/// followed by a zlib stream at level 6, and the section gains the
/// `SHF_DEFLATED` flag. With `keep_relocs_uncompressed` set, REL/RELA
/// sections are exempted as well.
///
/// # Errors
/// Fails when the DEFLATE stream reports an error.
pub fn deflate_sections(file: &mut ElfFile, keep_relocs_uncompressed: bool) -> Result<()> {
    for section in &mut file.sections {
        if section.data.len() < DEFLATE_MIN_SECTION_SIZE
            || section.header.sh_type == SHT_RPL_CRCS
            || section.header.sh_type == SHT_RPL_FILEINFO
        {
            continue;
        }
        if keep_relocs_uncompressed && matches!(section.header.sh_type, SHT_REL | SHT_RELA) {
            continue;
        }

        let mut deflated = Vec::with_capacity(section.data.len() / 2 + 4);
        deflated.extend_from_slice(&(section.data.len() as u32).to_be_bytes());
        let mut encoder = ZlibEncoder::new(deflated, Compression::new(6));
        encoder
            .write_all(&section.data)
            .with_context(|| format!("failed to deflate section {}", section.name))?;
        section.data = encoder
            .finish()
            .with_context(|| format!("failed to deflate section {}", section.name))?;
        section.header.flags |= SHF_DEFLATED;
    }
    Ok(())
}

/// Assembles the complete output image: file header at offset 0, section
/// headers contiguous at `shoff`, every non-empty payload at its assigned
/// offset. Gaps stay zero.
#[must_use]
pub fn build_rpl_image(file: &ElfFile) -> Vec<u8> {
    let shoff = file.header.shoff as usize;
    let mut total = shoff + file.sections.len() * SECTION_HEADER_SIZE;
    for section in &file.sections {
        if !section.data.is_empty() {
            total = total.max(section.header.offset as usize + section.data.len());
        }
    }

    let mut image = vec![0u8; total];

    let mut header = Vec::with_capacity(FILE_HEADER_SIZE);
    file.header.emit(&mut header);
    image[..header.len()].copy_from_slice(&header);

    let mut headers = Vec::with_capacity(file.sections.len() * SECTION_HEADER_SIZE);
    for section in &file.sections {
        section.header.emit(&mut headers);
    }
    image[shoff..shoff + headers.len()].copy_from_slice(&headers);

    for section in &file.sections {
        if section.data.is_empty() {
            continue;
        }
        let start = section.header.offset as usize;
        image[start..start + section.data.len()].copy_from_slice(&section.data);
    }

    image
}

/// # Errors
/// Fails when the output path cannot be written.
pub fn write_rpl(output_path: &str, file: &ElfFile) -> Result<()> {
    let image = build_rpl_image(file);
    std::fs::write(output_path, image)
        .with_context(|| format!("failed to write {output_path}"))?;
    Ok(())
}
