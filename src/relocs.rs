use std::collections::BTreeSet;

use anyhow::bail;

use crate::format::elf::{ElfFile, Rela, RELA_SIZE, SHT_RELA, SYMBOL_SIZE};

pub const R_PPC_NONE: u8 = 0;
pub const R_PPC_ADDR32: u8 = 1;
pub const R_PPC_ADDR24: u8 = 2;
pub const R_PPC_ADDR16: u8 = 3;
pub const R_PPC_ADDR16_LO: u8 = 4;
pub const R_PPC_ADDR16_HI: u8 = 5;
pub const R_PPC_ADDR16_HA: u8 = 6;
pub const R_PPC_ADDR14: u8 = 7;
pub const R_PPC_ADDR14_BRTAKEN: u8 = 8;
pub const R_PPC_ADDR14_BRNTAKEN: u8 = 9;
pub const R_PPC_REL24: u8 = 10;
pub const R_PPC_REL14: u8 = 11;
pub const R_PPC_REL14_BRTAKEN: u8 = 12;
pub const R_PPC_REL14_BRNTAKEN: u8 = 13;
pub const R_PPC_REL32: u8 = 26;
pub const R_PPC_DTPMOD32: u8 = 68;
pub const R_PPC_DTPREL32: u8 = 78;
pub const R_PPC_EMB_SDA21: u8 = 109;
pub const R_PPC_EMB_RELSDA: u8 = 116;
pub const R_PPC_DIAB_SDA21_LO: u8 = 180;
pub const R_PPC_DIAB_SDA21_HI: u8 = 181;
pub const R_PPC_DIAB_SDA21_HA: u8 = 182;
pub const R_PPC_DIAB_RELSDA_LO: u8 = 183;
pub const R_PPC_DIAB_RELSDA_HI: u8 = 184;
pub const R_PPC_DIAB_RELSDA_HA: u8 = 185;
pub const R_PPC_GHS_REL16_HA: u8 = 251;
pub const R_PPC_GHS_REL16_HI: u8 = 252;
pub const R_PPC_GHS_REL16_LO: u8 = 253;

/// Rewrites relocations the loader cannot process.
///
/// Every RELA section has its header flags cleared. `R_PPC_REL32` records
/// are split into a `R_PPC_GHS_REL16_HI` rewritten in place plus a
/// `R_PPC_GHS_REL16_LO` at offset+2/addend+2 appended after the section's
/// existing records. Types the loader handles natively pass through
/// untouched.
///
/// # Errors
/// Fails when a `R_PPC_REL32` names a symbol past the end of the linked
/// symbol table, or when any record carries a type with no loader support.
/// Unsupported types are reported once each.
pub fn lower_relocations(file: &mut ElfFile) -> anyhow::Result<()> {
    let mut errors = Vec::<String>::new();
    let mut unsupported = BTreeSet::<u8>::new();

    for index in 0..file.sections.len() {
        if file.sections[index].header.sh_type != SHT_RELA {
            continue;
        }
        file.sections[index].header.flags = 0;

        let link = file.sections[index].header.link as usize;
        let symbol_count = file
            .sections
            .get(link)
            .map_or(0, |s| s.data.len() / SYMBOL_SIZE);

        let section = &mut file.sections[index];
        let mut appended = Vec::<u8>::new();
        for record in section.data.chunks_exact_mut(RELA_SIZE) {
            let rela = Rela::parse(record);
            let sym_index = rela.sym_index();
            match rela.rel_type() {
                R_PPC_NONE | R_PPC_ADDR32 | R_PPC_ADDR16_LO | R_PPC_ADDR16_HI
                | R_PPC_ADDR16_HA | R_PPC_REL24 | R_PPC_REL14 | R_PPC_DTPMOD32
                | R_PPC_DTPREL32 | R_PPC_EMB_SDA21 | R_PPC_EMB_RELSDA | R_PPC_DIAB_SDA21_LO
                | R_PPC_DIAB_SDA21_HI | R_PPC_DIAB_SDA21_HA | R_PPC_DIAB_RELSDA_LO
                | R_PPC_DIAB_RELSDA_HI | R_PPC_DIAB_RELSDA_HA => {}

                R_PPC_REL32 => {
                    if sym_index as usize >= symbol_count {
                        errors.push(format!(
                            "no symbol {sym_index} in {} for lowering a R_PPC_REL32 relocation",
                            section.name
                        ));
                        continue;
                    }
                    Rela {
                        offset: rela.offset,
                        info: (sym_index << 8) | u32::from(R_PPC_GHS_REL16_HI),
                        addend: rela.addend,
                    }
                    .emit(record);

                    let lo = Rela {
                        offset: rela.offset.wrapping_add(2),
                        info: (sym_index << 8) | u32::from(R_PPC_GHS_REL16_LO),
                        addend: rela.addend.wrapping_add(2),
                    };
                    let mut encoded = [0u8; RELA_SIZE];
                    lo.emit(&mut encoded);
                    appended.extend_from_slice(&encoded);
                }

                other => {
                    if unsupported.insert(other) {
                        errors.push(format!(
                            "unsupported relocation type: {}",
                            relocation_name(other)
                        ));
                    }
                }
            }
        }
        section.data.extend_from_slice(&appended);
    }

    if !errors.is_empty() {
        bail!("{}", errors.join("\n"));
    }
    Ok(())
}

fn relocation_name(rel_type: u8) -> String {
    let name = match rel_type {
        R_PPC_ADDR24 => "R_PPC_ADDR24",
        R_PPC_ADDR16 => "R_PPC_ADDR16",
        R_PPC_ADDR14 => "R_PPC_ADDR14",
        R_PPC_ADDR14_BRTAKEN => "R_PPC_ADDR14_BRTAKEN",
        R_PPC_ADDR14_BRNTAKEN => "R_PPC_ADDR14_BRNTAKEN",
        R_PPC_REL14_BRTAKEN => "R_PPC_REL14_BRTAKEN",
        R_PPC_REL14_BRNTAKEN => "R_PPC_REL14_BRNTAKEN",
        14 => "R_PPC_GOT16",
        15 => "R_PPC_GOT16_LO",
        16 => "R_PPC_GOT16_HI",
        17 => "R_PPC_GOT16_HA",
        18 => "R_PPC_PLTREL24",
        23 => "R_PPC_LOCAL24PC",
        24 => "R_PPC_UADDR32",
        25 => "R_PPC_UADDR16",
        R_PPC_GHS_REL16_HA => "R_PPC_GHS_REL16_HA",
        _ => return format!("{rel_type}"),
    };
    name.to_string()
}
