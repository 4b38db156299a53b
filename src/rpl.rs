use crate::format::elf::{
    ElfFile, Section, SectionHeader, EABI_CAFE, ELFCLASS32, ELFDATA2MSB, ELF_MAGIC, EM_PPC,
    ET_RPL, EV_CURRENT, FILE_HEADER_SIZE, SECTION_HEADER_SIZE, SHT_NOBITS, SHT_RPL_CRCS,
    SHT_RPL_FILEINFO,
};
use crate::layout::align_up;

pub const CODE_BASE_ADDRESS: u32 = 0x0200_0000;
pub const DATA_BASE_ADDRESS: u32 = 0x1000_0000;
pub const LOAD_BASE_ADDRESS: u32 = 0xC000_0000;

pub const RPL_IS_RPX: u32 = 0x2;

pub const FILE_INFO_SIZE: usize = 0x60;

/// The loader-consumed metadata record announcing aggregate segment sizes,
/// stack and heap defaults, and the SDK version the image was built with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RplFileInfo {
    pub version: u32,
    pub text_size: u32,
    pub text_align: u32,
    pub data_size: u32,
    pub data_align: u32,
    pub load_size: u32,
    pub load_align: u32,
    pub temp_size: u32,
    pub tramp_adjust: u32,
    pub tramp_addition: u32,
    pub sda_base: u32,
    pub sda2_base: u32,
    pub stack_size: u32,
    pub heap_size: u32,
    pub filename: u32,
    pub flags: u32,
    pub min_version: u32,
    pub compression_level: i32,
    pub file_info_pad: u32,
    pub cafe_sdk_version: u32,
    pub cafe_sdk_revision: u32,
    pub tls_align_shift: u16,
    pub tls_module_index: u16,
    pub runtime_file_info_size: u32,
    pub tag_offset: u32,
}

impl RplFileInfo {
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: 0xCAFE_0402,
            text_size: 0,
            text_align: 32,
            data_size: 0,
            data_align: 4096,
            load_size: 0,
            load_align: 4,
            temp_size: 0,
            tramp_adjust: 0,
            tramp_addition: 0,
            sda_base: 0,
            sda2_base: 0,
            stack_size: 0x10000,
            heap_size: 0x8000,
            filename: 0,
            flags: RPL_IS_RPX,
            min_version: 0x5078,
            compression_level: -1,
            file_info_pad: 0,
            cafe_sdk_version: 0x51BA,
            cafe_sdk_revision: 0xCCD1,
            tls_align_shift: 0,
            tls_module_index: 0,
            runtime_file_info_size: 0,
            tag_offset: 0,
        }
    }

    pub fn emit(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.text_size.to_be_bytes());
        out.extend_from_slice(&self.text_align.to_be_bytes());
        out.extend_from_slice(&self.data_size.to_be_bytes());
        out.extend_from_slice(&self.data_align.to_be_bytes());
        out.extend_from_slice(&self.load_size.to_be_bytes());
        out.extend_from_slice(&self.load_align.to_be_bytes());
        out.extend_from_slice(&self.temp_size.to_be_bytes());
        out.extend_from_slice(&self.tramp_adjust.to_be_bytes());
        out.extend_from_slice(&self.tramp_addition.to_be_bytes());
        out.extend_from_slice(&self.sda_base.to_be_bytes());
        out.extend_from_slice(&self.sda2_base.to_be_bytes());
        out.extend_from_slice(&self.stack_size.to_be_bytes());
        out.extend_from_slice(&self.heap_size.to_be_bytes());
        out.extend_from_slice(&self.filename.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        out.extend_from_slice(&self.min_version.to_be_bytes());
        out.extend_from_slice(&self.compression_level.to_be_bytes());
        out.extend_from_slice(&self.file_info_pad.to_be_bytes());
        out.extend_from_slice(&self.cafe_sdk_version.to_be_bytes());
        out.extend_from_slice(&self.cafe_sdk_revision.to_be_bytes());
        out.extend_from_slice(&self.tls_align_shift.to_be_bytes());
        out.extend_from_slice(&self.tls_module_index.to_be_bytes());
        out.extend_from_slice(&self.runtime_file_info_size.to_be_bytes());
        out.extend_from_slice(&self.tag_offset.to_be_bytes());
    }
}

impl Default for RplFileInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the FILEINFO record from the section table and appends it as the
/// last section.
///
/// Segment sizes are running maxima of `addr + declared size` over the
/// three address bases, rounded up to the segment alignments afterwards.
/// Sections still at address 0 (and not RPL metadata) are loaded into
/// temporary storage by the loader and each contribute their size plus 128
/// bytes of headroom to `tempSize`.
pub fn append_file_info(file: &mut ElfFile) -> RplFileInfo {
    let mut info = RplFileInfo::new();

    for section in &file.sections {
        let payload_size = if section.header.sh_type == SHT_NOBITS {
            section.header.size
        } else {
            section.data.len() as u32
        };
        let addr = section.header.addr;

        if (CODE_BASE_ADDRESS..DATA_BASE_ADDRESS).contains(&addr) {
            let end = addr.saturating_add(section.header.size) - CODE_BASE_ADDRESS;
            info.text_size = info.text_size.max(end);
        } else if (DATA_BASE_ADDRESS..LOAD_BASE_ADDRESS).contains(&addr) {
            let end = addr.saturating_add(section.header.size) - DATA_BASE_ADDRESS;
            info.data_size = info.data_size.max(end);
        } else if addr >= LOAD_BASE_ADDRESS {
            let end = addr.saturating_add(section.header.size) - LOAD_BASE_ADDRESS;
            info.load_size = info.load_size.max(end);
        } else if addr == 0
            && section.header.sh_type != SHT_RPL_CRCS
            && section.header.sh_type != SHT_RPL_FILEINFO
        {
            info.temp_size = info.temp_size.saturating_add(payload_size + 128);
        }
    }

    info.text_size = align_up(info.text_size, info.text_align);
    info.data_size = align_up(info.data_size, info.data_align);
    info.load_size = align_up(info.load_size, info.load_align);

    let mut data = Vec::with_capacity(FILE_INFO_SIZE);
    info.emit(&mut data);
    file.sections.push(Section {
        header: SectionHeader {
            sh_type: SHT_RPL_FILEINFO,
            addralign: 4,
            ..SectionHeader::default()
        },
        name: String::new(),
        data,
    });
    info
}

/// Builds the per-section CRC table and inserts it immediately before the
/// FILEINFO section.
///
/// One big-endian CRC-32 per section in final index order; empty payloads
/// hash to 0. The extra zero entry inserted at the penultimate slot becomes
/// the table's own entry once the section lands there.
pub fn insert_crc_table(file: &mut ElfFile) {
    let mut crcs: Vec<u32> = file
        .sections
        .iter()
        .map(|section| {
            if section.data.is_empty() {
                0
            } else {
                crc32fast::hash(&section.data)
            }
        })
        .collect();
    crcs.insert(crcs.len() - 1, 0);

    let mut data = Vec::with_capacity(crcs.len() * 4);
    for crc in crcs {
        data.extend_from_slice(&crc.to_be_bytes());
    }

    let at = file.sections.len() - 1;
    file.sections.insert(
        at,
        Section {
            header: SectionHeader {
                sh_type: SHT_RPL_CRCS,
                addralign: 4,
                entsize: 4,
                ..SectionHeader::default()
            },
            name: String::new(),
            data,
        },
    );
}

/// Rewrites the file header into its final RPL form. The entry point is the
/// one field the linker already got right, so it is left alone.
pub fn finalize_header(file: &mut ElfFile) {
    let shnum = file.sections.len() as u16;
    let shstrndx = file
        .section_index(".shstrtab")
        .map_or(u16::MAX, |index| index as u16);

    let header = &mut file.header;
    header.magic = ELF_MAGIC;
    header.class = ELFCLASS32;
    header.encoding = ELFDATA2MSB;
    header.elf_version = EV_CURRENT;
    header.abi = EABI_CAFE;
    header.pad = [0; 7];
    header.elf_type = ET_RPL;
    header.machine = EM_PPC;
    header.version = 1;
    header.flags = 0;
    header.phoff = 0;
    header.phentsize = 0;
    header.phnum = 0;
    header.shoff = align_up(FILE_HEADER_SIZE as u32, 64);
    header.shnum = shnum;
    header.shentsize = SECTION_HEADER_SIZE as u16;
    header.ehsize = FILE_HEADER_SIZE as u16;
    header.shstrndx = shstrndx;
}
