use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use elf2rpl::cli::Args;
use elf2rpl::format::elf::{
    ElfFile, FileHeader, Rela, SectionHeader, ELFCLASS32, ELFDATA2MSB, ELF_MAGIC, EM_PPC,
    EV_CURRENT, FILE_HEADER_SIZE, SECTION_HEADER_SIZE, SHF_ALLOC, SHF_DEFLATED, SHF_EXECINSTR,
    SHT_PROGBITS, SHT_RELA, SHT_RPL_CRCS, SHT_RPL_FILEINFO, SHT_STRTAB, SHT_SYMTAB,
};

fn temp_dir() -> PathBuf {
    let uniq = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("elf2rpl-test-{uniq}"));
    fs::create_dir_all(&dir).expect("mkdir");
    dir
}

fn build_input_elf(shstrndx: u16, sections: &[(SectionHeader, Vec<u8>)]) -> Vec<u8> {
    let header = FileHeader {
        magic: ELF_MAGIC,
        class: ELFCLASS32,
        encoding: ELFDATA2MSB,
        elf_version: EV_CURRENT,
        elf_type: 2,
        machine: EM_PPC,
        version: 1,
        shoff: FILE_HEADER_SIZE as u32,
        ehsize: FILE_HEADER_SIZE as u16,
        shentsize: SECTION_HEADER_SIZE as u16,
        shnum: sections.len() as u16,
        shstrndx,
        ..FileHeader::default()
    };

    let data_start = FILE_HEADER_SIZE + sections.len() * SECTION_HEADER_SIZE;
    let mut headers = Vec::new();
    let mut payloads = Vec::new();
    for (section_header, data) in sections {
        let mut section_header = section_header.clone();
        if !data.is_empty() {
            section_header.offset = (data_start + payloads.len()) as u32;
            section_header.size = data.len() as u32;
            payloads.extend_from_slice(data);
        }
        section_header.emit(&mut headers);
    }

    let mut image = Vec::new();
    header.emit(&mut image);
    image.extend_from_slice(&headers);
    image.extend_from_slice(&payloads);
    image
}

fn convert(name: &str, input: &[u8]) -> Result<Vec<u8>, anyhow::Error> {
    let dir = temp_dir();
    let src = dir.join(format!("{name}.elf"));
    let dst = dir.join(format!("{name}.rpx"));
    fs::write(&src, input).expect("write input");

    let result = elf2rpl::run(Args {
        src: src.to_string_lossy().to_string(),
        dst: dst.to_string_lossy().to_string(),
        uncompressed_relocs: false,
        verbose: false,
    });

    let output = result.map(|()| fs::read(&dst).expect("read output"));
    let _ = fs::remove_file(&src);
    let _ = fs::remove_file(&dst);
    let _ = fs::remove_dir(&dir);
    output
}

fn crc_entry(data: &[u8], index: usize) -> u32 {
    u32::from_be_bytes([
        data[index * 4],
        data[index * 4 + 1],
        data[index * 4 + 2],
        data[index * 4 + 3],
    ])
}

fn fileinfo_field(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[test]
fn converts_minimal_elf() {
    let names = b"\0.shstrtab\0".to_vec();
    let input = build_input_elf(
        1,
        &[
            (SectionHeader::default(), Vec::new()),
            (
                SectionHeader {
                    name: 1,
                    sh_type: SHT_STRTAB,
                    addralign: 1,
                    ..SectionHeader::default()
                },
                names.clone(),
            ),
        ],
    );

    let output = convert("minimal", &input).expect("convert");
    let file = ElfFile::parse(&output).expect("parse output");

    assert_eq!(file.header.elf_type, 0xFE01);
    assert_eq!(file.header.abi, 0xCAFE);
    assert_eq!(file.header.shoff, 64);
    assert_eq!(file.header.shnum, 4);
    assert_eq!(file.header.shstrndx, 1);
    assert_eq!(file.header.phoff, 0);
    assert_eq!(file.header.phnum, 0);

    let types: Vec<u32> = file.sections.iter().map(|s| s.header.sh_type).collect();
    assert_eq!(
        types,
        vec![0, SHT_STRTAB, SHT_RPL_CRCS, SHT_RPL_FILEINFO]
    );

    // The name table moved into the load segment and became ALLOC.
    let shstrtab = &file.sections[1];
    assert_eq!(shstrtab.header.addr, 0xC000_0000);
    assert_ne!(shstrtab.header.flags & SHF_ALLOC, 0);
    assert_eq!(shstrtab.data, names);

    // One CRC per final section, with a zero in the table's own slot.
    let crcs = &file.sections[2];
    assert_eq!(crcs.data.len(), 16);
    assert_eq!(crcs.header.offset, 64 + 192);
    assert_eq!(crc_entry(&crcs.data, 0), 0);
    assert_eq!(crc_entry(&crcs.data, 1), crc32fast::hash(&names));
    assert_eq!(crc_entry(&crcs.data, 2), 0);
    let fileinfo = &file.sections[3];
    assert_eq!(crc_entry(&crcs.data, 3), crc32fast::hash(&fileinfo.data));

    // Segment sizes: nothing in text/data, the 11-byte name table in load.
    assert_eq!(fileinfo_field(&fileinfo.data, 4), 0);
    assert_eq!(fileinfo_field(&fileinfo.data, 12), 0);
    assert_eq!(fileinfo_field(&fileinfo.data, 20), 12);
    assert_eq!(fileinfo_field(&fileinfo.data, 28), 128);

    // Offsets run strictly increasing over the on-disk traversal.
    assert_eq!(fileinfo.header.offset, crcs.header.offset + 16);
    assert_eq!(
        shstrtab.header.offset,
        fileinfo.header.offset + fileinfo.data.len() as u32
    );
}

#[test]
fn converts_text_section_and_deflates_payload() {
    let names = b"\0.text\0.shstrtab\0".to_vec();
    let nops: Vec<u8> = std::iter::repeat([0x60, 0x00, 0x00, 0x00])
        .take(0x40)
        .flatten()
        .collect();
    let input = build_input_elf(
        2,
        &[
            (SectionHeader::default(), Vec::new()),
            (
                SectionHeader {
                    name: 1,
                    sh_type: SHT_PROGBITS,
                    flags: SHF_EXECINSTR,
                    addr: 0x0200_0000,
                    addralign: 32,
                    ..SectionHeader::default()
                },
                nops.clone(),
            ),
            (
                SectionHeader {
                    name: 7,
                    sh_type: SHT_STRTAB,
                    addralign: 1,
                    ..SectionHeader::default()
                },
                names,
            ),
        ],
    );

    let output = convert("text", &input).expect("convert");
    let file = ElfFile::parse(&output).expect("parse output");

    assert_eq!(file.sections[1].name, ".text");
    let text = &file.sections[1];
    assert_ne!(text.header.flags & SHF_DEFLATED, 0);

    let prefix = u32::from_be_bytes([
        text.data[0],
        text.data[1],
        text.data[2],
        text.data[3],
    ]);
    assert_eq!(prefix, 0x100);
    let mut inflated = Vec::new();
    flate2::read::ZlibDecoder::new(&text.data[4..])
        .read_to_end(&mut inflated)
        .expect("inflate");
    assert_eq!(inflated, nops);

    // The CRC covers the uncompressed payload.
    let crcs = &file.sections[file.sections.len() - 2];
    assert_eq!(crcs.header.sh_type, SHT_RPL_CRCS);
    assert_eq!(crc_entry(&crcs.data, 1), crc32fast::hash(&nops));

    let fileinfo = file.sections.last().expect("fileinfo");
    assert_eq!(fileinfo_field(&fileinfo.data, 4), 0x100);
}

#[test]
fn splits_rel32_relocations_end_to_end() {
    let names = b"\0.text\0.rela.text\0.symtab\0.shstrtab\0".to_vec();
    let nops = vec![0x60u8; 0x20];
    let mut rela_data = vec![0u8; 12];
    Rela {
        offset: 0x0200_0010,
        info: (1 << 8) | 26,
        addend: 0,
    }
    .emit(&mut rela_data);

    let input = build_input_elf(
        4,
        &[
            (SectionHeader::default(), Vec::new()),
            (
                SectionHeader {
                    name: 1,
                    sh_type: SHT_PROGBITS,
                    flags: SHF_EXECINSTR,
                    addr: 0x0200_0000,
                    ..SectionHeader::default()
                },
                nops,
            ),
            (
                SectionHeader {
                    name: 7,
                    sh_type: SHT_RELA,
                    link: 3,
                    info: 1,
                    entsize: 12,
                    ..SectionHeader::default()
                },
                rela_data,
            ),
            (
                SectionHeader {
                    name: 18,
                    sh_type: SHT_SYMTAB,
                    link: 4,
                    entsize: 16,
                    ..SectionHeader::default()
                },
                vec![0u8; 2 * 16],
            ),
            (
                SectionHeader {
                    name: 26,
                    sh_type: SHT_STRTAB,
                    addralign: 1,
                    ..SectionHeader::default()
                },
                names,
            ),
        ],
    );

    let output = convert("rel32", &input).expect("convert");
    let file = ElfFile::parse(&output).expect("parse output");

    let rela = file
        .sections
        .iter()
        .find(|s| s.name == ".rela.text")
        .expect("rela section");
    assert_eq!(rela.header.flags & !SHF_DEFLATED, 0);

    let mut records = rela.data.clone();
    if rela.header.flags & SHF_DEFLATED != 0 {
        let mut inflated = Vec::new();
        flate2::read::ZlibDecoder::new(&records[4..])
            .read_to_end(&mut inflated)
            .expect("inflate");
        records = inflated;
    }
    assert_eq!(records.len(), 24);

    let hi = Rela::parse(&records[..12]);
    assert_eq!(hi.offset, 0x0200_0010);
    assert_eq!(hi.info, (1 << 8) | 252);
    assert_eq!(hi.addend, 0);
    let lo = Rela::parse(&records[12..]);
    assert_eq!(lo.offset, 0x0200_0012);
    assert_eq!(lo.info, (1 << 8) | 253);
    assert_eq!(lo.addend, 2);
}

#[test]
fn fails_on_unsupported_relocation() {
    let names = b"\0.text\0.rela.text\0.symtab\0.shstrtab\0".to_vec();
    let mut rela_data = vec![0u8; 12];
    Rela {
        offset: 0x0200_0000,
        info: (1 << 8) | 2,
        addend: 0,
    }
    .emit(&mut rela_data);

    let input = build_input_elf(
        4,
        &[
            (SectionHeader::default(), Vec::new()),
            (
                SectionHeader {
                    name: 1,
                    sh_type: SHT_PROGBITS,
                    flags: SHF_EXECINSTR,
                    addr: 0x0200_0000,
                    ..SectionHeader::default()
                },
                vec![0x60u8; 0x10],
            ),
            (
                SectionHeader {
                    name: 7,
                    sh_type: SHT_RELA,
                    link: 3,
                    info: 1,
                    entsize: 12,
                    ..SectionHeader::default()
                },
                rela_data,
            ),
            (
                SectionHeader {
                    name: 18,
                    sh_type: SHT_SYMTAB,
                    link: 4,
                    entsize: 16,
                    ..SectionHeader::default()
                },
                vec![0u8; 2 * 16],
            ),
            (
                SectionHeader {
                    name: 26,
                    sh_type: SHT_STRTAB,
                    addralign: 1,
                    ..SectionHeader::default()
                },
                names,
            ),
        ],
    );

    let err = convert("bad-reloc", &input).expect_err("must fail");
    assert!(err.to_string().contains("R_PPC_ADDR24"));
}

#[test]
fn rejects_non_powerpc_input() {
    let names = b"\0.shstrtab\0".to_vec();
    let mut input = build_input_elf(
        1,
        &[
            (SectionHeader::default(), Vec::new()),
            (
                SectionHeader {
                    name: 1,
                    sh_type: SHT_STRTAB,
                    addralign: 1,
                    ..SectionHeader::default()
                },
                names,
            ),
        ],
    );
    // Patch e_machine to x86.
    input[18] = 0;
    input[19] = 3;

    let err = convert("wrong-machine", &input).expect_err("must fail");
    assert!(err.to_string().contains("machine"));
}
