use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("invalid ELF magic")]
    InvalidMagic,
    #[error("unsupported ELF class {0}, expected ELFCLASS32")]
    UnsupportedClass(u8),
    #[error("unsupported ELF encoding {0}, expected big endian")]
    UnsupportedEncoding(u8),
    #[error("unsupported ELF machine {0:#06x}, expected PowerPC")]
    UnsupportedMachine(u16),
    #[error("unsupported ELF version {0}, expected version 1")]
    UnsupportedVersion(u8),
    #[error("section name table index {0} is out of range")]
    BadStringTableIndex(u16),
    #[error("unexpected end of file while reading ELF image")]
    UnexpectedEof,
    #[error("unterminated section name string")]
    UnterminatedString,
}

pub mod elf;
