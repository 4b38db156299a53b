use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "elf2rpl", version)]
pub struct Args {
    #[arg(value_name = "SRC_ELF")]
    pub src: String,

    #[arg(value_name = "DST_RPL")]
    pub dst: String,

    #[arg(long = "uncompressed-relocs")]
    pub uncompressed_relocs: bool,

    #[arg(long = "verbose", short = 'v')]
    pub verbose: bool,
}
