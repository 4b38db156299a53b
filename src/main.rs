use clap::Parser;

fn main() {
    let args = elf2rpl::cli::Args::parse();
    if let Err(err) = elf2rpl::run(args) {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
