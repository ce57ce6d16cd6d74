use packmap::cli::PackmapCli;
use packmap::error::Result;

fn main() {
    if let Err(e) = real_main() {
        eprintln!("packmap error: {:#}", e);
        std::process::exit(1);
    }
}

fn real_main() -> Result<()> {
    let cli = PackmapCli::parse();
    cli.run()
}
