use clap::Parser;

use leaflens::cli::ConvertCommand;
use leaflens::{export, ConvertArgs};

fn main() -> anyhow::Result<()> {
    leaflens::logging::init()?;
    let args = ConvertArgs::parse();

    match args.command {
        ConvertCommand::Export(args) => export::export(&args)?,
        ConvertCommand::Quantize(args) => {
            for path in export::quantize(&args)? {
                tracing::info!("Saved {}", path.display());
            }
        }
        ConvertCommand::Tfjs(args) => export::tfjs(&args)?,
    }
    Ok(())
}
