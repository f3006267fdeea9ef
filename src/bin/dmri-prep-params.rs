use clap::Parser;
use dmri_prep::config::PipelineConfig;
use std::path::PathBuf;

#[derive(Debug, Parser)]
struct Args {
    /// path to pipeline parameters file to write
    parameter_file: PathBuf,
}

fn main() -> dmri_prep::Result<()> {
    let args = Args::parse();
    let filename = PipelineConfig::default().save(&args.parameter_file)?;
    println!("wrote default parameter file to {}", filename.display());
    Ok(())
}
