use clap::Parser;
use dmri_prep::logging::{init_logging, PipelineLog};
use dmri_prep::scheme::{aggregate, Scheme};
use std::path::PathBuf;

/// Averages co-registered gradient schemes into one canonical scheme.
#[derive(Debug, Parser)]
struct Args {
    /// scheme text files, one per subject
    #[arg(required = true)]
    schemes: Vec<PathBuf>,
    /// output base name. `.txt` and `.hdf5` files are written next to it
    #[arg(short, long, default_value = "scheme")]
    output: PathBuf,
    /// read FSL bvals/bvecs pairs instead: each input is a prefix with `.bval` and `.bvec` files
    #[arg(long)]
    fsl: bool,
    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,
}

fn main() -> dmri_prep::Result<()> {
    let args = Args::parse();
    let _logger = init_logging(args.log_level, None)?;
    let log = PipelineLog::new(args.log_level).stage("scheme");

    let schemes = args.schemes.iter().map(|p| {
        if args.fsl {
            Scheme::from_fsl(p.with_extension("bval"), p.with_extension("bvec"))
        } else {
            Scheme::read_text(p)
        }
    }).collect::<dmri_prep::Result<Vec<_>>>()?;
    let scheme = aggregate(&schemes)?;

    let text = args.output.with_extension("txt");
    let archive = args.output.with_extension("hdf5");
    scheme.write_text(&text)?;
    scheme.write_archive(&archive)?;
    log.info(format_args!(
        "event=scheme_written inputs={} measurements={} shells={} text={} archive={}",
        schemes.len(), scheme.n_measurements(), scheme.shells().len(), text.display(), archive.display()
    ));
    println!("wrote {} and {}", text.display(), archive.display());
    Ok(())
}
