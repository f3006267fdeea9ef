use clap::Parser;
use dmri_prep::config::{PipelineArgs, PipelineConfig};
use dmri_prep::logging::{init_logging, PipelineLog};
use dmri_prep::pipeline::{run, Tools};

fn main() -> dmri_prep::Result<()> {
    let args = PipelineArgs::parse();
    let _logger = init_logging(args.log_level, args.log_dir.as_deref())?;
    let log = PipelineLog::new(args.log_level);

    let config = PipelineConfig::load(&args.config)?;
    let report = run(&config, &Tools::from_config(&config), &log)?;

    println!("reference subject: {} (scale {})", report.reference, report.scale);
    println!(
        "{} subjects enumerated, {} appended, {} already archived, {} skipped",
        report.enumerated, report.appended.len(), report.already_archived.len(), report.skipped.len()
    );
    for skipped in &report.skipped {
        println!("  skipped {}: {}", skipped.name, skipped.reason);
    }
    println!("archive written to {}", config.archive.display());
    Ok(())
}
