use clap::Parser;
use journal_datasets::{pipeline, Config};
use qu::ick_use::*;
use std::path::PathBuf;

/// Generate the code history datasets from a journal export.
#[derive(Parser)]
struct Opt {
    /// Directory containing `journal.sql`, `patient.sql` and optionally `indicators.sql`.
    input: PathBuf,
    /// Where to write the datasets.
    #[clap(long, short, default_value = "datasets")]
    output: PathBuf,
    /// A `.json` or `.toml` configuration file. Without one, everything is kept.
    #[clap(long, short)]
    config: Option<PathBuf>,
    #[clap(long)]
    overwrite: bool,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let config = match &opt.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    // Check before touching the output directory.
    config.validate()?;
    pipeline::prepare_output_dir(&opt.output, opt.overwrite)?;

    let stats = pipeline::generate(&opt.input, &opt.output, &config)?;
    print!("{}", stats);
    Ok(())
}
