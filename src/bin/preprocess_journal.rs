use clap::Parser;
use journal_datasets::pipeline;
use qu::ick_use::*;
use std::path::PathBuf;

/// Write a cleaned, tab-separated copy of a journal export.
#[derive(Parser)]
struct Opt {
    /// Directory containing `journal.sql` and `patient.sql`.
    input: PathBuf,
    #[clap(long, short, default_value = "processed")]
    output: PathBuf,
    #[clap(long)]
    overwrite: bool,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    pipeline::prepare_output_dir(&opt.output, opt.overwrite)?;
    let stats = pipeline::preprocess(&opt.input, &opt.output)?;
    print!("{}", stats);
    Ok(())
}
