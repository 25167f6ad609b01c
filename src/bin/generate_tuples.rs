//! Turn the source tables into `tuples.csv` and `string_tuples.csv`, using an existing dictionary.
use clap::Parser;
use mimic_prep::{pipeline, Settings};
use qu::ick_use::*;
use std::path::PathBuf;

#[derive(Parser)]
struct Opt {
    /// A toml settings file.
    #[clap(short, long)]
    config: Option<PathBuf>,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let settings = match &opt.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    pipeline::run_tuples(&settings)
}
