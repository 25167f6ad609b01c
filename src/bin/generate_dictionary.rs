//! Count codes in every source table and write the merged code dictionary.
use clap::Parser;
use mimic_prep::{dictionary::FrequencyStats, pipeline, CodeType, Settings};
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
    let dictionary = pipeline::run_dictionary(&settings)?;

    let rows = CodeType::ALL
        .into_iter()
        .filter_map(|ty| {
            FrequencyStats::of(
                ty.as_str(),
                dictionary
                    .iter()
                    .filter(|e| e.code_type == ty)
                    .map(|e| e.total_frequency),
            )
        })
        .collect::<Vec<_>>();
    println!("{}", mimic_prep::dictionary::stats_table(&rows).for_terminal());
    Ok(())
}
