use clap::Parser;
use mimic_prep::{pipeline, post_process::PostProcessOptions, Settings};
use qu::ick_use::*;
use std::path::PathBuf;

#[derive(Parser)]
struct Opt {
    /// A toml settings file.
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Add `label` and `description` columns to the revised dictionary
    #[clap(long)]
    add_label: bool,
    /// Also write `code_dict_cat.csv`
    #[clap(long)]
    add_category: bool,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let settings = match &opt.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    pipeline::run_post_process(
        &settings,
        PostProcessOptions {
            add_label: opt.add_label,
            add_category: opt.add_category,
        },
    )
}
