//! Run the whole preparation pipeline: dictionary, tuples, then post processing.
use clap::Parser;
use mimic_prep::{
    header,
    pipeline,
    post_process::PostProcessOptions,
    Settings,
};
use qu::ick_use::*;
use std::path::PathBuf;

#[derive(Parser)]
struct Opt {
    /// A toml settings file. Defaults are used for anything it leaves out.
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Add `label` and `description` columns to the revised dictionary
    #[clap(long)]
    add_label: bool,
    /// Also write `code_dict_cat.csv` with a `category` column
    #[clap(long)]
    add_category: bool,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let settings = match &opt.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    header("MIMIC-IV preparation");
    pipeline::run(
        &settings,
        PostProcessOptions {
            add_label: opt.add_label,
            add_category: opt.add_category,
        },
    )?;
    println!(
        "dictionary:  {}\ntuples:      {}\npatients:    {}",
        settings.revised_dict_path().display(),
        settings.tuples_path().display(),
        settings.patients_dict_path().display()
    );
    Ok(())
}
