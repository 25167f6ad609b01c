//! Running the stages in order.
use crate::{
    dictionary::generate_dictionary,
    post_process::{post_process, PostProcessOptions},
    tuples::generate_tuples,
    Dictionary, Result, Settings,
};
use qu::ick_use::*;
use std::time::Instant;

/// Which stage to run.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Stage {
    Dictionary,
    Tuples,
    PostProcess,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Dictionary => "dictionary generation",
            Stage::Tuples => "tuple generation",
            Stage::PostProcess => "post processing",
        }
    }
}

fn timed<T>(stage: Stage, f: impl FnOnce() -> Result<T>) -> Result<T> {
    event!(Level::INFO, "starting {}", stage.name());
    let start = Instant::now();
    let out = f().with_context(|| format!("in {}", stage.name()))?;
    event!(
        Level::INFO,
        "finished {} in {:.1}s",
        stage.name(),
        start.elapsed().as_secs_f64()
    );
    Ok(out)
}

/// Validate inputs and create the output tree. Every stage entry point calls this.
pub fn prepare(settings: &Settings) -> Result {
    settings.check()?;
    settings.create_output_dirs()
}

/// Run the dictionary stage on its own.
pub fn run_dictionary(settings: &Settings) -> Result<Dictionary> {
    prepare(settings)?;
    timed(Stage::Dictionary, || generate_dictionary(settings))
}

/// Run the tuple stage on its own, using the dictionary written by an earlier run.
pub fn run_tuples(settings: &Settings) -> Result {
    prepare(settings)?;
    let dictionary = Dictionary::load(settings.code_dict_path())?;
    timed(Stage::Tuples, || generate_tuples(settings, &dictionary))?;
    Ok(())
}

/// Run post processing on its own, using the outputs of an earlier run.
pub fn run_post_process(settings: &Settings, options: PostProcessOptions) -> Result {
    prepare(settings)?;
    timed(Stage::PostProcess, || post_process(settings, options))
}

/// Run every stage, strictly one after the other.
pub fn run(settings: &Settings, options: PostProcessOptions) -> Result {
    prepare(settings)?;
    let dictionary = timed(Stage::Dictionary, || generate_dictionary(settings))?;
    let skipped = timed(Stage::Tuples, || generate_tuples(settings, &dictionary))?;
    if skipped.total() > 0 {
        event!(Level::INFO, "{} source records were not turned into tuples", skipped.total());
    }
    timed(Stage::PostProcess, || post_process(settings, options))?;
    event!(
        Level::INFO,
        "outputs written to \"{}\"",
        settings.result_dir.display()
    );
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::PrepError;

    #[test]
    fn missing_input_fails_before_any_output() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::rooted_at(dir.path());
        let err = run(&settings, PostProcessOptions::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PrepError>(),
            Some(PrepError::Configuration { .. })
        ));
        assert!(!settings.result_dir.exists());
    }
}
