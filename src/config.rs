//! Where the inputs live, where outputs go, and the knobs that bound memory.
use crate::{require_path, util, PrepError, Result};
use qu::ick_use::*;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Run settings, usually loaded from a toml file. Every field has a default.
///
/// ```toml
/// raw_dir = "Raw_MIMIC-IV"
/// result_dir = "Cleaned_MIMIC-IV"
/// chunk_size = 5000000
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// The raw extract, with `core/`, `hosp/` and `icu/` subdirectories.
    pub raw_dir: PathBuf,
    /// Roll-up tables (`<from>2<to>_rollup.csv`).
    pub rollup_dir: PathBuf,
    /// Unit-of-measurement dependency files (`<table>_uom_dict.json`).
    pub uom_dir: PathBuf,
    /// All outputs go under here.
    pub result_dir: PathBuf,
    /// Label and category reference files. Only needed for `--add-label`/`--add-category`.
    pub reference_dir: PathBuf,
    /// Records per streamed chunk. Only affects memory use, never the output.
    pub chunk_size: usize,
    /// Patients read from each intermediate file per merge step.
    pub merge_batch: usize,
    /// Codes seen fewer times than this are left out of the dictionary.
    pub min_frequency: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            raw_dir: "Raw_MIMIC-IV".into(),
            rollup_dir: "rollup_tables".into(),
            uom_dir: "uom_dependency".into(),
            result_dir: "Cleaned_MIMIC-IV".into(),
            reference_dir: "reference".into(),
            chunk_size: 20_000_000,
            merge_batch: 10_000,
            min_frequency: 1000,
        }
    }
}

impl Settings {
    /// Load settings from a toml file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        fn inner(path: &Path) -> Result<Settings> {
            let raw = fs::read_to_string(path)?;
            let settings: Settings = toml::from_str(&raw)?;
            ensure!(settings.chunk_size > 0, "chunk_size must be positive");
            ensure!(settings.merge_batch > 0, "merge_batch must be positive");
            Ok(settings)
        }
        let path = path.as_ref();
        inner(path).with_context(|| format!("loading settings from \"{}\"", path.display()))
    }

    /// Settings rooted at a single directory, laid out as the defaults are.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let defaults = Self::default();
        Self {
            raw_dir: root.join(defaults.raw_dir),
            rollup_dir: root.join(defaults.rollup_dir),
            uom_dir: root.join(defaults.uom_dir),
            result_dir: root.join(defaults.result_dir),
            reference_dir: root.join(defaults.reference_dir),
            ..defaults
        }
    }

    /// Check that every required input exists before any stage starts.
    pub fn check(&self) -> Result {
        for dir in [&self.raw_dir, &self.rollup_dir, &self.uom_dir] {
            require_path(dir)?;
        }
        require_path(&self.patients_path())?;
        Ok(())
    }

    /// Create the output tree. Safe to call on an existing tree.
    pub fn create_output_dirs(&self) -> Result {
        for dir in [
            self.result_dir.clone(),
            self.tuple_dir(),
            self.string_tuple_dir(),
            self.index_dir(),
        ] {
            fs::create_dir_all(&dir).with_context(|| format!("creating \"{}\"", dir.display()))?;
        }
        Ok(())
    }

    pub fn tuple_dir(&self) -> PathBuf {
        self.result_dir.join("tuple")
    }

    pub fn string_tuple_dir(&self) -> PathBuf {
        self.result_dir.join("string_tuple")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.result_dir.join("index")
    }

    /// The merged dictionary, before frequency revision.
    pub fn code_dict_path(&self) -> PathBuf {
        self.index_dir().join("code_dict.csv")
    }

    pub fn tuples_path(&self) -> PathBuf {
        self.result_dir.join("tuples.csv")
    }

    pub fn string_tuples_path(&self) -> PathBuf {
        self.result_dir.join("string_tuples.csv")
    }

    pub fn patients_dict_path(&self) -> PathBuf {
        self.result_dir.join("patients_dict.csv")
    }

    /// The dictionary with frequencies recounted from `tuples.csv`.
    pub fn revised_dict_path(&self) -> PathBuf {
        self.result_dir.join("code_dict.csv")
    }

    pub fn category_dict_path(&self) -> PathBuf {
        self.result_dir.join("code_dict_cat.csv")
    }

    /// A table in the raw extract, e.g. `raw("hosp", "labevents")`.
    pub fn raw(&self, dir: &str, table: &str) -> PathBuf {
        self.raw_dir.join(dir).join(format!("{}.csv", table))
    }

    pub fn patients_path(&self) -> PathBuf {
        self.raw("core", "patients")
    }

    pub fn rollup_path(&self, name: &str) -> PathBuf {
        self.rollup_dir.join(format!("{}_rollup.csv", name))
    }

    /// The unit dependency file for a value table. Missing is a reference data error.
    pub fn uom_path(&self, table: &str) -> Result<PathBuf> {
        let path = self.uom_dir.join(format!("{}_uom_dict.json", table));
        if util::path_exists(&path)? {
            Ok(path)
        } else {
            Err(PrepError::MissingReference { path }.into())
        }
    }

    pub fn fragment_path(&self, table: &str) -> PathBuf {
        self.index_dir().join(format!("{}_dict.dict", table))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "raw_dir = \"/data/mimic\"\nchunk_size = 5\n").unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.raw_dir, Path::new("/data/mimic"));
        assert_eq!(settings.chunk_size, 5);
        assert_eq!(settings.merge_batch, 10_000);
        assert_eq!(settings.min_frequency, 1000);
        assert_eq!(
            settings.raw("hosp", "labevents"),
            Path::new("/data/mimic/hosp/labevents.csv")
        );
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "chunk_size = 0\n").unwrap();
        assert!(Settings::load(&path).is_err());
    }

    #[test]
    fn missing_unit_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::rooted_at(dir.path());
        let err = settings.uom_path("labevents").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PrepError>(),
            Some(PrepError::MissingReference { .. })
        ));
    }
}
