//! Turn raw clinical record extracts into a frequency-filtered code dictionary and per-patient,
//! time-ordered event tuples.
//!
//! The pipeline has three stages, run strictly one after the other:
//!
//! 1. [`dictionary`]: count codes in every source table (after rolling them up into coarser
//!    vocabularies), drop rare ones, and merge the per-table fragments into `code_dict.csv`.
//! 2. [`tuples`] and [`merge`]: stream every source table in chunks into per-patient
//!    intermediate files, then k-way merge those into `tuples.csv` and `string_tuples.csv`.
//! 3. [`post_process`]: patient metadata, frequency revision and optional labels.
pub mod code;
pub mod config;
pub mod dictionary;
pub mod error;
pub mod labels;
pub mod merge;
pub mod pipeline;
pub mod post_process;
pub mod rollup;
pub mod tables;
pub mod tuples;
pub mod units;
mod util;
pub mod value;

pub use anyhow::{Context, Error};
use qu::ick_use::*;
use serde::de::DeserializeOwned;
use std::{
    collections::HashMap,
    fs, io,
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
};

pub use crate::{
    code::{Code, CodeType},
    config::Settings,
    dictionary::{Dictionary, DictionaryEntry},
    error::PrepError,
    rollup::{RollupTable, Rollups, UNKNOWN},
    tables::SourceTable,
    units::{normalize_unit, ItemUnits, UnitDependency},
    util::header,
    value::{resolve_value, EventValue, Resolution},
};

pub type ArcStr = Arc<str>;
pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;
/// Patient (subject) IDs are kept as text, exactly as they appear in the extract.
pub type PatientId = ArcStr;

/// The full set of known patients, in the order they appear in `core/patients.csv`.
///
/// This order is what every intermediate tuple file is written in, so it must never be re-sorted.
#[derive(Debug, Clone)]
pub struct PatientUniverse {
    els: Arc<Vec<PatientId>>,
    id_idx: HashMap<PatientId, usize>,
}

impl PatientUniverse {
    /// Load the `subject_id` column of the patients table.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        #[derive(serde::Deserialize)]
        struct PatientRaw {
            subject_id: PatientId,
        }

        let path = path.as_ref();
        let ids = read_csv::<PatientRaw>(path)?
            .map(|row| row.map(|row| row.subject_id))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("while loading patients from \"{}\"", path.display()))?;
        let this = Self::new(ids);
        event!(Level::INFO, "loaded {} patients", this.len());
        Ok(this)
    }

    /// Build a universe from IDs. Repeated IDs keep their first position.
    pub fn new(ids: impl IntoIterator<Item = PatientId>) -> Self {
        let mut els = vec![];
        let mut id_idx = HashMap::new();
        for id in ids {
            if id_idx.contains_key(&id) {
                continue;
            }
            id_idx.insert(id.clone(), els.len());
            els.push(id);
        }
        Self {
            els: Arc::new(els),
            id_idx,
        }
    }

    /// Position of the patient in the universe, if known.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.id_idx.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.id_idx.contains_key(id)
    }
}

impl Deref for PatientUniverse {
    type Target = [PatientId];
    fn deref(&self) -> &Self::Target {
        &*self.els
    }
}

/// The typed rows of a csv file. Owns its reader, so it never borrows the path it was opened from.
pub type Rows<T> = Box<dyn Iterator<Item = Result<T>>>;

/// Lazily deserialize the rows of a headed csv file.
///
/// Columns that the row type doesn't name are ignored, so the same file can feed several
/// row types.
pub fn read_csv<T: DeserializeOwned + 'static>(path: impl AsRef<Path>) -> Result<Rows<T>> {
    let path = path.as_ref();
    let reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("while opening \"{}\"", path.display()))?;
    let path = path.to_owned();
    Ok(Box::new(reader.into_deserialize().map(move |row| {
        row.with_context(|| format!("while reading \"{}\"", path.display()))
    })))
}

/// Open a csv writer, creating parent directories as needed.
pub fn csv_writer(path: impl AsRef<Path>) -> Result<csv::Writer<fs::File>> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("could not create parent")?;
    }
    if util::path_exists(path)? {
        event!(Level::DEBUG, "overwriting existing file at \"{}\"", path.display());
    }
    csv::Writer::from_path(path).with_context(|| format!("while creating \"{}\"", path.display()))
}

/// Fail with a configuration error if `path` doesn't exist.
pub fn require_path(path: &Path) -> Result<PathBuf> {
    if util::path_exists(path)? {
        Ok(path.to_owned())
    } else {
        Err(PrepError::Configuration {
            path: path.to_owned(),
        }
        .into())
    }
}

pub fn file_exists(path: &Path) -> io::Result<bool> {
    util::path_exists(path)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn universe_keeps_file_order() {
        let universe = PatientUniverse::new(["30".into(), "10".into(), "20".into(), "10".into()]);
        let expected: Vec<PatientId> = vec!["30".into(), "10".into(), "20".into()];
        assert_eq!(&*universe, &expected[..]);
        assert_eq!(universe.position("10"), Some(1));
        assert_eq!(universe.position("99"), None);
    }

    #[test]
    fn rows_outlive_their_path() {
        #[derive(serde::Deserialize)]
        struct Row {
            a: u32,
        }

        let dir = tempfile::tempdir().unwrap();
        let rows = {
            let path = dir.path().join("rows.csv");
            fs::write(&path, "a\n1\n 2 \n").unwrap();
            read_csv::<Row>(&path).unwrap()
        };
        let values = rows.map(|row| row.unwrap().a).collect::<Vec<_>>();
        assert_eq!(values, [1, 2]);
    }

    #[test]
    fn missing_input_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = require_path(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PrepError>(),
            Some(PrepError::Configuration { .. })
        ));
    }
}
