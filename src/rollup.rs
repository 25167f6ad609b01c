//! Roll-up tables: one-to-one translations from a fine-grained coding system into a coarser one.
use crate::{ArcStr, PrepError, Result, Settings};
use qu::ick_use::*;
use std::{
    collections::{hash_map, HashMap},
    path::{Path, PathBuf},
};

/// What `lookup` returns for codes the table doesn't know. Never a valid dictionary code.
pub const UNKNOWN: &str = "<unk>";

/// An immutable source code → target code mapping.
#[derive(Debug, Clone, Default)]
pub struct RollupTable {
    map: HashMap<ArcStr, ArcStr>,
}

impl RollupTable {
    /// Load a two-column csv file (with a header row) of source code, target code.
    ///
    /// The tables are assumed clean, so a repeated source code is an error even if it maps to
    /// the same target.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        fn inner(path: &Path) -> Result<RollupTable> {
            let reader = csv::ReaderBuilder::new()
                .has_headers(true)
                .trim(csv::Trim::All)
                .from_path(path)?;
            let pairs = reader.into_records().map(|row| -> Result<(ArcStr, ArcStr)> {
                let row = row?;
                let (Some(from), Some(to)) = (row.get(0), row.get(1)) else {
                    bail!("expected 2 columns, found {}", row.len())
                };
                Ok((ArcStr::from(from), ArcStr::from(to)))
            });
            RollupTable::from_pairs(path, pairs)
        }

        let path = path.as_ref();
        if !crate::file_exists(path)? {
            return Err(PrepError::MissingReference {
                path: path.to_owned(),
            }
            .into());
        }
        let table =
            inner(path).with_context(|| format!("loading roll-up table \"{}\"", path.display()))?;
        event!(
            Level::DEBUG,
            "loaded {} mappings from \"{}\"",
            table.len(),
            path.display()
        );
        Ok(table)
    }

    /// Build a table from already parsed pairs. `origin` is only used in error messages.
    pub fn from_pairs(
        origin: impl Into<PathBuf>,
        pairs: impl IntoIterator<Item = Result<(ArcStr, ArcStr)>>,
    ) -> Result<Self> {
        let mut map = HashMap::new();
        for pair in pairs {
            let (from, to) = pair?;
            match map.entry(from) {
                hash_map::Entry::Occupied(entry) => {
                    return Err(PrepError::DuplicateKey {
                        path: origin.into(),
                        key: entry.key().to_string(),
                    }
                    .into())
                }
                hash_map::Entry::Vacant(entry) => {
                    entry.insert(to);
                }
            }
        }
        Ok(Self { map })
    }

    /// Translate a code, or get [`UNKNOWN`] if the table doesn't have it.
    pub fn lookup(&self, code: &str) -> &str {
        self.get(code).map(|v| &**v).unwrap_or(UNKNOWN)
    }

    pub fn get(&self, code: &str) -> Option<&ArcStr> {
        self.map.get(code)
    }

    pub fn contains(&self, code: &str) -> bool {
        self.map.contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Every roll-up table the extractors use.
#[derive(Debug, Clone, Default)]
pub struct Rollups {
    pub cpt2ccs: RollupTable,
    pub ndc2rxnorm: RollupTable,
    pub icd92phe: RollupTable,
    pub icd102phe: RollupTable,
    pub icd9cm2ccs: RollupTable,
    pub icd10pcs2ccs: RollupTable,
}

impl Rollups {
    /// Load all tables from the roll-up directory of `settings`.
    pub fn load(settings: &Settings) -> Result<Self> {
        let load = |name: &str| RollupTable::load(settings.rollup_path(name));
        Ok(Self {
            cpt2ccs: load("cpt2ccs")?,
            ndc2rxnorm: load("ndc2rxnorm")?,
            icd92phe: load("icd92phe")?,
            icd102phe: load("icd102phe")?,
            icd9cm2ccs: load("icd9cm2ccs")?,
            icd10pcs2ccs: load("icd10pcs2ccs")?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;

    fn table(pairs: &[(&str, &str)]) -> Result<RollupTable> {
        RollupTable::from_pairs(
            "test",
            pairs.iter().map(|(a, b)| Ok((ArcStr::from(*a), ArcStr::from(*b)))),
        )
    }

    #[test]
    fn lookup_is_total() {
        let table = table(&[("A1", "X")]).unwrap();
        assert_eq!(table.lookup("A1"), "X");
        assert_eq!(table.lookup("B9"), UNKNOWN);
        // and deterministic
        assert_eq!(table.lookup("B9"), table.lookup("B9"));
    }

    #[test]
    fn duplicate_keys_are_fatal() {
        for pairs in [&[("A1", "X"), ("A1", "Y")], &[("A1", "X"), ("A1", "X")]] {
            let err = table(pairs).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<PrepError>(),
                Some(PrepError::DuplicateKey { key, .. }) if key == "A1"
            ));
        }
    }

    #[test]
    fn load_keeps_leading_zeros() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ndc2rxnorm_rollup.csv");
        fs::write(&path, "ndc,rxnorm\n00002143380,0042\n00002143381,43\n").unwrap();
        let table = RollupTable::load(&path).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup("00002143380"), "0042");
    }

    #[test]
    fn duplicate_in_file_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpt2ccs_rollup.csv");
        fs::write(&path, "cpt,ccs\n99213,227\n99213,227\n").unwrap();
        let err = RollupTable::load(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PrepError>(),
            Some(PrepError::DuplicateKey { path: p, .. }) if p == &path
        ));
    }

    #[test]
    fn missing_table() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::rooted_at(dir.path());
        let err = Rollups::load(&settings).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PrepError>(),
            Some(PrepError::MissingReference { path }) if path == &settings.rollup_path("cpt2ccs")
        ));
    }

    #[test]
    fn loads_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::rooted_at(dir.path());
        fs::create_dir_all(&settings.rollup_dir).unwrap();
        for name in [
            "cpt2ccs",
            "ndc2rxnorm",
            "icd92phe",
            "icd102phe",
            "icd9cm2ccs",
            "icd10pcs2ccs",
        ] {
            fs::write(settings.rollup_path(name), "from,to\n").unwrap();
        }
        fs::write(settings.rollup_path("icd9cm2ccs"), "icd9,ccs\nA1,X\n").unwrap();
        let rollups = Rollups::load(&settings).unwrap();
        assert_eq!(rollups.icd9cm2ccs.lookup("A1"), "X");
        assert!(rollups.cpt2ccs.is_empty());
    }
}
