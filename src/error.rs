//! Fatal errors.
//!
//! Anything here aborts the run. Problems with individual records are never errors: they are
//! counted where they're found (see [`SkipCounts`](crate::tuples::SkipCounts)) and the record is
//! dropped.
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PrepError {
    /// A required input directory or file doesn't exist.
    #[error("required input \"{}\" does not exist", .path.display())]
    Configuration { path: PathBuf },
    /// A roll-up table maps the same source code more than once.
    #[error("source code \"{key}\" appears more than once in roll-up table \"{}\"", .path.display())]
    DuplicateKey { path: PathBuf, key: String },
    /// A reference file needed by the table being processed is missing.
    #[error("reference file \"{}\" is missing", .path.display())]
    MissingReference { path: PathBuf },
    /// Two intermediate tuple files disagree about the patient sequence.
    #[error(
        "intermediate file \"{}\" is out of step at patient {position}: expected \"{expected}\", found \"{found}\"",
        .file.display()
    )]
    Synchronization {
        file: PathBuf,
        position: usize,
        expected: String,
        found: String,
    },
}
