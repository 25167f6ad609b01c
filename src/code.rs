//! Typed clinical codes.
use crate::{ArcStr, Result};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt, str::FromStr};

/// The coding systems a dictionary code can belong to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeType {
    Icd9,
    Icd10,
    Phecode,
    Ccs,
    Rxnorm,
    Drg,
    Transfer,
    Mimic,
}

impl CodeType {
    pub const ALL: [CodeType; 8] = [
        CodeType::Icd9,
        CodeType::Icd10,
        CodeType::Phecode,
        CodeType::Ccs,
        CodeType::Rxnorm,
        CodeType::Drg,
        CodeType::Transfer,
        CodeType::Mimic,
    ];

    pub fn as_str(self) -> &'static str {
        use CodeType::*;
        match self {
            Icd9 => "icd9",
            Icd10 => "icd10",
            Phecode => "phecode",
            Ccs => "ccs",
            Rxnorm => "rxnorm",
            Drg => "drg",
            Transfer => "transfer",
            Mimic => "mimic",
        }
    }
}

// Code types sort by name, so `icd10` comes before `icd9`. The merged dictionary depends on this.
impl PartialOrd for CodeType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CodeType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl fmt::Display for CodeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodeType {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CodeType::ALL
            .into_iter()
            .find(|ty| ty.as_str() == s.trim())
            .ok_or_else(|| format_err!("didn't recognise code type \"{}\"", s))
    }
}

/// A code in one of the supported coding systems.
///
/// The value is opaque text: numeric codes keep their leading zeros.
#[derive(Debug, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Code {
    pub ty: CodeType,
    pub value: ArcStr,
}

impl Code {
    pub fn new(ty: CodeType, value: impl Into<ArcStr>) -> Self {
        Self {
            ty,
            value: value.into(),
        }
    }
}

/// Renders the `<code_type>_<code>` key used in tuple files.
impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}_{}", self.ty, self.value)
    }
}

/// Parse a `<code_type>_<code>` key. Code type names never contain `_`, so everything after the
/// first `_` is the code.
impl FromStr for Code {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((ty, value)) = s.split_once('_') else {
            bail!("expected a \"<code_type>_<code>\" key, found \"{}\"", s)
        };
        Ok(Code::new(ty.parse()?, value))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn code_types_sort_by_name() {
        let mut types = CodeType::ALL.to_vec();
        types.sort();
        let names: Vec<_> = types.into_iter().map(CodeType::as_str).collect();
        assert_eq!(
            names,
            ["ccs", "drg", "icd10", "icd9", "mimic", "phecode", "rxnorm", "transfer"]
        );
    }

    #[test]
    fn key_round_trip_keeps_leading_zeros() {
        let code = Code::new(CodeType::Ccs, "0042");
        assert_eq!(code.to_string(), "ccs_0042");
        assert_eq!("ccs_0042".parse::<Code>().unwrap(), code);
        // codes may contain underscores themselves
        assert_eq!(
            "transfer_ED_observation".parse::<Code>().unwrap(),
            Code::new(CodeType::Transfer, "ED_observation")
        );
        assert!("nounderscore".parse::<Code>().is_err());
        assert!("loinc_123".parse::<Code>().is_err());
    }
}
