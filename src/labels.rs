//! Human readable labels and categories for dictionary codes.
//!
//! The dictionaries that ship with the extract (`d_icd_diagnoses`, `d_labitems`, `d_items`,
//! DRG descriptions) are read from the raw directory. Vocabulary labels for PheCode, CCS and
//! Rxnorm come from the reference directory.
use crate::{
    util::{self, optional_string},
    ArcStr, Code, CodeType, PrepError, Result, Rows, Settings,
};
use qu::ick_use::*;
use serde::{de::DeserializeOwned, Deserialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

type CodeMap = HashMap<(CodeType, ArcStr), ArcStr>;

/// Read a reference csv, failing with a reference data error if it's missing.
fn read_reference<T: DeserializeOwned + 'static>(path: &Path) -> Result<Rows<T>> {
    if !util::path_exists(path)? {
        return Err(PrepError::MissingReference {
            path: path.to_owned(),
        }
        .into());
    }
    event!(Level::DEBUG, "reading reference file \"{}\"", path.display());
    crate::read_csv(path)
}

#[derive(Deserialize)]
struct IcdDiagnosisRaw {
    icd_code: ArcStr,
    icd_version: ArcStr,
    #[serde(default, deserialize_with = "optional_string")]
    long_title: Option<ArcStr>,
}

#[derive(Deserialize)]
struct LabItemRaw {
    itemid: ArcStr,
    #[serde(default, deserialize_with = "optional_string")]
    label: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    fluid: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    category: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    loinc_code: Option<ArcStr>,
}

#[derive(Deserialize)]
struct ItemRaw {
    itemid: ArcStr,
    #[serde(default, deserialize_with = "optional_string")]
    label: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    category: Option<ArcStr>,
}

#[derive(Deserialize)]
struct DrgRaw {
    drg_code: ArcStr,
    #[serde(default, deserialize_with = "optional_string")]
    description: Option<ArcStr>,
}

#[derive(Deserialize)]
struct PhecodeLabelRaw {
    phecode: ArcStr,
    #[serde(default, deserialize_with = "optional_string")]
    phecode_str: Option<ArcStr>,
}

#[derive(Deserialize)]
struct CcsLabelRaw {
    ccs: ArcStr,
    #[serde(default, deserialize_with = "optional_string")]
    label: Option<ArcStr>,
}

#[derive(Deserialize)]
struct RxnormLabelRaw {
    rxcui: ArcStr,
    #[serde(default, deserialize_with = "optional_string")]
    label: Option<ArcStr>,
}

#[derive(Deserialize)]
struct IngredientRaw {
    #[serde(default, deserialize_with = "optional_string")]
    ingredient: Option<ArcStr>,
}

#[derive(Deserialize)]
struct PhecodeCategoryRaw {
    phecode: ArcStr,
    #[serde(default, deserialize_with = "optional_string")]
    category: Option<ArcStr>,
}

/// Labels and descriptions, keyed by code.
#[derive(Debug, Clone, Default)]
pub struct Labels {
    labels: CodeMap,
    descriptions: CodeMap,
}

impl Labels {
    /// Load every label source. Any missing file is a reference data error.
    pub fn load(settings: &Settings) -> Result<Self> {
        let mut this = Self::default();

        let diagnoses = settings.raw("hosp", "d_icd_diagnoses");
        for row in read_reference::<IcdDiagnosisRaw>(&diagnoses)? {
            let row = row?;
            let ty = match row.icd_version.trim() {
                "9" => CodeType::Icd9,
                "10" => CodeType::Icd10,
                _ => continue,
            };
            this.insert_label(ty, row.icd_code, row.long_title);
        }

        for row in read_reference::<LabItemRaw>(&settings.raw("hosp", "d_labitems"))? {
            let row = row?;
            let description = format!(
                "{} / {}",
                row.fluid.as_deref().unwrap_or(""),
                row.category.as_deref().unwrap_or("")
            );
            this.descriptions
                .insert((CodeType::Mimic, row.itemid.clone()), description.into());
            this.insert_label(CodeType::Mimic, row.itemid, row.label);
        }

        // icu items take precedence over lab items with the same id
        for row in read_reference::<ItemRaw>(&settings.raw("icu", "d_items"))? {
            let row = row?;
            if let Some(category) = row.category {
                this.descriptions
                    .insert((CodeType::Mimic, row.itemid.clone()), category);
            }
            this.insert_label(CodeType::Mimic, row.itemid, row.label);
        }

        for row in read_reference::<DrgRaw>(&settings.raw("hosp", "drgcodes"))? {
            let row = row?;
            // the first description of a DRG code wins
            if let Some(description) = row.description {
                this.labels
                    .entry((CodeType::Drg, row.drg_code))
                    .or_insert(description);
            }
        }

        let reference = |name: &str| -> PathBuf { settings.reference_dir.join(name) };
        for row in read_reference::<PhecodeLabelRaw>(&reference("phecode_labels.csv"))? {
            let row = row?;
            this.insert_label(CodeType::Phecode, row.phecode, row.phecode_str);
        }
        for row in read_reference::<CcsLabelRaw>(&reference("ccs_labels.csv"))? {
            let row = row?;
            this.insert_label(CodeType::Ccs, row.ccs, row.label);
        }
        for row in read_reference::<RxnormLabelRaw>(&reference("rxnorm_labels.csv"))? {
            let row = row?;
            this.insert_label(CodeType::Rxnorm, row.rxcui, row.label);
        }

        event!(Level::INFO, "loaded {} code labels", this.labels.len());
        Ok(this)
    }

    fn insert_label(&mut self, ty: CodeType, code: ArcStr, label: Option<ArcStr>) {
        if let Some(label) = label {
            self.labels.insert((ty, code), label);
        }
    }

    pub fn label(&self, code: &Code) -> Option<&str> {
        self.labels
            .get(&(code.ty, code.value.clone()))
            .map(|l| &**l)
    }

    pub fn description(&self, code: &Code) -> Option<&str> {
        self.descriptions
            .get(&(code.ty, code.value.clone()))
            .map(|d| &**d)
    }
}

/// Categories, keyed by code.
#[derive(Debug, Clone, Default)]
pub struct Categories {
    map: CodeMap,
}

impl Categories {
    /// Load every category source. Any missing file is a reference data error.
    ///
    /// * lab items: `LOINC:<loinc code>`
    /// * ingredient-level Rxnorm codes: `ingredient-level`
    /// * PheCodes: `category:<category>`
    pub fn load(settings: &Settings) -> Result<Self> {
        let mut map = CodeMap::new();
        for row in read_reference::<LabItemRaw>(&settings.raw("hosp", "d_labitems"))? {
            let row = row?;
            if let Some(loinc) = row.loinc_code {
                map.insert(
                    (CodeType::Mimic, row.itemid),
                    format!("LOINC:{}", loinc).into(),
                );
            }
        }

        let ingredients = settings.reference_dir.join("rxnorm_ingredients.csv");
        let mut ingredient_count = 0;
        for row in read_reference::<IngredientRaw>(&ingredients)? {
            if let Some(ingredient) = row?.ingredient {
                map.insert((CodeType::Rxnorm, ingredient), "ingredient-level".into());
                ingredient_count += 1;
            }
        }
        event!(Level::DEBUG, "{} ingredient-level rxnorm codes", ingredient_count);

        let definitions = settings.reference_dir.join("phecode_definitions.csv");
        for row in read_reference::<PhecodeCategoryRaw>(&definitions)? {
            let row = row?;
            if let Some(category) = row.category {
                map.insert(
                    (CodeType::Phecode, row.phecode),
                    format!("category:{}", category).into(),
                );
            }
        }
        Ok(Self { map })
    }

    pub fn get(&self, code: &Code) -> Option<&str> {
        self.map.get(&(code.ty, code.value.clone())).map(|c| &**c)
    }
}
