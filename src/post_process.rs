//! The last stage: patient metadata, dictionary frequency revision, labels and categories.
use crate::{
    labels::{Categories, Labels},
    util::{self, format_number, optional_string},
    ArcStr, Code, Dictionary, PatientId, Result, Settings,
};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    path::Path,
};

/// Optional extras for the post-processing stage.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PostProcessOptions {
    /// Add `label` and `description` columns to the revised dictionary.
    pub add_label: bool,
    /// Write `code_dict_cat.csv` with a `category` column.
    pub add_category: bool,
}

/// Run the whole post-processing stage.
pub fn post_process(settings: &Settings, options: PostProcessOptions) -> Result {
    generate_patient_dict(settings)?;
    let labels = if options.add_label {
        Some(Labels::load(settings)?)
    } else {
        None
    };
    revise_code_dict(settings, labels.as_ref())?;
    if options.add_category {
        let categories = Categories::load(settings)?;
        add_categories(
            &settings.revised_dict_path(),
            &settings.category_dict_path(),
            &categories,
        )?;
    }
    Ok(())
}

#[derive(Deserialize)]
struct TupleRaw {
    patient_id: PatientId,
    code: ArcStr,
    #[serde(default)]
    value: String,
}

/// Patients with at least one row in the tuple file.
pub fn patients_with_records(tuples: &Path) -> Result<HashSet<PatientId>> {
    let mut out = HashSet::new();
    for row in crate::read_csv::<TupleRaw>(tuples)? {
        out.insert(row?.patient_id);
    }
    event!(Level::INFO, "{} patients have records", out.len());
    Ok(out)
}

#[derive(Deserialize)]
struct PatientRaw {
    subject_id: PatientId,
    #[serde(default, deserialize_with = "optional_string")]
    gender: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    anchor_age: Option<ArcStr>,
}

#[derive(Debug, Clone, Deserialize)]
struct AdmissionRaw {
    subject_id: PatientId,
    #[serde(default, deserialize_with = "optional_string")]
    admittime: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    dischtime: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    deathtime: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    ethnicity: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    marital_status: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    language: Option<ArcStr>,
}

#[derive(Deserialize)]
struct IcuStayRaw {
    subject_id: PatientId,
    #[serde(default, deserialize_with = "util::lenient_float")]
    los: Option<f64>,
}

/// One row of `patients_dict.csv`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatientEntry {
    pub subject_id: PatientId,
    pub gender: Option<ArcStr>,
    pub age: Option<ArcStr>,
    pub ethnicity: Option<ArcStr>,
    pub marital_status: Option<ArcStr>,
    pub language: Option<ArcStr>,
    pub in_time: Option<ArcStr>,
    pub out_time: Option<ArcStr>,
    pub death_time: Option<ArcStr>,
    /// Total days spent in intensive care. Empty if never admitted to the ICU.
    pub los: Option<String>,
}

/// Keep the admission whose `time` is smallest (`later = false`) or largest (`later = true`).
/// Admissions without a time lose to any with one; ties keep the first seen.
fn pick(
    current: &mut Option<AdmissionRaw>,
    candidate: &AdmissionRaw,
    later: bool,
    time: fn(&AdmissionRaw) -> Option<&str>,
) {
    let key = |a: &AdmissionRaw| time(a).and_then(util::parse_datetime);
    let replace = match current.as_ref() {
        None => true,
        Some(current) => match (key(current), key(candidate)) {
            (None, Some(_)) => true,
            (Some(cur), Some(new)) => {
                if later {
                    new > cur
                } else {
                    new < cur
                }
            }
            _ => false,
        },
    };
    if replace {
        *current = Some(candidate.clone());
    }
}

/// First and last admission per patient.
#[derive(Debug, Default)]
struct AdmissionSpan {
    first: Option<AdmissionRaw>,
    last: Option<AdmissionRaw>,
}

fn normalize_time(time: &Option<ArcStr>) -> Option<ArcStr> {
    let time = time.as_ref()?;
    Some(util::format_datetime(time).unwrap_or_else(|| time.clone()))
}

/// Write `patients_dict.csv`: every patient with at least one tuple, in patients table order,
/// with demographics from their first admission, discharge and death from their last, and their
/// total ICU length of stay.
pub fn generate_patient_dict(settings: &Settings) -> Result<usize> {
    let recorded = patients_with_records(&settings.tuples_path())?;

    let mut spans: HashMap<PatientId, AdmissionSpan> = HashMap::new();
    for row in crate::read_csv::<AdmissionRaw>(settings.raw("core", "admissions"))? {
        let row = row?;
        if !recorded.contains(&row.subject_id) {
            continue;
        }
        let span = spans.entry(row.subject_id.clone()).or_default();
        pick(&mut span.first, &row, false, |a| a.admittime.as_deref());
        pick(&mut span.last, &row, true, |a| a.dischtime.as_deref());
    }

    let mut los: HashMap<PatientId, f64> = HashMap::new();
    for row in crate::read_csv::<IcuStayRaw>(settings.raw("icu", "icustays"))? {
        let row = row?;
        if let Some(days) = row.los {
            *los.entry(row.subject_id).or_insert(0.) += days;
        }
    }
    event!(Level::INFO, "{} patients were once in the ICU", los.len());

    let path = settings.patients_dict_path();
    let mut writer = crate::csv_writer(&path)?;
    let mut count = 0;
    for row in crate::read_csv::<PatientRaw>(settings.patients_path())? {
        let row = row?;
        if !recorded.contains(&row.subject_id) {
            continue;
        }
        let span = spans.remove(&row.subject_id).unwrap_or_default();
        let first = span.first.as_ref();
        let last = span.last.as_ref();
        let entry = PatientEntry {
            subject_id: row.subject_id.clone(),
            gender: row.gender,
            age: row.anchor_age,
            ethnicity: first.and_then(|a| a.ethnicity.clone()),
            marital_status: first.and_then(|a| a.marital_status.clone()),
            language: first.and_then(|a| a.language.clone()),
            in_time: first.and_then(|a| normalize_time(&a.admittime)),
            out_time: last.and_then(|a| normalize_time(&a.dischtime)),
            death_time: last.and_then(|a| normalize_time(&a.deathtime)),
            los: los.get(&row.subject_id).map(|days| format_number(*days)),
        };
        writer.serialize(&entry)?;
        count += 1;
    }
    writer
        .flush()
        .with_context(|| format!("writing \"{}\"", path.display()))?;
    event!(Level::INFO, "wrote {} patients to \"{}\"", count, path.display());
    Ok(count)
}

/// Frequencies recounted from the tuple file.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RealisedFrequencies {
    /// (total, value) per code.
    counts: HashMap<Code, (u64, u64)>,
    /// Rows whose code isn't a valid key.
    pub malformed: u64,
}

impl RealisedFrequencies {
    /// Count rows per code, and rows whose value parses as a number.
    pub fn count(tuples: &Path) -> Result<Self> {
        let mut this = Self::default();
        for row in crate::read_csv::<TupleRaw>(tuples)? {
            let row = row?;
            let Ok(code) = row.code.parse::<Code>() else {
                this.malformed += 1;
                continue;
            };
            let counts = this.counts.entry(code).or_insert((0, 0));
            counts.0 += 1;
            if row.value.trim().parse::<f64>().is_ok() {
                counts.1 += 1;
            }
        }
        Ok(this)
    }

    pub fn get(&self, code: &Code) -> (u64, u64) {
        self.counts.get(code).copied().unwrap_or((0, 0))
    }
}

/// Recount dictionary frequencies from the realised tuple stream and write the revised
/// dictionary, optionally with labels.
pub fn revise_code_dict(settings: &Settings, labels: Option<&Labels>) -> Result<Dictionary> {
    event!(Level::INFO, "revising the dictionary");
    let mut dictionary = Dictionary::load(settings.code_dict_path())?;
    let realised = RealisedFrequencies::count(&settings.tuples_path())?;
    if realised.malformed > 0 {
        event!(Level::WARN, "{} tuples have a malformed code", realised.malformed);
    }
    let codes = dictionary.iter().map(|e| e.code()).collect::<Vec<_>>();
    for code in codes.iter() {
        let (total, value) = realised.get(code);
        let Some(entry) = dictionary.get_mut(code) else {
            continue;
        };
        if entry.value_frequency != value {
            event!(
                Level::DEBUG,
                "value frequency of {} changed: {} -> {}",
                code,
                entry.value_frequency,
                value
            );
            entry.value_frequency = value;
        }
        if entry.total_frequency != total {
            event!(
                Level::DEBUG,
                "total frequency of {} changed: {} -> {}",
                code,
                entry.total_frequency,
                total
            );
            entry.total_frequency = total;
        }
    }
    write_revised(&settings.revised_dict_path(), &dictionary, labels)?;
    Ok(dictionary)
}

/// Write the dictionary, with `label` and `description` columns when labels are given.
fn write_revised(path: &Path, dictionary: &Dictionary, labels: Option<&Labels>) -> Result {
    let Some(labels) = labels else {
        return dictionary.save(path);
    };
    let mut writer = crate::csv_writer(path)?;
    writer.write_record([
        "index",
        "code",
        "code_type",
        "value_frequency",
        "total_frequency",
        "source_table",
        "unit_of_measurement",
        "with_value",
        "label",
        "description",
    ])?;
    let mut missing = 0;
    for entry in dictionary.iter() {
        let code = entry.code();
        let label = labels.label(&code);
        if label.is_none() && code.ty != crate::CodeType::Transfer {
            event!(Level::DEBUG, "no label for {}", code);
            missing += 1;
        }
        writer.write_record([
            entry.index.to_string().as_str(),
            &*entry.code,
            entry.code_type.as_str(),
            entry.value_frequency.to_string().as_str(),
            entry.total_frequency.to_string().as_str(),
            &*entry.source_table,
            entry.unit_of_measurement.as_str(),
            if entry.with_value { "1" } else { "0" },
            label.unwrap_or(""),
            labels.description(&code).unwrap_or(""),
        ])?;
    }
    writer
        .flush()
        .with_context(|| format!("writing \"{}\"", path.display()))?;
    if missing > 0 {
        event!(Level::WARN, "{} codes have no label", missing);
    }
    Ok(())
}

/// Copy a dictionary file, adding a `category` column.
///
/// Works on whatever columns the input has, so it can follow the labelled dictionary too.
pub fn add_categories(input: &Path, output: &Path, categories: &Categories) -> Result {
    fn inner(input: &Path, output: &Path, categories: &Categories) -> Result {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(input)?;
        let headers = reader.headers()?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| format_err!("no \"{}\" column", name))
        };
        let (code_col, type_col) = (column("code")?, column("code_type")?);

        let mut writer = crate::csv_writer(output)?;
        let mut out_headers = headers.clone();
        out_headers.push_field("category");
        writer.write_record(&out_headers)?;
        for row in reader.records() {
            let mut row = row?;
            let category = match (row.get(code_col), row.get(type_col)) {
                (Some(code), Some(ty)) => ty
                    .parse()
                    .ok()
                    .and_then(|ty| categories.get(&Code::new(ty, code)))
                    .unwrap_or(""),
                _ => "",
            };
            let category = category.to_string();
            row.push_field(&category);
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }
    inner(input, output, categories).with_context(|| {
        format!(
            "adding categories to \"{}\" as \"{}\"",
            input.display(),
            output.display()
        )
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{CodeType, DictionaryEntry};
    use std::fs;

    #[test]
    fn realised_frequencies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tuples.csv");
        fs::write(
            &path,
            "patient_id,admission_id,time,code,value\n\
             1,,2180-01-01 00:00:00,mimic_100,2000.0\n\
             1,,2180-01-01 00:00:00,mimic_100,_STRING\n\
             2,,2180-01-01 00:00:00,mimic_100,0\n\
             2,,2180-01-01 00:00:00,ccs_54,\n\
             2,,2180-01-01 00:00:00,bogus,\n",
        )
        .unwrap();
        let freqs = RealisedFrequencies::count(&path).unwrap();
        assert_eq!(freqs.get(&Code::new(CodeType::Mimic, "100")), (3, 2));
        assert_eq!(freqs.get(&Code::new(CodeType::Ccs, "54")), (1, 0));
        assert_eq!(freqs.get(&Code::new(CodeType::Ccs, "55")), (0, 0));
        assert_eq!(freqs.malformed, 1);
        let patients = patients_with_records(&path).unwrap();
        assert_eq!(patients.len(), 2);
    }

    #[test]
    fn first_and_last_admission() {
        let adm = |admit: Option<&str>, disch: Option<&str>, lang: &str| AdmissionRaw {
            subject_id: "1".into(),
            admittime: admit.map(Into::into),
            dischtime: disch.map(Into::into),
            deathtime: None,
            ethnicity: None,
            marital_status: None,
            language: Some(lang.into()),
        };
        let rows = [
            adm(Some("2180-05-01 00:00:00"), Some("2180-05-03 00:00:00"), "b"),
            adm(None, None, "none"),
            adm(Some("2180-01-01 00:00:00"), Some("2180-01-05 00:00:00"), "a"),
            adm(Some("2180-01-01 00:00:00"), Some("2180-06-01 00:00:00"), "c"),
        ];
        let mut span = AdmissionSpan::default();
        for row in rows.iter() {
            pick(&mut span.first, row, false, |a| a.admittime.as_deref());
            pick(&mut span.last, row, true, |a| a.dischtime.as_deref());
        }
        assert_eq!(span.first.unwrap().language.as_deref(), Some("a"));
        assert_eq!(span.last.unwrap().language.as_deref(), Some("c"));
    }

    #[test]
    fn categories_column() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("code_dict.csv");
        let output = dir.path().join("code_dict_cat.csv");
        Dictionary::merge([DictionaryEntry {
            index: 0,
            code: "0042".into(),
            code_type: CodeType::Rxnorm,
            value_frequency: 0,
            total_frequency: 2,
            source_table: "prescriptions".into(),
            unit_of_measurement: String::new(),
            with_value: false,
        }])
        .save(&input)
        .unwrap();
        let categories = Categories::default();
        add_categories(&input, &output, &categories).unwrap();
        let text = fs::read_to_string(&output).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().ends_with(",with_value,category"));
        assert_eq!(lines.next(), Some("1,0042,rxnorm,0,2,prescriptions,,0,"));
    }
}
