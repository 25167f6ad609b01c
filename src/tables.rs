//! The source tables of the extract, and how each one yields coded records.
//!
//! Every table is streamed row by row. Rows that can never produce a code (e.g. a prescription
//! without a usable NDC) are dropped here; rows whose code doesn't survive roll-up are yielded
//! with `code: None` so the dictionary can count them as unknown.
use crate::{
    util::{self, lenient_float, optional_string},
    ArcStr, Code, CodeType, PatientId, Result, Rollups, Settings, UNKNOWN,
};
use qu::ick_use::*;
use serde::{de::DeserializeOwned, Deserialize};
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

/// The tables that feed the dictionary and the tuple stream.
///
/// `Ccs` is a virtual table: procedure codes from `procedures_icd` and `hcpcsevents` rolled up
/// into CCS.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum SourceTable {
    Prescriptions,
    Ccs,
    DrgCodes,
    DiagnosesIcd,
    Transfers,
    ProcedureEvents,
    InputEvents,
    OutputEvents,
    LabEvents,
    ChartEvents,
}

impl SourceTable {
    /// All tables, in processing order.
    pub const ALL: [SourceTable; 10] = [
        SourceTable::Prescriptions,
        SourceTable::Ccs,
        SourceTable::DrgCodes,
        SourceTable::DiagnosesIcd,
        SourceTable::Transfers,
        SourceTable::ProcedureEvents,
        SourceTable::InputEvents,
        SourceTable::OutputEvents,
        SourceTable::LabEvents,
        SourceTable::ChartEvents,
    ];

    /// The name used for fragments, the `source_table` column and intermediate files.
    pub fn name(self) -> &'static str {
        use SourceTable::*;
        match self {
            Prescriptions => "prescriptions",
            Ccs => "ccs",
            DrgCodes => "drgcodes",
            DiagnosesIcd => "diagnoses_icd",
            Transfers => "transfers",
            ProcedureEvents => "procedureevents",
            InputEvents => "inputevents",
            OutputEvents => "outputevents",
            LabEvents => "labevents",
            ChartEvents => "chartevents",
        }
    }

    /// Tables whose codes can carry a value, and so have a unit dependency file.
    pub fn has_values(self) -> bool {
        matches!(
            self,
            SourceTable::OutputEvents | SourceTable::LabEvents | SourceTable::ChartEvents
        )
    }

    /// Tables whose values go through unit conversion and feed the string stream.
    pub fn resolves_values(self) -> bool {
        matches!(self, SourceTable::LabEvents | SourceTable::ChartEvents)
    }

    /// Tables timestamped by the discharge time of the admission rather than a column of
    /// their own.
    pub fn timed_by_discharge(self) -> bool {
        matches!(self, SourceTable::DrgCodes | SourceTable::DiagnosesIcd)
    }

    /// The raw files this table reads, relative to the extract root.
    pub fn raw_files(self, settings: &Settings) -> Vec<PathBuf> {
        use SourceTable::*;
        match self {
            Prescriptions => vec![settings.raw("hosp", "prescriptions")],
            Ccs => vec![
                settings.raw("hosp", "procedures_icd"),
                settings.raw("hosp", "hcpcsevents"),
            ],
            DrgCodes => vec![settings.raw("hosp", "drgcodes")],
            DiagnosesIcd => vec![settings.raw("hosp", "diagnoses_icd")],
            Transfers => vec![settings.raw("core", "transfers")],
            ProcedureEvents => vec![settings.raw("icu", "procedureevents")],
            InputEvents => vec![settings.raw("icu", "inputevents")],
            OutputEvents => vec![settings.raw("icu", "outputevents")],
            LabEvents => vec![settings.raw("hosp", "labevents")],
            ChartEvents => vec![settings.raw("icu", "chartevents")],
        }
    }

    /// Stream the coded records of this table.
    pub fn records<'a>(self, settings: &Settings, rollups: &'a Rollups) -> Result<Records<'a>> {
        use SourceTable::*;
        let files = self.raw_files(settings);
        let records: Records<'a> = match self {
            Prescriptions => Box::new(filter_rows(&files[0], move |row: PrescriptionRaw| {
                let ndc = row.ndc.clone()?;
                let code = rolled_up(CodeType::Rxnorm, rollups.ndc2rxnorm.lookup(&ndc));
                Some(SourceRecord::new(row.subject_id, row.hadm_id, ndc, code, row.starttime))
            })?),
            Ccs => {
                let icd = filter_rows(&files[0], move |row: ProcedureIcdRaw| {
                    let icd_code = row.icd_code.clone()?;
                    let target = match row.icd_version.as_deref().map(str::trim) {
                        Some("9") => rollups.icd9cm2ccs.lookup(&icd_code),
                        _ => rollups.icd10pcs2ccs.lookup(&icd_code),
                    };
                    let code = rolled_up(CodeType::Ccs, target);
                    Some(SourceRecord::new(
                        row.subject_id,
                        row.hadm_id,
                        icd_code,
                        code,
                        row.chartdate,
                    ))
                })?;
                let cpt = filter_rows(&files[1], move |row: HcpcsRaw| {
                    let cpt = row.hcpcs_cd.clone()?;
                    let code = rolled_up(CodeType::Ccs, rollups.cpt2ccs.lookup(&cpt));
                    Some(SourceRecord::new(row.subject_id, row.hadm_id, cpt, code, row.chartdate))
                })?;
                Box::new(icd.chain(cpt))
            }
            DrgCodes => Box::new(filter_rows(&files[0], |row: DrgRaw| {
                let drg = row.drg_code.clone()?;
                let code = Some(Code::new(CodeType::Drg, drg.clone()));
                Some(SourceRecord::new(row.subject_id, row.hadm_id, drg, code, None))
            })?),
            DiagnosesIcd => Box::new(filter_rows(&files[0], move |row: DiagnosisRaw| {
                let icd_code = row.icd_code.clone()?;
                let (table, raw_ty) = match row.icd_version.as_deref().map(str::trim) {
                    Some("9") => (&rollups.icd92phe, CodeType::Icd9),
                    Some("10") => (&rollups.icd102phe, CodeType::Icd10),
                    _ => return None,
                };
                // unmapped diagnoses are kept in their own coding system
                let code = match table.get(&icd_code) {
                    Some(phecode) => Code::new(CodeType::Phecode, phecode.clone()),
                    None => Code::new(raw_ty, icd_code.clone()),
                };
                Some(SourceRecord::new(row.subject_id, row.hadm_id, icd_code, Some(code), None))
            })?),
            Transfers => Box::new(filter_rows(&files[0], |row: TransferRaw| {
                let eventtype = row.eventtype.clone()?;
                let code = Some(Code::new(CodeType::Transfer, eventtype.clone()));
                let mut record = SourceRecord::new(
                    row.subject_id,
                    row.hadm_id,
                    eventtype,
                    code,
                    row.intime,
                );
                record.text = row.careunit;
                Some(record)
            })?),
            ProcedureEvents | InputEvents => {
                Box::new(filter_rows(&files[0], |row: ItemEventRaw| {
                    let itemid = row.itemid.clone()?;
                    let code = Some(Code::new(CodeType::Mimic, itemid.clone()));
                    Some(SourceRecord::new(
                        row.subject_id,
                        row.hadm_id,
                        itemid,
                        code,
                        row.starttime,
                    ))
                })?)
            }
            OutputEvents => Box::new(filter_rows(&files[0], |row: OutputRaw| {
                let itemid = row.itemid.clone()?;
                let code = Some(Code::new(CodeType::Mimic, itemid.clone()));
                let mut record = SourceRecord::new(
                    row.subject_id,
                    row.hadm_id,
                    itemid,
                    code,
                    row.charttime,
                );
                record.numeric = row.value.as_deref().and_then(parse_number);
                record.text = row.value;
                record.unit = row.valueuom;
                Some(record)
            })?),
            LabEvents | ChartEvents => Box::new(filter_rows(&files[0], |row: MeasurementRaw| {
                let itemid = row.itemid.clone()?;
                let code = Some(Code::new(CodeType::Mimic, itemid.clone()));
                let mut record = SourceRecord::new(
                    row.subject_id,
                    row.hadm_id,
                    itemid,
                    code,
                    row.charttime,
                );
                record.numeric = row.valuenum;
                record.text = row.value;
                record.unit = row.valueuom;
                Some(record)
            })?),
        };
        Ok(records)
    }
}

impl fmt::Display for SourceTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SourceTable {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceTable::ALL
            .into_iter()
            .find(|t| t.name() == s.trim())
            .ok_or_else(|| format_err!("didn't recognise source table \"{}\"", s))
    }
}

pub type Records<'a> = Box<dyn Iterator<Item = Result<SourceRecord>> + 'a>;

/// One row of a source table, with its code already rolled up.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub subject_id: PatientId,
    pub hadm_id: Option<ArcStr>,
    /// The raw time column, if the table has one.
    pub time: Option<ArcStr>,
    /// The code as it appears in the table, before roll-up.
    pub raw_code: ArcStr,
    /// `None` when roll-up found no target.
    pub code: Option<Code>,
    /// The raw value column.
    pub text: Option<ArcStr>,
    pub numeric: Option<f64>,
    pub unit: Option<ArcStr>,
}

impl SourceRecord {
    fn new(
        subject_id: PatientId,
        hadm_id: Option<ArcStr>,
        raw_code: ArcStr,
        code: Option<Code>,
        time: Option<ArcStr>,
    ) -> Self {
        SourceRecord {
            subject_id,
            hadm_id,
            time,
            raw_code,
            code,
            text: None,
            numeric: None,
            unit: None,
        }
    }
}

/// Whether an NDC is counted into the dictionary at all: well formed and known to the roll-up.
pub fn countable_ndc(ndc: &str, rollups: &Rollups) -> bool {
    ndc != "0" && ndc.len() == 11 && rollups.ndc2rxnorm.contains(ndc)
}

/// Map a roll-up result to a code, treating the unknown sentinel as no code.
fn rolled_up(ty: CodeType, target: &str) -> Option<Code> {
    (target != UNKNOWN).then(|| Code::new(ty, target))
}

fn parse_number(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|v| !v.is_nan())
}

fn filter_rows<'a, T, F>(
    path: &Path,
    f: F,
) -> Result<impl Iterator<Item = Result<SourceRecord>> + 'a>
where
    T: DeserializeOwned + 'static,
    F: Fn(T) -> Option<SourceRecord> + 'a,
{
    event!(Level::DEBUG, "streaming \"{}\"", path.display());
    Ok(crate::read_csv::<T>(path)?.filter_map(move |row| match row {
        Ok(row) => f(row).map(Ok),
        Err(e) => Some(Err(e)),
    }))
}

/// Admission discharge times, used to timestamp diagnoses and DRG codes.
#[derive(Debug, Clone, Default)]
pub struct DischargeTimes {
    map: HashMap<ArcStr, ArcStr>,
}

impl DischargeTimes {
    /// Load `hadm_id, dischtime` from the admissions table.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        #[derive(Deserialize)]
        struct AdmissionRaw {
            hadm_id: ArcStr,
            #[serde(default, deserialize_with = "optional_string")]
            dischtime: Option<ArcStr>,
        }

        let path = path.as_ref();
        let mut map = HashMap::new();
        for row in crate::read_csv::<AdmissionRaw>(path)? {
            let row = row?;
            if let Some(time) = row.dischtime {
                map.insert(row.hadm_id, time);
            }
        }
        event!(
            Level::DEBUG,
            "loaded {} discharge times from \"{}\"",
            map.len(),
            path.display()
        );
        Ok(Self { map })
    }

    pub fn get(&self, hadm_id: &str) -> Option<&ArcStr> {
        self.map.get(hadm_id)
    }
}

impl FromIterator<(ArcStr, ArcStr)> for DischargeTimes {
    fn from_iter<T: IntoIterator<Item = (ArcStr, ArcStr)>>(iter: T) -> Self {
        Self {
            map: iter.into_iter().collect(),
        }
    }
}

// Raw rows. Only the columns we use are named; the rest are ignored. Rows are never flattened:
// the csv deserializer would guess numeric types for the buffered fields.

#[derive(Deserialize)]
struct PrescriptionRaw {
    subject_id: PatientId,
    #[serde(default, deserialize_with = "optional_string")]
    hadm_id: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    starttime: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    ndc: Option<ArcStr>,
}

#[derive(Deserialize)]
struct ProcedureIcdRaw {
    subject_id: PatientId,
    #[serde(default, deserialize_with = "optional_string")]
    hadm_id: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    chartdate: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    icd_code: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    icd_version: Option<ArcStr>,
}

#[derive(Deserialize)]
struct HcpcsRaw {
    subject_id: PatientId,
    #[serde(default, deserialize_with = "optional_string")]
    hadm_id: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    chartdate: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    hcpcs_cd: Option<ArcStr>,
}

#[derive(Deserialize)]
struct DrgRaw {
    subject_id: PatientId,
    #[serde(default, deserialize_with = "optional_string")]
    hadm_id: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    drg_code: Option<ArcStr>,
}

#[derive(Deserialize)]
struct DiagnosisRaw {
    subject_id: PatientId,
    #[serde(default, deserialize_with = "optional_string")]
    hadm_id: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    icd_code: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    icd_version: Option<ArcStr>,
}

#[derive(Deserialize)]
struct TransferRaw {
    subject_id: PatientId,
    #[serde(default, deserialize_with = "optional_string")]
    hadm_id: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    intime: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    eventtype: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    careunit: Option<ArcStr>,
}

#[derive(Deserialize)]
struct ItemEventRaw {
    subject_id: PatientId,
    #[serde(default, deserialize_with = "optional_string")]
    hadm_id: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    starttime: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    itemid: Option<ArcStr>,
}

#[derive(Deserialize)]
struct OutputRaw {
    subject_id: PatientId,
    #[serde(default, deserialize_with = "optional_string")]
    hadm_id: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    charttime: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    itemid: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    value: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    valueuom: Option<ArcStr>,
}

#[derive(Deserialize)]
struct MeasurementRaw {
    subject_id: PatientId,
    #[serde(default, deserialize_with = "optional_string")]
    hadm_id: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    charttime: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    itemid: Option<ArcStr>,
    #[serde(default, deserialize_with = "optional_string")]
    value: Option<ArcStr>,
    #[serde(default, deserialize_with = "lenient_float")]
    valuenum: Option<f64>,
    #[serde(default, deserialize_with = "optional_string")]
    valueuom: Option<ArcStr>,
}

/// Check the time column of a record can be used, rendering it in the output format.
pub fn record_time(raw: Option<&str>) -> Option<ArcStr> {
    raw.and_then(util::format_datetime)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::RollupTable;
    use std::fs;

    fn rollups() -> Rollups {
        let table = |pairs: &[(&str, &str)]| {
            RollupTable::from_pairs(
                "test",
                pairs.iter().map(|(a, b)| Ok((ArcStr::from(*a), ArcStr::from(*b)))),
            )
            .unwrap()
        };
        Rollups {
            cpt2ccs: table(&[("99213", "227")]),
            ndc2rxnorm: table(&[("00002143380", "0042"), ("12345", "7")]),
            icd92phe: table(&[("4019", "401.1")]),
            icd102phe: table(&[]),
            icd9cm2ccs: table(&[("3893", "54")]),
            icd10pcs2ccs: table(&[("0DTJ4ZZ", "80")]),
        }
    }

    fn write(settings: &Settings, dir: &str, table: &str, contents: &str) {
        let path = settings.raw(dir, table);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn codes(table: SourceTable, settings: &Settings, rollups: &Rollups) -> Vec<Option<String>> {
        table
            .records(settings, rollups)
            .unwrap()
            .map(|r| r.unwrap().code.map(|c| c.to_string()))
            .collect()
    }

    #[test]
    fn names_round_trip() {
        for table in SourceTable::ALL {
            assert_eq!(table.name().parse::<SourceTable>().unwrap(), table);
        }
    }

    #[test]
    fn prescriptions_roll_up_ndcs() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::rooted_at(dir.path());
        write(
            &settings,
            "hosp",
            "prescriptions",
            "subject_id,hadm_id,starttime,drug,ndc\n\
             1,10,2180-01-01 10:00:00,a,00002143380\n\
             1,10,2180-01-01 10:00:00,b,0\n\
             1,10,2180-01-01 10:00:00,c,\n\
             1,10,2180-01-01 10:00:00,d,12345\n\
             1,10,2180-01-01 10:00:00,e,99999999999\n",
        );
        let rollups = rollups();
        assert_eq!(
            codes(SourceTable::Prescriptions, &settings, &rollups),
            [
                Some("rxnorm_0042".to_string()),
                None,
                Some("rxnorm_7".to_string()),
                None
            ]
        );
        assert!(countable_ndc("00002143380", &rollups));
        assert!(!countable_ndc("0", &rollups));
        assert!(!countable_ndc("12345", &rollups));
        assert!(!countable_ndc("99999999999", &rollups));
    }

    #[test]
    fn ccs_reads_both_tables() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::rooted_at(dir.path());
        write(
            &settings,
            "hosp",
            "procedures_icd",
            "subject_id,hadm_id,seq_num,chartdate,icd_code,icd_version\n\
             1,10,1,2180-01-01,3893,9\n\
             1,10,2,2180-01-01,0DTJ4ZZ,10\n\
             1,10,3,2180-01-01,3893,10\n",
        );
        write(
            &settings,
            "hosp",
            "hcpcsevents",
            "subject_id,hadm_id,chartdate,hcpcs_cd,seq_num\n1,10,2180-01-02,99213,1\n",
        );
        let rollups = rollups();
        assert_eq!(
            codes(SourceTable::Ccs, &settings, &rollups),
            [
                Some("ccs_54".to_string()),
                Some("ccs_80".to_string()),
                None,
                Some("ccs_227".to_string())
            ]
        );
    }

    #[test]
    fn diagnoses_keep_unmapped_codes() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::rooted_at(dir.path());
        write(
            &settings,
            "hosp",
            "diagnoses_icd",
            "subject_id,hadm_id,seq_num,icd_code,icd_version\n\
             1,10,1,4019,9\n\
             1,10,2,25000,9\n\
             1,10,3,I10,10\n\
             1,10,4,X,11\n",
        );
        let rollups = rollups();
        assert_eq!(
            codes(SourceTable::DiagnosesIcd, &settings, &rollups),
            [
                Some("phecode_401.1".to_string()),
                Some("icd9_25000".to_string()),
                Some("icd10_I10".to_string())
            ]
        );
    }

    #[test]
    fn measurements_carry_values() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::rooted_at(dir.path());
        write(
            &settings,
            "hosp",
            "labevents",
            "subject_id,hadm_id,itemid,charttime,value,valuenum,valueuom\n\
             1,,100,2180-01-01 10:00:00,2,2,g\n\
             1,10,100,2180-01-01 11:00:00,pos,,\n",
        );
        let rollups = rollups();
        let records: Vec<_> = SourceTable::LabEvents
            .records(&settings, &rollups)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].hadm_id, None);
        assert_eq!(records[0].numeric, Some(2.));
        assert_eq!(records[0].unit.as_deref(), Some("g"));
        assert_eq!(records[1].numeric, None);
        assert_eq!(records[1].text.as_deref(), Some("pos"));
        assert_eq!(records[1].hadm_id.as_deref(), Some("10"));
    }
}
