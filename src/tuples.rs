//! Turning source tables into per-patient intermediate tuple files.
//!
//! Each table is streamed in chunks. Every chunk becomes one `.tri` file listing *every* patient
//! of the universe, in universe order, each followed by their events from that chunk:
//!
//! ```text
//! <patient id>
//! <admission id>,<time>,<code key>,<value>
//! ...
//! <blank line>
//! ```
//!
//! Because all files share the same patient sequence they can be merged in lockstep (see
//! [`merge`](crate::merge)).
use crate::{
    dictionary::TableCodes,
    merge,
    resolve_value,
    tables::{record_time, DischargeTimes, SourceRecord},
    util, ArcStr, Code, Dictionary, EventValue, PatientUniverse, Result, Rollups, Settings,
    SourceTable, UnitDependency,
};
use itertools::Itertools;
use qu::ick_use::*;
use std::{
    fs,
    io::{self, Write},
    ops::AddAssign,
    path::Path,
};

/// One event of one patient.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Empty when the record has no admission.
    pub admission_id: ArcStr,
    /// Already in [`util::TIME_FORMAT`].
    pub time: ArcStr,
    pub code: Code,
    pub value: EventValue,
}

impl Event {
    /// Write the event as an intermediate file line. Commas in the value become `/` and line
    /// breaks become spaces, so every event stays on one line.
    pub fn write_line(&self, out: &mut impl Write) -> io::Result<()> {
        let value = self
            .value
            .to_string()
            .replace(',', "/")
            .replace(['\r', '\n'], " ");
        writeln!(
            out,
            "{},{},{},{}",
            self.admission_id, self.time, self.code, value
        )
    }
}

/// Pending events per patient, indexed by position in the universe.
#[derive(Debug)]
pub struct PatientBuckets {
    buckets: Vec<Vec<Event>>,
}

impl PatientBuckets {
    pub fn new(universe: &PatientUniverse) -> Self {
        Self {
            buckets: vec![vec![]; universe.len()],
        }
    }

    pub fn push(&mut self, position: usize, event: Event) {
        self.buckets[position].push(event);
    }

    pub fn event_count(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// Write every patient, including ones without events, in universe order.
    pub fn write(&self, path: &Path, universe: &PatientUniverse) -> Result {
        fn inner(this: &PatientBuckets, path: &Path, universe: &PatientUniverse) -> Result {
            let mut out = io::BufWriter::new(fs::File::create(path)?);
            for (id, events) in universe.iter().zip(this.buckets.iter()) {
                writeln!(out, "{}", id)?;
                for event in events {
                    event.write_line(&mut out)?;
                }
                writeln!(out)?;
            }
            out.flush()?;
            Ok(())
        }
        inner(self, path, universe)
            .with_context(|| format!("writing tuples to \"{}\"", path.display()))
    }
}

/// Records dropped while generating tuples. None of these are errors.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SkipCounts {
    /// The code isn't in the dictionary for this table (including unknown codes).
    pub not_in_dictionary: u64,
    /// The patient isn't in the patients table.
    pub unknown_patient: u64,
    /// The time couldn't be parsed.
    pub bad_time: u64,
    /// The admission has no discharge time (or the record no admission).
    pub no_discharge: u64,
}

impl SkipCounts {
    pub fn total(&self) -> u64 {
        self.not_in_dictionary + self.unknown_patient + self.bad_time + self.no_discharge
    }

    pub fn log(&self, table: &str) {
        if self.unknown_patient + self.bad_time + self.no_discharge > 0 {
            event!(
                Level::WARN,
                "{}: skipped {} records of unknown patients, {} with a bad time, {} without a \
                 discharge time",
                table,
                self.unknown_patient,
                self.bad_time,
                self.no_discharge
            );
        }
        event!(
            Level::DEBUG,
            "{}: skipped {} records with codes not in the dictionary",
            table,
            self.not_in_dictionary
        );
    }
}

impl AddAssign for SkipCounts {
    fn add_assign(&mut self, other: Self) {
        self.not_in_dictionary += other.not_in_dictionary;
        self.unknown_patient += other.unknown_patient;
        self.bad_time += other.bad_time;
        self.no_discharge += other.no_discharge;
    }
}

/// Converts the records of one table into events.
pub struct TupleGenerator<'a> {
    table: SourceTable,
    codes: TableCodes,
    units: Option<UnitDependency>,
    universe: &'a PatientUniverse,
    discharge: &'a DischargeTimes,
    skipped: SkipCounts,
}

/// An event for the string stream, alongside the event itself.
type Converted = (usize, Event, Option<Event>);

impl<'a> TupleGenerator<'a> {
    pub fn new(
        table: SourceTable,
        settings: &Settings,
        dictionary: &Dictionary,
        universe: &'a PatientUniverse,
        discharge: &'a DischargeTimes,
    ) -> Result<Self> {
        let codes = dictionary.for_table(table);
        event!(Level::INFO, "{}: {} codes in the dictionary", table, codes.codes.len());
        let units = if table.resolves_values() {
            Some(UnitDependency::load(settings.uom_path(table.name())?)?)
        } else {
            None
        };
        Ok(Self {
            table,
            codes,
            units,
            universe,
            discharge,
            skipped: SkipCounts::default(),
        })
    }

    pub fn skipped(&self) -> SkipCounts {
        self.skipped
    }

    /// Convert one record into the universe position of its patient, its event and, if the
    /// value couldn't be used, a string stream event. `None` means the record was skipped.
    pub fn convert(&mut self, record: SourceRecord) -> Option<Converted> {
        let code = match record.code {
            Some(code) if self.codes.contains(&code) => code,
            _ => {
                self.skipped.not_in_dictionary += 1;
                return None;
            }
        };
        let Some(position) = self.universe.position(&record.subject_id) else {
            self.skipped.unknown_patient += 1;
            return None;
        };
        let raw_time = if self.table.timed_by_discharge() {
            let discharge = record
                .hadm_id
                .as_deref()
                .and_then(|hadm| self.discharge.get(hadm));
            match discharge {
                Some(time) => Some(time.clone()),
                None => {
                    self.skipped.no_discharge += 1;
                    return None;
                }
            }
        } else {
            record.time
        };
        let Some(time) = record_time(raw_time.as_deref()) else {
            self.skipped.bad_time += 1;
            return None;
        };

        let has_value = self.codes.has_value(&code);
        let mut string_value = None;
        let value = match self.table {
            SourceTable::LabEvents | SourceTable::ChartEvents => {
                let units = self
                    .units
                    .as_ref()
                    .filter(|_| has_value)
                    .and_then(|units| units.get(&code.value));
                let resolution = resolve_value(
                    units,
                    record.text.as_deref(),
                    record.numeric,
                    record.unit.as_deref(),
                );
                string_value = resolution.text;
                resolution.value
            }
            SourceTable::OutputEvents => match record.text {
                Some(text) if has_value => EventValue::Text(text),
                _ => EventValue::Blank,
            },
            SourceTable::Transfers => match record.text {
                Some(careunit) => EventValue::Text(careunit),
                None => EventValue::Blank,
            },
            _ => EventValue::Blank,
        };

        let event = Event {
            admission_id: record.hadm_id.unwrap_or_else(|| "".into()),
            time,
            code,
            value,
        };
        let string_event = string_value.map(|text| Event {
            value: EventValue::Text(text.into()),
            ..event.clone()
        });
        Some((position, event, string_event))
    }

    /// Stream the table and write one intermediate file per chunk (and per chunk of the string
    /// stream, for tables that have one).
    pub fn run(&mut self, settings: &Settings, rollups: &Rollups) -> Result<SkipCounts> {
        let name = self.table.name();
        let records = self.table.records(settings, rollups)?;
        let chunks = records.chunks(settings.chunk_size);
        let mut chunk_count = 0;
        for (i, chunk) in (&chunks).into_iter().enumerate() {
            let mut buckets = PatientBuckets::new(self.universe);
            let mut string_buckets = PatientBuckets::new(self.universe);
            for record in chunk {
                if let Some((position, event, string_event)) = self.convert(record?) {
                    buckets.push(position, event);
                    if let Some(string_event) = string_event {
                        string_buckets.push(position, string_event);
                    }
                }
            }
            self.write_chunk(settings, i, &buckets, &string_buckets)?;
            chunk_count += 1;
        }
        if chunk_count == 0 {
            // an empty table still gets a file, so every patient is listed
            let empty = PatientBuckets::new(self.universe);
            self.write_chunk(settings, 0, &empty, &empty)?;
        }
        self.skipped.log(name);
        Ok(self.skipped)
    }

    fn write_chunk(
        &self,
        settings: &Settings,
        chunk: usize,
        buckets: &PatientBuckets,
        string_buckets: &PatientBuckets,
    ) -> Result {
        let name = self.table.name();
        let path = settings.tuple_dir().join(chunk_file_name(name, chunk));
        buckets.write(&path, self.universe)?;
        event!(
            Level::INFO,
            "{}: wrote {} events to \"{}\"",
            name,
            buckets.event_count(),
            path.display()
        );
        if self.table.resolves_values() {
            let path = settings
                .string_tuple_dir()
                .join(chunk_file_name(&format!("{}_string_", name), chunk));
            string_buckets.write(&path, self.universe)?;
            event!(
                Level::DEBUG,
                "{}: wrote {} string events",
                name,
                string_buckets.event_count()
            );
        }
        Ok(())
    }
}

/// The intermediate file of one chunk. Chunk numbers are zero padded so that name order is chunk
/// order when the files are merged.
pub fn chunk_file_name(prefix: &str, chunk: usize) -> String {
    format!("{}{:06}.tri", prefix, chunk)
}

/// Run the whole tuple stage: intermediate files for every table, then the two merges.
///
/// Stale intermediate files are removed first.
pub fn generate_tuples(settings: &Settings, dictionary: &Dictionary) -> Result<SkipCounts> {
    util::clear_files(&settings.tuple_dir(), "tri")?;
    util::clear_files(&settings.string_tuple_dir(), "tri")?;
    let universe = PatientUniverse::load(settings.patients_path())?;
    let rollups = Rollups::load(settings)?;
    let discharge = DischargeTimes::load(settings.raw("core", "admissions"))?;

    let mut skipped = SkipCounts::default();
    for table in SourceTable::ALL {
        event!(Level::INFO, "generating tuples of {}", table);
        let mut generator =
            TupleGenerator::new(table, settings, dictionary, &universe, &discharge)?;
        skipped += generator.run(settings, &rollups)?;
    }
    event!(Level::INFO, "skipped {} records in total", skipped.total());

    merge::merge_dir(
        &settings.tuple_dir(),
        &settings.tuples_path(),
        settings.merge_batch,
    )?;
    merge::merge_dir(
        &settings.string_tuple_dir(),
        &settings.string_tuples_path(),
        settings.merge_batch,
    )?;
    Ok(skipped)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{CodeType, DictionaryEntry, ItemUnits};

    fn universe() -> PatientUniverse {
        PatientUniverse::new(["P1".into(), "P2".into()])
    }

    fn dictionary(entries: &[(&str, SourceTable, bool)]) -> Dictionary {
        Dictionary::merge(entries.iter().map(|(code, table, with_value)| DictionaryEntry {
            index: 0,
            code: (*code).into(),
            code_type: CodeType::Mimic,
            value_frequency: 0,
            total_frequency: 1000,
            source_table: table.name().into(),
            unit_of_measurement: String::new(),
            with_value: *with_value,
        }))
    }

    fn record(patient: &str, item: &str, time: &str) -> SourceRecord {
        SourceRecord {
            subject_id: patient.into(),
            hadm_id: Some("10".into()),
            time: Some(time.into()),
            raw_code: item.into(),
            code: Some(Code::new(CodeType::Mimic, item)),
            text: None,
            numeric: None,
            unit: None,
        }
    }

    fn generator<'a>(
        table: SourceTable,
        dictionary: &Dictionary,
        universe: &'a PatientUniverse,
        discharge: &'a DischargeTimes,
        units: Option<UnitDependency>,
    ) -> TupleGenerator<'a> {
        TupleGenerator {
            table,
            codes: dictionary.for_table(table),
            units,
            universe,
            discharge,
            skipped: SkipCounts::default(),
        }
    }

    #[test]
    fn intermediate_format() {
        let universe = universe();
        let mut buckets = PatientBuckets::new(&universe);
        buckets.push(
            1,
            Event {
                admission_id: "".into(),
                time: "2180-01-01 00:00:00".into(),
                code: Code::new(CodeType::Transfer, "ED"),
                value: EventValue::Text("a, b".into()),
            },
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(chunk_file_name("transfers", 0));
        buckets.write(&path, &universe).unwrap();
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "P1\n\nP2\n,2180-01-01 00:00:00,transfer_ED,a/ b\n\n"
        );
    }

    #[test]
    fn line_breaks_stay_on_one_line() {
        let universe = universe();
        let mut buckets = PatientBuckets::new(&universe);
        buckets.push(
            0,
            Event {
                admission_id: "10".into(),
                time: "2180-01-01 00:00:00".into(),
                code: Code::new(CodeType::Transfer, "admit"),
                value: EventValue::Text("Surgery\r\nCardiac\n\nUnit".into()),
            },
        );
        let dir = tempfile::tempdir().unwrap();
        buckets
            .write(&dir.path().join(chunk_file_name("transfers", 0)), &universe)
            .unwrap();
        let out = dir.path().join("tuples.csv");
        let stats = merge::merge_dir(dir.path(), &out, 1).unwrap();
        assert_eq!(stats.rows, 1);
        assert_eq!(
            fs::read_to_string(&out).unwrap(),
            "patient_id,admission_id,time,code,value\n\
             P1,10,2180-01-01 00:00:00,transfer_admit,Surgery  Cardiac  Unit\n"
        );
    }

    #[test]
    fn many_chunks_merge_in_chunk_order() {
        let universe = universe();
        let dir = tempfile::tempdir().unwrap();
        for chunk in 0..12 {
            let mut buckets = PatientBuckets::new(&universe);
            buckets.push(
                0,
                Event {
                    admission_id: "".into(),
                    time: "2180-01-01 00:00:00".into(),
                    code: Code::new(CodeType::Mimic, chunk.to_string()),
                    value: EventValue::Blank,
                },
            );
            let path = dir.path().join(chunk_file_name("labevents", chunk));
            buckets.write(&path, &universe).unwrap();
        }
        let out = dir.path().join("tuples.csv");
        merge::merge_dir(dir.path(), &out, 5).unwrap();
        let text = fs::read_to_string(&out).unwrap();
        let codes = text
            .lines()
            .skip(1)
            .map(|l| l.split(',').nth(3).unwrap().to_string())
            .collect::<Vec<_>>();
        let expected = (0..12).map(|i| format!("mimic_{}", i)).collect::<Vec<_>>();
        assert_eq!(codes, expected);
    }

    #[test]
    fn records_are_filtered_and_counted() {
        let universe = universe();
        let discharge = DischargeTimes::default();
        let dict = dictionary(&[("1", SourceTable::InputEvents, false)]);
        let mut gen = generator(SourceTable::InputEvents, &dict, &universe, &discharge, None);

        let (pos, event, string) = gen.convert(record("P2", "1", "2180-01-01")).unwrap();
        assert_eq!(pos, 1);
        assert_eq!(&*event.time, "2180-01-01 00:00:00");
        assert_eq!(event.value, EventValue::Blank);
        assert!(string.is_none());

        assert!(gen.convert(record("P2", "2", "2180-01-01")).is_none());
        assert!(gen.convert(record("P9", "1", "2180-01-01")).is_none());
        assert!(gen.convert(record("P1", "1", "yesterday")).is_none());
        let mut unknown = record("P1", "1", "2180-01-01");
        unknown.code = None;
        assert!(gen.convert(unknown).is_none());
        assert_eq!(
            gen.skipped(),
            SkipCounts {
                not_in_dictionary: 2,
                unknown_patient: 1,
                bad_time: 1,
                no_discharge: 0,
            }
        );
    }

    #[test]
    fn discharge_times() {
        let universe = universe();
        let discharge: DischargeTimes = [(
            ArcStr::from("10"),
            ArcStr::from("2180-02-01 12:00:00"),
        )]
        .into_iter()
        .collect();
        let dict = dictionary(&[("1", SourceTable::DrgCodes, false)]);
        let mut gen = generator(SourceTable::DrgCodes, &dict, &universe, &discharge, None);
        let mut rec = record("P1", "1", "ignored");
        rec.time = None;
        let (_, event, _) = gen.convert(rec.clone()).unwrap();
        assert_eq!(&*event.time, "2180-02-01 12:00:00");
        rec.hadm_id = Some("11".into());
        assert!(gen.convert(rec).is_none());
        assert_eq!(gen.skipped().no_discharge, 1);
    }

    #[test]
    fn lab_values() {
        let universe = universe();
        let discharge = DischargeTimes::default();
        let dict = dictionary(&[
            ("100", SourceTable::LabEvents, true),
            ("300", SourceTable::LabEvents, false),
        ]);
        let units: UnitDependency = [(
            ArcStr::from("100"),
            ItemUnits::new(Some("mg"), [("g".to_string(), 1000.)]),
        )]
        .into_iter()
        .collect();
        let mut gen = generator(
            SourceTable::LabEvents,
            &dict,
            &universe,
            &discharge,
            Some(units),
        );

        let mut rec = record("P1", "100", "2180-01-01 10:00:00");
        rec.text = Some("2".into());
        rec.numeric = Some(2.);
        rec.unit = Some("g".into());
        let (_, event, string) = gen.convert(rec.clone()).unwrap();
        assert_eq!(event.value.to_string(), "2000.0");
        assert!(string.is_none());

        rec.unit = Some("mmol".into());
        let (_, event, string) = gen.convert(rec).unwrap();
        assert_eq!(event.value, EventValue::String);
        assert_eq!(string.unwrap().value.to_string(), "2#mmol");

        let mut rec = record("P1", "300", "2180-01-01 10:00:00");
        rec.text = Some("neg".into());
        let (_, event, string) = gen.convert(rec).unwrap();
        assert_eq!(event.value.to_string(), "_STRING");
        assert_eq!(string.unwrap().value.to_string(), "neg");
    }
}
