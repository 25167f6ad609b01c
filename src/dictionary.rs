//! Building the code dictionary.
//!
//! Each source table is counted into a fragment (`<table>_dict.dict`), rare codes dropped, and
//! the fragments merged into one indexed dictionary.
use crate::{
    normalize_unit,
    tables::{countable_ndc, SourceRecord},
    util::{self, bool_01, ser_bool_01},
    ArcStr, Code, CodeType, ItemUnits, PrepError, Result, Rollups, Settings, SourceTable,
    UnitDependency,
};
use itertools::Itertools;
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    ops::Deref,
    path::Path,
};

/// One row of the code dictionary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DictionaryEntry {
    /// 1-based position in the merged dictionary. Fragments don't have one yet.
    #[serde(default)]
    pub index: usize,
    pub code: ArcStr,
    pub code_type: CodeType,
    pub value_frequency: u64,
    pub total_frequency: u64,
    pub source_table: ArcStr,
    /// The normalized canonical unit. Empty unless `with_value`.
    #[serde(default)]
    pub unit_of_measurement: String,
    #[serde(deserialize_with = "bool_01", serialize_with = "ser_bool_01")]
    pub with_value: bool,
}

impl DictionaryEntry {
    fn plain(table: SourceTable, code: Code, total_frequency: u64) -> Self {
        Self {
            index: 0,
            code: code.value,
            code_type: code.ty,
            value_frequency: 0,
            total_frequency,
            source_table: table.name().into(),
            unit_of_measurement: String::new(),
            with_value: false,
        }
    }

    pub fn code(&self) -> Code {
        Code::new(self.code_type, self.code.clone())
    }
}

/// How fragments are written: the dictionary row without its index.
#[derive(Serialize)]
struct FragmentRow<'a> {
    code: &'a str,
    code_type: CodeType,
    value_frequency: u64,
    total_frequency: u64,
    source_table: &'a str,
    unit_of_measurement: &'a str,
    #[serde(serialize_with = "ser_bool_01")]
    with_value: bool,
}

impl<'a> From<&'a DictionaryEntry> for FragmentRow<'a> {
    fn from(entry: &'a DictionaryEntry) -> Self {
        Self {
            code: &entry.code,
            code_type: entry.code_type,
            value_frequency: entry.value_frequency,
            total_frequency: entry.total_frequency,
            source_table: &entry.source_table,
            unit_of_measurement: &entry.unit_of_measurement,
            with_value: entry.with_value,
        }
    }
}

/// Occurrence counts for a table whose codes never carry a value.
#[derive(Debug, Default)]
pub struct FrequencyCounter {
    counts: HashMap<Code, u64>,
    unknown: u64,
    raw_codes: HashSet<ArcStr>,
}

impl FrequencyCounter {
    pub fn add(&mut self, record: &SourceRecord) {
        if !self.raw_codes.contains(&record.raw_code) {
            self.raw_codes.insert(record.raw_code.clone());
        }
        match &record.code {
            Some(code) => *self.counts.entry(code.clone()).or_insert(0) += 1,
            None => self.unknown += 1,
        }
    }

    /// How many occurrences had no roll-up target.
    pub fn unknown(&self) -> u64 {
        self.unknown
    }

    pub fn get(&self, code: &Code) -> u64 {
        self.counts.get(code).copied().unwrap_or(0)
    }

    /// Keep codes seen at least `min_frequency` times, least frequent first.
    pub fn into_fragment(self, table: SourceTable, min_frequency: u64) -> Vec<DictionaryEntry> {
        let mut entries = self
            .counts
            .into_iter()
            .filter(|(_, total)| *total >= min_frequency)
            .map(|(code, total)| DictionaryEntry::plain(table, code, total))
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| {
            let key = |e: &DictionaryEntry| (e.total_frequency, e.code_type, e.code.clone());
            key(a).cmp(&key(b))
        });
        entries
    }
}

/// Whether every accepted value of an item has been the same.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Constant {
    Unseen,
    Same(f64),
    Varies,
}

impl Default for Constant {
    fn default() -> Self {
        Constant::Unseen
    }
}

impl Constant {
    fn observe(self, value: f64) -> Self {
        match self {
            Constant::Unseen => Constant::Same(value),
            Constant::Same(v) if v == value => self,
            _ => Constant::Varies,
        }
    }

    fn merge(self, other: Constant) -> Self {
        match other {
            Constant::Unseen => self,
            Constant::Same(v) => self.observe(v),
            Constant::Varies => Constant::Varies,
        }
    }
}

/// Counts for one item of a value table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemStats {
    pub total: u64,
    /// Occurrences with an accepted value.
    pub value: u64,
    pub constant: Constant,
}

/// Occurrence and value counts for a value table.
///
/// Owned by whoever is doing the counting. Counts for separate chunks can be built separately and
/// then merged.
#[derive(Debug, Clone, Default)]
pub struct ValueStats {
    items: HashMap<ArcStr, ItemStats>,
}

impl ValueStats {
    /// Record one occurrence of `itemid`. `units` is the item's unit dependency entry.
    pub fn observe(
        &mut self,
        itemid: &ArcStr,
        units: &ItemUnits,
        numeric: Option<f64>,
        unit: Option<&str>,
    ) {
        let stats = self.items.entry(itemid.clone()).or_default();
        stats.total += 1;
        let Some(numeric) = numeric else {
            return;
        };
        if let Some(value) = units.accept(numeric, &normalize_unit(unit)) {
            stats.value += 1;
            stats.constant = stats.constant.observe(value);
        }
    }

    pub fn merge(&mut self, other: ValueStats) {
        for (itemid, other) in other.items {
            let stats = self.items.entry(itemid).or_default();
            stats.total += other.total;
            stats.value += other.value;
            stats.constant = stats.constant.merge(other.constant);
        }
    }

    pub fn get(&self, itemid: &str) -> Option<&ItemStats> {
        self.items.get(itemid)
    }

    /// Keep items seen at least `min_frequency` times.
    ///
    /// An item carries a value when at least `min_frequency` of its occurrences had an accepted
    /// value and those values weren't all the same. Entries are ordered by `with_value`, then
    /// least frequent first.
    pub fn into_fragment(
        self,
        table: SourceTable,
        units: &UnitDependency,
        min_frequency: u64,
    ) -> Vec<DictionaryEntry> {
        let mut entries = vec![];
        for (itemid, stats) in self.items {
            if stats.total < min_frequency {
                continue;
            }
            let with_value = stats.value >= min_frequency && stats.constant == Constant::Varies;
            let mut entry =
                DictionaryEntry::plain(table, Code::new(CodeType::Mimic, itemid), stats.total);
            if with_value {
                entry.with_value = true;
                entry.value_frequency = stats.value;
                entry.unit_of_measurement = units
                    .get(&entry.code)
                    .and_then(ItemUnits::main)
                    .unwrap_or("nan")
                    .to_string();
            }
            entries.push(entry);
        }
        entries.sort_by(|a, b| {
            (a.with_value, a.total_frequency, &a.code).cmp(&(
                b.with_value,
                b.total_frequency,
                &b.code,
            ))
        });
        entries
    }
}

/// Count one source table into dictionary entries.
pub fn count_table(
    table: SourceTable,
    settings: &Settings,
    rollups: &Rollups,
) -> Result<Vec<DictionaryEntry>> {
    event!(Level::INFO, "generating dictionary fragment for {}", table);
    let records = table.records(settings, rollups)?;
    let entries = if table.has_values() {
        let units = UnitDependency::load(settings.uom_path(table.name())?)?;
        let mut stats = ValueStats::default();
        let chunks = records.chunks(settings.chunk_size);
        for (i, chunk) in (&chunks).into_iter().enumerate() {
            let mut chunk_stats = ValueStats::default();
            for record in chunk {
                let record = record?;
                // only items with a unit dependency entry are counted
                let Some(item_units) = units.get(&record.raw_code) else {
                    continue;
                };
                chunk_stats.observe(
                    &record.raw_code,
                    item_units,
                    record.numeric,
                    record.unit.as_deref(),
                );
            }
            event!(Level::DEBUG, "counted chunk {} of {}", i, table);
            stats.merge(chunk_stats);
        }
        stats.into_fragment(table, &units, settings.min_frequency)
    } else {
        let mut counter = FrequencyCounter::default();
        let mut malformed_ndcs = 0;
        for record in records {
            let record = record?;
            if table == SourceTable::Prescriptions && !countable_ndc(&record.raw_code, rollups) {
                malformed_ndcs += 1;
                continue;
            }
            counter.add(&record);
        }
        if malformed_ndcs > 0 {
            event!(
                Level::INFO,
                "{}: {} malformed or unmapped NDCs not counted",
                table,
                malformed_ndcs
            );
        }
        event!(
            Level::INFO,
            "{}: {} distinct codes before roll-up, {} unknown occurrences",
            table,
            counter.raw_codes.len(),
            counter.unknown()
        );
        counter.into_fragment(table, settings.min_frequency)
    };
    log_type_stats(table.name(), &entries);
    Ok(entries)
}

/// Write a dictionary fragment (no index column).
pub fn write_fragment(path: impl AsRef<Path>, entries: &[DictionaryEntry]) -> Result {
    let path = path.as_ref();
    let mut writer = crate::csv_writer(path)?;
    for entry in entries {
        writer.serialize(FragmentRow::from(entry))?;
    }
    writer
        .flush()
        .with_context(|| format!("writing fragment \"{}\"", path.display()))?;
    Ok(())
}

/// Read a dictionary fragment or a merged dictionary.
pub fn read_entries(path: impl AsRef<Path>) -> Result<Vec<DictionaryEntry>> {
    crate::read_csv(path)?.collect()
}

/// Item ids recorded in both chartevents and labevents. The item dictionary marks them as linking
/// to chartevents with category `Labs`.
pub fn duplicate_lab_items(d_items: &Path) -> Result<HashSet<ArcStr>> {
    #[derive(Deserialize)]
    struct ItemRaw {
        itemid: ArcStr,
        #[serde(default)]
        linksto: String,
        #[serde(default)]
        category: String,
    }

    if !util::path_exists(d_items)? {
        return Err(PrepError::MissingReference {
            path: d_items.to_owned(),
        }
        .into());
    }
    let mut out = HashSet::new();
    for row in crate::read_csv::<ItemRaw>(d_items)? {
        let row = row?;
        if row.linksto == "chartevents" && row.category == "Labs" {
            out.insert(row.itemid);
        }
    }
    Ok(out)
}

/// Drop chartevents codes that duplicate labevents items from the chartevents fragment.
pub fn remove_duplicate_codes(settings: &Settings) -> Result {
    let duplicates = duplicate_lab_items(&settings.raw("icu", "d_items"))?;
    event!(
        Level::INFO,
        "{} chartevents items duplicate lab items",
        duplicates.len()
    );
    let table = SourceTable::ChartEvents;
    let path = settings.fragment_path(table.name());
    let entries = read_entries(&path)?;
    let before = entries.len();
    let entries = entries
        .into_iter()
        .filter(|e| &*e.source_table != table.name() || !duplicates.contains(&e.code))
        .collect::<Vec<_>>();
    event!(
        Level::INFO,
        "removed {} duplicate codes from {}",
        before - entries.len(),
        table
    );
    write_fragment(&path, &entries)
}

/// The merged code dictionary.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    els: Vec<DictionaryEntry>,
    code_idx: HashMap<Code, usize>,
}

impl Dictionary {
    /// Merge fragments: stable sort by code type (by name), then `with_value`, then total
    /// frequency, and number the entries from 1.
    pub fn merge(fragments: impl IntoIterator<Item = DictionaryEntry>) -> Self {
        let mut els = fragments.into_iter().collect::<Vec<_>>();
        els.sort_by_key(|e| (e.code_type, e.with_value, e.total_frequency));
        for (i, entry) in els.iter_mut().enumerate() {
            entry.index = i + 1;
        }
        Self::from_entries(els)
    }

    fn from_entries(els: Vec<DictionaryEntry>) -> Self {
        let mut code_idx = HashMap::new();
        for (idx, entry) in els.iter().enumerate() {
            if code_idx.insert(entry.code(), idx).is_some() {
                event!(
                    Level::WARN,
                    "code {} appears in the dictionary more than once",
                    entry.code()
                );
            }
        }
        Self { els, code_idx }
    }

    /// Merge every fragment in `dir`, reading them in file name order.
    pub fn merge_dir(dir: &Path) -> Result<Self> {
        let mut entries = vec![];
        for path in util::files_with_extension(dir, "dict")? {
            event!(Level::DEBUG, "merging fragment \"{}\"", path.display());
            entries.extend(read_entries(&path)?);
        }
        Ok(Self::merge(entries))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let els = read_entries(path)
            .with_context(|| format!("loading dictionary from \"{}\"", path.display()))?;
        Ok(Self::from_entries(els))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result {
        let path = path.as_ref();
        let mut writer = crate::csv_writer(path)?;
        for entry in self.els.iter() {
            writer.serialize(entry)?;
        }
        writer
            .flush()
            .with_context(|| format!("writing dictionary \"{}\"", path.display()))?;
        Ok(())
    }

    pub fn get(&self, code: &Code) -> Option<&DictionaryEntry> {
        self.code_idx.get(code).map(|idx| &self.els[*idx])
    }

    pub fn get_mut(&mut self, code: &Code) -> Option<&mut DictionaryEntry> {
        let idx = *self.code_idx.get(code)?;
        self.els.get_mut(idx)
    }

    /// The codes of one source table.
    pub fn for_table(&self, table: SourceTable) -> TableCodes {
        let mut out = TableCodes::default();
        for entry in self.els.iter().filter(|e| &*e.source_table == table.name()) {
            if entry.with_value {
                out.with_value.insert(entry.code());
            }
            out.codes.insert(entry.code());
        }
        out
    }

    /// Log summary statistics for the whole dictionary and for the codes with value.
    pub fn log_summary(&self) {
        let value_entries = self.els.iter().filter(|e| e.with_value).collect::<Vec<_>>();
        if !value_entries.is_empty() {
            let ratio = value_entries
                .iter()
                .map(|e| e.value_frequency as f64 / e.total_frequency as f64)
                .sum::<f64>()
                / value_entries.len() as f64;
            event!(Level::INFO, "mean value/total ratio: {:.4}", ratio);
        }
        event!(
            Level::INFO,
            "total value frequency {}, total frequency {}",
            self.els.iter().map(|e| e.value_frequency).sum::<u64>(),
            self.els.iter().map(|e| e.total_frequency).sum::<u64>()
        );
        let rows = [
            FrequencyStats::of("all", self.els.iter().map(|e| e.total_frequency)),
            FrequencyStats::of("value", value_entries.iter().map(|e| e.value_frequency)),
        ];
        let rows = rows.into_iter().flatten().collect::<Vec<_>>();
        event!(Level::INFO, "\n{}", stats_table(&rows).for_terminal());
    }
}

impl Deref for Dictionary {
    type Target = [DictionaryEntry];
    fn deref(&self) -> &Self::Target {
        &self.els
    }
}

/// The dictionary codes of one source table.
#[derive(Debug, Clone, Default)]
pub struct TableCodes {
    pub codes: HashSet<Code>,
    pub with_value: HashSet<Code>,
}

impl TableCodes {
    pub fn contains(&self, code: &Code) -> bool {
        self.codes.contains(code)
    }

    pub fn has_value(&self, code: &Code) -> bool {
        self.with_value.contains(code)
    }
}

/// Count, sum, mean, median, max and min of a set of frequencies.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyStats {
    pub label: String,
    pub count: usize,
    pub sum: u64,
    pub mean: f64,
    pub median: f64,
    pub max: u64,
    pub min: u64,
}

impl FrequencyStats {
    /// `None` if there are no frequencies.
    pub fn of(label: impl Into<String>, freqs: impl Iterator<Item = u64>) -> Option<Self> {
        let freqs = freqs.sorted().collect::<Vec<_>>();
        let count = freqs.len();
        let (&min, &max) = (freqs.first()?, freqs.last()?);
        let sum = freqs.iter().sum::<u64>();
        let median = if count % 2 == 1 {
            freqs[count / 2] as f64
        } else {
            (freqs[count / 2 - 1] + freqs[count / 2]) as f64 / 2.
        };
        Some(Self {
            label: label.into(),
            count,
            sum,
            mean: sum as f64 / count as f64,
            median,
            max,
            min,
        })
    }
}

pub fn stats_table(rows: &[FrequencyStats]) -> term_data_table::Table {
    use term_data_table::{Cell, Row, Table};
    let mut table = Table::new().with_row(
        ["type", "codes", "frequency", "mean", "median", "max", "min"]
            .into_iter()
            .fold(Row::new(), |row, h| row.with_cell(Cell::from(h))),
    );
    for stats in rows {
        table.add_row(
            Row::new()
                .with_cell(Cell::from(stats.label.clone()))
                .with_cell(Cell::from(stats.count.to_string()))
                .with_cell(Cell::from(stats.sum.to_string()))
                .with_cell(Cell::from(format!("{:.0}", stats.mean)))
                .with_cell(Cell::from(stats.median.to_string()))
                .with_cell(Cell::from(stats.max.to_string()))
                .with_cell(Cell::from(stats.min.to_string())),
        );
    }
    table
}

/// Log frequency statistics per code type of a fragment.
fn log_type_stats(table: &str, entries: &[DictionaryEntry]) {
    let rows = entries
        .iter()
        .map(|e| e.code_type)
        .unique()
        .sorted()
        .filter_map(|ty| {
            FrequencyStats::of(
                ty.as_str(),
                entries
                    .iter()
                    .filter(|e| e.code_type == ty)
                    .map(|e| e.total_frequency),
            )
        })
        .collect::<Vec<_>>();
    if rows.is_empty() {
        event!(Level::WARN, "no codes of {} reached the frequency threshold", table);
    } else {
        event!(Level::INFO, "{}:\n{}", table, stats_table(&rows).for_terminal());
    }
}

/// Run the whole dictionary stage, returning the merged dictionary.
///
/// Stale fragments are removed first, so the result only depends on the inputs.
pub fn generate_dictionary(settings: &Settings) -> Result<Dictionary> {
    let index_dir = settings.index_dir();
    util::clear_files(&index_dir, "dict")?;
    let rollups = Rollups::load(settings)?;
    for table in SourceTable::ALL {
        let entries = count_table(table, settings, &rollups)?;
        write_fragment(settings.fragment_path(table.name()), &entries)?;
    }
    remove_duplicate_codes(settings)?;

    event!(Level::INFO, "merging dictionary fragments");
    let dictionary = Dictionary::merge_dir(&index_dir)?;
    dictionary.save(settings.code_dict_path())?;
    dictionary.log_summary();
    event!(
        Level::INFO,
        "wrote {} codes to \"{}\"",
        dictionary.len(),
        settings.code_dict_path().display()
    );
    Ok(dictionary)
}
