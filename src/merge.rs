//! Lockstep merging of intermediate tuple files.
use crate::{util, PatientId, PrepError, Result};
use qu::ick_use::*;
use std::{
    fs,
    io::{self, BufRead},
    path::{Path, PathBuf},
};

/// One event line of an intermediate file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleLine {
    pub admission_id: String,
    pub time: String,
    pub code: String,
    pub value: String,
}

impl TupleLine {
    fn parse(line: &str) -> Result<Self> {
        let mut parts = line.splitn(4, ',');
        let mut next = || parts.next().map(str::to_string);
        let (Some(admission_id), Some(time), Some(code)) = (next(), next(), next()) else {
            bail!("malformed tuple line \"{}\"", line)
        };
        Ok(Self {
            admission_id,
            time,
            code,
            value: next().unwrap_or_default(),
        })
    }
}

/// A patient and their events, as read from one file.
pub type PatientTuples = (PatientId, Vec<TupleLine>);

/// Reads patient blocks from an intermediate file.
pub struct IntermediateReader {
    path: PathBuf,
    lines: io::Lines<io::BufReader<fs::File>>,
    /// Patients read so far.
    position: usize,
}

impl IntermediateReader {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = fs::File::open(&path)
            .with_context(|| format!("opening intermediate file \"{}\"", path.display()))?;
        Ok(Self {
            path,
            lines: io::BufReader::new(file).lines(),
            position: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn next_line(&mut self) -> Result<Option<String>> {
        match self.lines.next() {
            Some(line) => {
                let mut line = line
                    .with_context(|| format!("reading \"{}\"", self.path.display()))?;
                if line.ends_with('\r') {
                    line.pop();
                }
                Ok(Some(line))
            }
            None => Ok(None),
        }
    }

    /// Read up to `size` patients. An empty batch means the file is exhausted.
    pub fn read_batch(&mut self, size: usize) -> Result<Vec<PatientTuples>> {
        let mut batch = vec![];
        while batch.len() < size {
            let patient = match self.next_line()? {
                Some(line) if !line.is_empty() => line,
                _ => break,
            };
            let mut events = vec![];
            while let Some(line) = self.next_line()? {
                if line.is_empty() {
                    break;
                }
                let event = TupleLine::parse(&line)
                    .with_context(|| format!("in \"{}\"", self.path.display()))?;
                events.push(event);
            }
            batch.push((PatientId::from(patient), events));
        }
        self.position += batch.len();
        Ok(batch)
    }
}

/// What a merge wrote.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MergeStats {
    pub patients: usize,
    pub rows: usize,
}

/// Check every batch lists the same patients in the same order as the first.
fn check_lockstep(readers: &[IntermediateReader], batches: &[Vec<PatientTuples>]) -> Result {
    let (first_reader, first) = (&readers[0], &batches[0]);
    let start = first_reader.position - first.len();
    for (reader, batch) in readers.iter().zip(batches.iter()).skip(1) {
        let len = first.len().max(batch.len());
        for i in 0..len {
            let expected = first.get(i).map(|(id, _)| &**id);
            let found = batch.get(i).map(|(id, _)| &**id);
            if expected != found {
                return Err(PrepError::Synchronization {
                    file: reader.path().to_owned(),
                    position: start + i,
                    expected: expected.unwrap_or("end of file").to_string(),
                    found: found.unwrap_or("end of file").to_string(),
                }
                .into());
            }
        }
    }
    Ok(())
}

/// Merge every `.tri` file in `dir` into one csv at `out_path`.
///
/// Files are read `batch_size` patients at a time; all of them must list the same patients in
/// the same order. Each patient's events from all files are concatenated (in file name order)
/// and stably sorted by time. Patients without any events are left out. Merging stops as soon
/// as any file runs out of patients.
pub fn merge_dir(dir: &Path, out_path: &Path, batch_size: usize) -> Result<MergeStats> {
    ensure!(batch_size > 0, "merge batch size must be positive");
    event!(Level::INFO, "merging tuples in \"{}\"", dir.display());
    let mut readers = util::files_with_extension(dir, "tri")?
        .into_iter()
        .map(IntermediateReader::open)
        .collect::<Result<Vec<_>>>()?;

    let mut writer = crate::csv_writer(out_path)?;
    writer.write_record(["patient_id", "admission_id", "time", "code", "value"])?;
    let mut stats = MergeStats::default();

    'outer: while !readers.is_empty() {
        let mut batches = Vec::with_capacity(readers.len());
        for reader in readers.iter_mut() {
            let batch = reader.read_batch(batch_size)?;
            if batch.is_empty() {
                break 'outer;
            }
            batches.push(batch);
        }
        check_lockstep(&readers, &batches)?;

        let mut batches = batches.into_iter().map(Vec::into_iter).collect::<Vec<_>>();
        for (patient, mut events) in batches[0].by_ref().collect::<Vec<_>>() {
            for other in batches[1..].iter_mut() {
                if let Some((_, more)) = other.next() {
                    events.extend(more);
                }
            }
            if events.is_empty() {
                continue;
            }
            events.sort_by(|a, b| a.time.cmp(&b.time));
            for event in events.iter() {
                writer.write_record([
                    &*patient,
                    event.admission_id.as_str(),
                    event.time.as_str(),
                    event.code.as_str(),
                    event.value.as_str(),
                ])?;
            }
            stats.patients += 1;
            stats.rows += events.len();
        }
    }
    writer
        .flush()
        .with_context(|| format!("writing \"{}\"", out_path.display()))?;
    event!(
        Level::INFO,
        "merged {} rows of {} patients into \"{}\"",
        stats.rows,
        stats.patients,
        out_path.display()
    );
    Ok(stats)
}

#[cfg(test)]
mod test {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    #[test]
    fn merge_orders_by_time() {
        let dir = tempfile::tempdir().unwrap();
        let tri = dir.path().join("tuple");
        fs::create_dir(&tri).unwrap();
        write(
            &tri,
            "a0.tri",
            "P1\n1,2180-01-01 03:00:00,ccs_1,\n1,2180-01-01 01:00:00,ccs_2,\n\nP2\n\nP3\n\n",
        );
        write(
            &tri,
            "b0.tri",
            "P1\n1,2180-01-01 02:00:00,mimic_3,5.0\n\nP2\n\nP3\n,2180-01-01 00:00:00,transfer_ED,\n\n",
        );
        let out = dir.path().join("tuples.csv");
        let stats = merge_dir(&tri, &out, 2).unwrap();
        assert_eq!(stats, MergeStats { patients: 2, rows: 4 });
        assert_eq!(
            fs::read_to_string(&out).unwrap(),
            "patient_id,admission_id,time,code,value\n\
             P1,1,2180-01-01 01:00:00,ccs_2,\n\
             P1,1,2180-01-01 02:00:00,mimic_3,5.0\n\
             P1,1,2180-01-01 03:00:00,ccs_1,\n\
             P3,,2180-01-01 00:00:00,transfer_ED,\n"
        );
    }

    #[test]
    fn ties_keep_file_order() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a0.tri", "P1\n,2180-01-01 00:00:00,ccs_1,\n\n");
        write(dir.path(), "b0.tri", "P1\n,2180-01-01 00:00:00,ccs_2,\n\n");
        let out = dir.path().join("out.csv");
        merge_dir(dir.path(), &out, 10).unwrap();
        let text = fs::read_to_string(&out).unwrap();
        let codes = text
            .lines()
            .skip(1)
            .map(|l| l.split(',').nth(3).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(codes, ["ccs_1", "ccs_2"]);
    }

    #[test]
    fn out_of_step_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a0.tri", "P1\n\nP2\n\n");
        write(dir.path(), "b0.tri", "P1\n\nP3\n\n");
        let err = merge_dir(dir.path(), &dir.path().join("out.csv"), 10).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PrepError>(),
            Some(PrepError::Synchronization { position: 1, expected, found, .. })
                if expected == "P2" && found == "P3"
        ));
    }

    #[test]
    fn empty_dir_writes_header() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.csv");
        let stats = merge_dir(dir.path(), &out, 10).unwrap();
        assert_eq!(stats, MergeStats::default());
        assert_eq!(
            fs::read_to_string(&out).unwrap(),
            "patient_id,admission_id,time,code,value\n"
        );
    }
}
