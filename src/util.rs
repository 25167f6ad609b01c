use crate::{ArcStr, Result};
use chrono::{NaiveDate, NaiveDateTime};
use qu::ick_use::*;
use serde::{Deserialize, Deserializer, Serializer};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

/// How timestamps are written to tuple files. Sorting these strings sorts by time.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Converts a not found error to Ok(false)
pub fn path_exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if matches!(e.kind(), io::ErrorKind::NotFound) => Ok(false),
        Err(e) => Err(e),
    }
}

/// All files in `dir` with the given extension, sorted by name.
pub fn files_with_extension(dir: &Path, ext: &str) -> Result<Vec<PathBuf>> {
    let mut out = vec![];
    for entry in fs::read_dir(dir).with_context(|| format!("listing \"{}\"", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && matches!(path.extension(), Some(e) if e == ext) {
            out.push(path);
        }
    }
    out.sort();
    Ok(out)
}

/// Delete files left over from an earlier run, so a stage always starts from scratch.
pub fn clear_files(dir: &Path, ext: &str) -> Result {
    fs::create_dir_all(dir).with_context(|| format!("creating \"{}\"", dir.display()))?;
    for path in files_with_extension(dir, ext)? {
        event!(Level::DEBUG, "removing stale file \"{}\"", path.display());
        fs::remove_file(&path).with_context(|| format!("removing \"{}\"", path.display()))?;
    }
    Ok(())
}

/// Parse a timestamp as it appears in the extracts. Date-only values are taken as midnight.
pub fn parse_datetime(input: &str) -> Option<NaiveDateTime> {
    let input = input.trim();
    for fmt in [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(input, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Normalize a timestamp to [`TIME_FORMAT`].
pub fn format_datetime(input: &str) -> Option<ArcStr> {
    parse_datetime(input).map(|dt| dt.format(TIME_FORMAT).to_string().into())
}

/// Render a float the way the tuple files expect, i.e. as Python's `repr` does.
///
/// Integral values keep one decimal place (`2000.0`), everything else uses the shortest
/// representation that round-trips. Magnitudes below `1e-4` or from `1e16` up use exponent
/// notation with a signed, at least two digit exponent (`1e-05`, `1.5e+16`).
pub fn format_number(v: f64) -> String {
    if v.is_nan() {
        return "nan".into();
    }
    if v.is_infinite() {
        return if v > 0. { "inf" } else { "-inf" }.into();
    }
    let abs = v.abs();
    if abs != 0. && !(1e-4..1e16).contains(&abs) {
        let sci = format!("{:e}", v);
        return match sci.split_once('e') {
            Some((mantissa, exp)) => match exp.parse::<i32>() {
                Ok(exp) => format!(
                    "{}e{}{:02}",
                    mantissa,
                    if exp < 0 { '-' } else { '+' },
                    exp.abs()
                ),
                Err(_) => sci,
            },
            None => sci,
        };
    }
    if v.fract() == 0. {
        format!("{:.1}", v)
    } else {
        format!("{}", v)
    }
}

// Helpers for serde to parse fields with quirks.

/// Parse a string, but map "null" to `None` (in addition to the default "" -> None mapping)
pub fn optional_string<'de, D>(d: D) -> Result<Option<ArcStr>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Deserialize::deserialize(d)?;
    match s {
        Some(s) if !(s.eq_ignore_ascii_case("null") || s.is_empty()) => Ok(Some(s.into())),
        _ => Ok(None),
    }
}

/// Parse a float, mapping anything that isn't one to `None` rather than failing the row.
pub fn lenient_float<'de, D>(d: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Deserialize::deserialize(d)?;
    Ok(s.and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|v| !v.is_nan()))
}

/// parse a '1' to `true` and a '0' to `false`
pub fn bool_01<'de, D>(d: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let s: u8 = Deserialize::deserialize(d)?;
    match s {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(Error::custom("expected '0' or '1'")),
    }
}

/// Write a `bool` as '1' or '0'.
pub fn ser_bool_01<S>(v: &bool, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_u8(u8::from(*v))
}

pub fn header(header: &str) {
    let len = header.len();
    print!("\n{}\n", header);
    for _ in 0..len {
        print!("=");
    }
    println!("\n")
}
