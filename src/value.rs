//! Deciding what goes in the value field of an event.
use crate::{normalize_unit, util::format_number, ArcStr, ItemUnits};
use std::fmt;

/// The value field of an event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventValue {
    /// No value at all (an empty field).
    Blank,
    /// A usable zero. Written as `0`, whatever the unit.
    Zero,
    /// A usable number in the code's canonical unit.
    Number(f64),
    /// Text passed through as-is (e.g. a transfer's care unit).
    Text(ArcStr),
    /// The code carries no value and none was given.
    Empty,
    /// The code carries a value but none was given.
    Missing,
    /// A value was given but isn't a usable number. The text goes to the string stream.
    String,
}

impl EventValue {
    pub const EMPTY: &'static str = "_EMPTY";
    pub const MISSING: &'static str = "_MISSING";
    pub const STRING: &'static str = "_STRING";

    pub fn is_string(&self) -> bool {
        matches!(self, EventValue::String)
    }
}

impl fmt::Display for EventValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EventValue::Blank => Ok(()),
            EventValue::Zero => f.write_str("0"),
            EventValue::Number(v) => f.write_str(&format_number(*v)),
            EventValue::Text(s) => f.write_str(s),
            EventValue::Empty => f.write_str(Self::EMPTY),
            EventValue::Missing => f.write_str(Self::MISSING),
            EventValue::String => f.write_str(Self::STRING),
        }
    }
}

/// The outcome of resolving one reported value.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub value: EventValue,
    /// What to write to the string stream, present exactly when `value` is
    /// [`EventValue::String`].
    pub text: Option<String>,
}

impl Resolution {
    fn value(value: EventValue) -> Self {
        Self { value, text: None }
    }

    fn string(text: impl Into<String>) -> Self {
        Self {
            value: EventValue::String,
            text: Some(text.into()),
        }
    }
}

/// Resolve the value of one record of a value-bearing table.
///
/// `units` is `Some` only for codes the dictionary marks as carrying a value. `text` is the raw
/// value column, `numeric` its parsed form (`None` if missing or not a number), `unit` the raw
/// reported unit. First match wins:
///
/// 1. code without value: `_EMPTY` if there's no text, otherwise `_STRING`;
/// 2. no number: `_MISSING` if there's no text, otherwise `_STRING`;
/// 3. zero: `0`;
/// 4. convertible unit: the converted number; inconvertible: `_STRING` with `text#unit`;
/// 5. canonical unit: the number.
pub fn resolve_value(
    units: Option<&ItemUnits>,
    text: Option<&str>,
    numeric: Option<f64>,
    unit: Option<&str>,
) -> Resolution {
    let text = text.filter(|t| !t.trim().is_empty());
    let Some(units) = units else {
        return match text {
            None => Resolution::value(EventValue::Empty),
            Some(text) => Resolution::string(text),
        };
    };
    let Some(numeric) = numeric else {
        return match text {
            None => Resolution::value(EventValue::Missing),
            Some(text) => Resolution::string(text),
        };
    };
    if numeric == 0. {
        return Resolution::value(EventValue::Zero);
    }
    let unit = normalize_unit(unit);
    match units.accept(numeric, &unit) {
        Some(v) => Resolution::value(EventValue::Number(v)),
        None => Resolution::string(format!("{}#{}", text.unwrap_or(""), unit)),
    }
}
