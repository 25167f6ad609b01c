//! Units of measurement: normalization and per-item conversion factors.
use crate::{ArcStr, Result};
use qu::ick_use::*;
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    fs, io,
    path::Path,
};

/// The key in a unit dependency entry that names the item's canonical unit.
pub const MAIN_UNIT_KEY: &str = "<main>";

/// Reduce a reported unit to a comparison key.
///
/// Missing, blank, `none` and `nan` all become `"nan"`; anything else is lowercased and trimmed.
pub fn normalize_unit(raw: Option<&str>) -> String {
    let Some(raw) = raw else {
        return "nan".into()
    };
    let unit = raw.trim().to_lowercase();
    match unit.as_str() {
        "" | "none" | "nan" => "nan".into(),
        _ => unit,
    }
}

/// The canonical unit of one item and the factors that convert other units into it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemUnits {
    main: Option<String>,
    factors: HashMap<String, f64>,
}

impl ItemUnits {
    pub fn new(main: Option<&str>, factors: impl IntoIterator<Item = (String, f64)>) -> Self {
        Self {
            main: main.map(|m| normalize_unit(Some(m))),
            factors: factors.into_iter().collect(),
        }
    }

    /// The normalized canonical unit, if the item has one.
    pub fn main(&self) -> Option<&str> {
        self.main.as_deref()
    }

    /// The factor converting `unit` (already normalized) into the canonical unit.
    pub fn factor(&self, unit: &str) -> Option<f64> {
        self.factors.get(unit).copied()
    }

    /// Decide whether a reported value can be used, converting it into the canonical unit.
    ///
    /// Items without a canonical unit never accept values. Zero is accepted as-is whatever the
    /// unit. Otherwise the value is accepted unchanged in the canonical unit, multiplied by a
    /// nonzero factor in a convertible unit, and rejected in any other unit.
    ///
    /// `unit` must already be normalized. This is the single place that rule lives: both the
    /// dictionary counts and the tuple values go through it.
    pub fn accept(&self, value: f64, unit: &str) -> Option<f64> {
        let main = self.main()?;
        if value == 0. {
            Some(0.)
        } else if unit == main {
            Some(value)
        } else {
            match self.factor(unit) {
                Some(factor) if factor != 0. => Some(value * factor),
                _ => None,
            }
        }
    }
}

/// The unit dependency reference for one value table, keyed by item id.
#[derive(Debug, Clone, Default)]
pub struct UnitDependency {
    items: HashMap<ArcStr, ItemUnits>,
}

impl UnitDependency {
    /// Load a `{"<itemid>": {"<unit>": factor, ..., "<main>": "<unit>"}}` json file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        fn inner(path: &Path) -> Result<UnitDependency> {
            let input = io::BufReader::new(fs::File::open(path)?);
            let raw: BTreeMap<String, BTreeMap<String, Value>> = serde_json::from_reader(input)?;
            Ok(UnitDependency::from_raw(raw))
        }
        let path = path.as_ref();
        let this = inner(path)
            .with_context(|| format!("loading unit dependencies from \"{}\"", path.display()))?;
        event!(
            Level::DEBUG,
            "loaded units for {} items from \"{}\"",
            this.items.len(),
            path.display()
        );
        Ok(this)
    }

    fn from_raw(raw: BTreeMap<String, BTreeMap<String, Value>>) -> Self {
        let mut items = HashMap::new();
        for (itemid, units) in raw {
            let main = units.get(MAIN_UNIT_KEY).and_then(Value::as_str);
            let factors = units
                .iter()
                .filter(|(unit, _)| *unit != MAIN_UNIT_KEY)
                .filter_map(|(unit, factor)| Some((unit.clone(), factor.as_f64()?)));
            items.insert(ArcStr::from(itemid.trim()), ItemUnits::new(main, factors));
        }
        Self { items }
    }

    pub fn get(&self, itemid: &str) -> Option<&ItemUnits> {
        self.items.get(itemid)
    }

    pub fn contains(&self, itemid: &str) -> bool {
        self.items.contains_key(itemid)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl FromIterator<(ArcStr, ItemUnits)> for UnitDependency {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = (ArcStr, ItemUnits)>,
    {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}
