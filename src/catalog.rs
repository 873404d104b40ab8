use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer};

use crate::area::{AreaTimeResolver, ResolvedOverrides};
use crate::error::{QcError, Result};
use crate::flags::Flag;
use crate::routine::Routine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutineKind {
    Range,
    Spike,
    Decreasing,
    Increasing,
    Diff,
}

impl RoutineKind {
    /// Number of parameters one application of this routine consumes.
    pub fn arity(self) -> usize {
        match self {
            RoutineKind::Diff => 2,
            _ => 1,
        }
    }
}

impl FromStr for RoutineKind {
    type Err = QcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "range" => Ok(RoutineKind::Range),
            "spike" => Ok(RoutineKind::Spike),
            "decreasing" => Ok(RoutineKind::Decreasing),
            "increasing" => Ok(RoutineKind::Increasing),
            "diff" | "datadiff" => Ok(RoutineKind::Diff),
            other => Err(QcError::Catalog(format!("unknown routine kind '{other}'"))),
        }
    }
}

impl<'de> Deserialize<'de> for RoutineKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for RoutineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoutineKind::Range => "range",
            RoutineKind::Spike => "spike",
            RoutineKind::Decreasing => "decreasing",
            RoutineKind::Increasing => "increasing",
            RoutineKind::Diff => "diff",
        };
        f.write_str(name)
    }
}

/// Threshold payload of one routine application. Every field is optional so
/// the same type serves as an area/season override.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Thresholds {
    pub min_range_value: Option<f64>,
    pub max_range_value: Option<f64>,
    pub acceptable_error: Option<f64>,
    pub acceptable_stddev_factor: Option<f64>,
    pub min_stddev_value: Option<f64>,
    pub q_flag: Option<Flag>,
}

impl Thresholds {
    /// Replace fields that are set in `other`, keep the rest.
    pub fn merge(&mut self, other: &Thresholds) {
        fn take<T: Copy>(base: &mut Option<T>, over: Option<T>) {
            if over.is_some() {
                *base = over;
            }
        }
        take(&mut self.min_range_value, other.min_range_value);
        take(&mut self.max_range_value, other.max_range_value);
        take(&mut self.acceptable_error, other.acceptable_error);
        take(&mut self.acceptable_stddev_factor, other.acceptable_stddev_factor);
        take(&mut self.min_stddev_value, other.min_stddev_value);
        take(&mut self.q_flag, other.q_flag);
    }

    pub fn is_empty(&self) -> bool {
        *self == Thresholds::default()
    }
}

/// One routine application: a parameter (or parameter pair) and its thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetEntry {
    pub key: String,
    /// Logical parameter names, resolved against the dataset at run time.
    pub parameters: Vec<String>,
    pub thresholds: Thresholds,
}

impl DatasetEntry {
    pub fn fail_flag(&self) -> Flag {
        self.thresholds.q_flag.unwrap_or(Flag::Bad)
    }

    /// Name used in the run log, e.g. `TEMP_CTD - TEMP2_CTD` for pairs.
    pub fn parameter_label(&self) -> String {
        self.parameters.join(" - ")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutineSpec {
    pub name: String,
    pub kind: RoutineKind,
    /// Position of this routine's verdict in every `Q0_` flag string.
    pub ordinal_index: usize,
    pub entries: Vec<DatasetEntry>,
}

#[derive(Debug, Deserialize)]
struct RawRoutine {
    routine: RoutineKind,
    qc_index: usize,
    #[serde(default)]
    datasets: BTreeMap<String, RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    parameter: Option<String>,
    #[serde(default)]
    parameters: Option<Vec<String>>,
    #[serde(default)]
    min_range_value: Option<f64>,
    #[serde(default)]
    max_range_value: Option<f64>,
    #[serde(default)]
    acceptable_error: Option<f64>,
    #[serde(default)]
    acceptable_stddev_factor: Option<f64>,
    #[serde(default)]
    min_stddev_value: Option<f64>,
    #[serde(default)]
    q_flag: Option<Flag>,
}

impl RawEntry {
    fn into_entry(self, key: String) -> Result<DatasetEntry> {
        let parameters = match (self.parameter, self.parameters) {
            (Some(p), None) => vec![p],
            (None, Some(ps)) => ps,
            (None, None) => vec![key.clone()],
            (Some(_), Some(_)) => {
                return Err(QcError::Catalog(format!(
                    "dataset '{key}' sets both 'parameter' and 'parameters'"
                )))
            }
        };
        Ok(DatasetEntry {
            key,
            parameters,
            thresholds: Thresholds {
                min_range_value: self.min_range_value,
                max_range_value: self.max_range_value,
                acceptable_error: self.acceptable_error,
                acceptable_stddev_factor: self.acceptable_stddev_factor,
                min_stddev_value: self.min_stddev_value,
                q_flag: self.q_flag,
            },
        })
    }
}

/// Registered routines ordered by ordinal index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutineCatalog {
    routines: Vec<RoutineSpec>,
}

impl RoutineCatalog {
    /// Build a catalog, checking that ordinal indices are unique and fit the
    /// flag string length, and that every entry builds a routine.
    pub fn new(mut routines: Vec<RoutineSpec>) -> Result<Self> {
        routines.sort_by_key(|r| r.ordinal_index);
        let size = routines.len();
        for (i, routine) in routines.iter().enumerate() {
            if routine.ordinal_index >= size {
                return Err(QcError::Catalog(format!(
                    "routine '{}' has qc_index {} but only {} routines are registered",
                    routine.name, routine.ordinal_index, size
                )));
            }
            if i > 0 && routines[i - 1].ordinal_index == routine.ordinal_index {
                return Err(QcError::Catalog(format!(
                    "routines '{}' and '{}' share qc_index {}",
                    routines[i - 1].name, routine.name, routine.ordinal_index
                )));
            }
        }
        for routine in &routines {
            for entry in &routine.entries {
                Routine::build(&routine.name, routine.kind, entry)?;
            }
        }
        Ok(Self { routines })
    }

    /// ```yaml
    /// range_check:
    ///   routine: range
    ///   qc_index: 0
    ///   datasets:
    ///     TEMP_CTD:
    ///       min_range_value: -2
    ///       max_range_value: 30
    ///       q_flag: B
    /// ```
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let raw: BTreeMap<String, RawRoutine> = serde_yaml::from_str(yaml)?;
        Self::from_raw(raw)
    }

    /// Merge several YAML documents (e.g. one file per routine) into one catalog.
    pub fn from_yaml_documents<'a, I>(documents: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut raw = BTreeMap::new();
        for doc in documents {
            let parsed: BTreeMap<String, RawRoutine> = serde_yaml::from_str(doc)?;
            for (name, routine) in parsed {
                if raw.insert(name.clone(), routine).is_some() {
                    return Err(QcError::Catalog(format!("routine '{name}' defined twice")));
                }
            }
        }
        Self::from_raw(raw)
    }

    fn from_raw(raw: BTreeMap<String, RawRoutine>) -> Result<Self> {
        let routines = raw
            .into_iter()
            .map(|(name, routine)| -> Result<RoutineSpec> {
                let entries = routine
                    .datasets
                    .into_iter()
                    .map(|(key, entry)| entry.into_entry(key))
                    .collect::<Result<Vec<_>>>()?;
                Ok(RoutineSpec {
                    name,
                    kind: routine.routine,
                    ordinal_index: routine.qc_index,
                    entries,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(routines)
    }

    /// Length of every flag string.
    pub fn size(&self) -> usize {
        self.routines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }

    pub fn routines(&self) -> &[RoutineSpec] {
        &self.routines
    }

    pub fn get(&self, name: &str) -> Option<&RoutineSpec> {
        self.routines.iter().find(|r| r.name == name)
    }

    /// Copy of this catalog with area/season overrides applied per routine
    /// and entry key. Ordinal indices are untouched; the merged thresholds
    /// are validated like a freshly built catalog.
    pub fn with_overrides(&self, overrides: &ResolvedOverrides) -> Result<Self> {
        let mut catalog = self.clone();
        for routine in &mut catalog.routines {
            let Some(by_parameter) = overrides.get(&routine.name) else {
                continue;
            };
            for entry in &mut routine.entries {
                if let Some(over) = by_parameter.get(&entry.key) {
                    entry.thresholds.merge(over);
                }
            }
        }
        Self::new(catalog.routines)
    }
}

/// Session settings: the base catalog, the catalog currently in effect, and
/// provenance details written into the dataset comment.
#[derive(Debug)]
pub struct Settings {
    base: RoutineCatalog,
    active: RoutineCatalog,
    resolver: Option<AreaTimeResolver>,
    pub user: String,
    pub version: String,
}

impl Settings {
    pub fn new(catalog: RoutineCatalog) -> Self {
        Self {
            active: catalog.clone(),
            base: catalog,
            resolver: None,
            user: default_user(),
            version: format!("profile-qc version {}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn with_resolver(mut self, resolver: AreaTimeResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn routines(&self) -> &RoutineCatalog {
        &self.active
    }

    pub fn number_of_routines(&self) -> usize {
        self.active.size()
    }

    pub fn has_resolver(&self) -> bool {
        self.resolver.is_some()
    }

    /// Re-derive the active catalog for a cast position and month. Overrides
    /// are always applied to the base catalog, never stacked.
    pub fn update_routine_settings(&mut self, latitude: f64, longitude: f64, month: u32) -> Result<()> {
        let Some(resolver) = &self.resolver else {
            return Ok(());
        };
        let overrides = resolver.resolve(latitude, longitude, month)?;
        self.active = self.base.with_overrides(&overrides)?;
        Ok(())
    }
}

fn default_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
range_check:
  routine: Range
  qc_index: 0
  datasets:
    TEMP_CTD:
      parameter: TEMP_CTD
      min_range_value: -2
      max_range_value: 30
    SALT_CTD:
      min_range_value: 0
      max_range_value: 40
      q_flag: S
diff_check:
  routine: DataDiff
  qc_index: 1
  datasets:
    TEMP_PAIR:
      parameters: [TEMP_CTD, TEMP2_CTD]
      acceptable_error: 0.5
"#;

    #[test]
    fn test_parse_catalog() {
        let catalog = RoutineCatalog::from_yaml_str(YAML).unwrap();
        assert_eq!(catalog.size(), 2);
        assert_eq!(catalog.routines()[0].name, "range_check");
        assert_eq!(catalog.routines()[1].kind, RoutineKind::Diff);

        let range = catalog.get("range_check").unwrap();
        let salt = range.entries.iter().find(|e| e.key == "SALT_CTD").unwrap();
        assert_eq!(salt.parameters, vec!["SALT_CTD".to_string()]);
        assert_eq!(salt.fail_flag(), Flag::Suspicious);

        let temp = range.entries.iter().find(|e| e.key == "TEMP_CTD").unwrap();
        assert_eq!(temp.thresholds.min_range_value, Some(-2.0));
        assert_eq!(temp.fail_flag(), Flag::Bad);

        let pair = &catalog.get("diff_check").unwrap().entries[0];
        assert_eq!(pair.parameter_label(), "TEMP_CTD - TEMP2_CTD");
    }

    #[test]
    fn test_catalog_rejects_bad_indices() {
        let duplicate = r#"
a:
  routine: range
  qc_index: 0
b:
  routine: spike
  qc_index: 0
"#;
        assert!(matches!(
            RoutineCatalog::from_yaml_str(duplicate),
            Err(QcError::Catalog(_))
        ));

        let out_of_range = r#"
a:
  routine: range
  qc_index: 3
"#;
        assert!(RoutineCatalog::from_yaml_str(out_of_range).is_err());
        assert!(RoutineCatalog::from_yaml_str("a:\n  routine: median\n  qc_index: 0\n").is_err());
    }

    #[test]
    fn test_documents_merge() {
        let a = "a:\n  routine: range\n  qc_index: 1\n";
        let b = "b:\n  routine: increasing\n  qc_index: 0\n";
        let catalog = RoutineCatalog::from_yaml_documents([a, b]).unwrap();
        assert_eq!(catalog.routines()[0].name, "b");
        assert!(RoutineCatalog::from_yaml_documents([a, a]).is_err());
    }

    #[test]
    fn test_with_overrides_only_replaces_set_fields() {
        let catalog = RoutineCatalog::from_yaml_str(YAML).unwrap();
        let mut overrides = ResolvedOverrides::new();
        overrides.entry("range_check".to_string()).or_default().insert(
            "TEMP_CTD".to_string(),
            Thresholds {
                max_range_value: Some(20.0),
                ..Default::default()
            },
        );

        let updated = catalog.with_overrides(&overrides).unwrap();
        let temp = updated.get("range_check").unwrap().entries.iter()
            .find(|e| e.key == "TEMP_CTD")
            .unwrap();
        assert_eq!(temp.thresholds.max_range_value, Some(20.0));
        assert_eq!(temp.thresholds.min_range_value, Some(-2.0));
        assert_eq!(updated.get("range_check").unwrap().ordinal_index, 0);
    }

    #[test]
    fn test_catalog_rejects_incomplete_entries() {
        let missing_stddev = r#"
range_check:
  routine: range
  qc_index: 0
  datasets:
    TEMP_CTD:
      min_range_value: -2
      max_range_value: 10
spike_check:
  routine: spike
  qc_index: 1
  datasets:
    TEMP_CTD:
      acceptable_stddev_factor: 3
"#;
        match RoutineCatalog::from_yaml_str(missing_stddev) {
            Err(QcError::MissingThreshold { routine, field }) => {
                assert_eq!(routine, "spike_check");
                assert_eq!(field, "min_stddev_value");
            }
            other => panic!("expected MissingThreshold, got {other:?}"),
        }

        let wrong_arity = r#"
diff_check:
  routine: diff
  qc_index: 0
  datasets:
    TEMP_CTD:
      acceptable_error: 0.5
"#;
        assert!(matches!(
            RoutineCatalog::from_yaml_str(wrong_arity),
            Err(QcError::Argument(_))
        ));
    }

    #[test]
    fn test_with_overrides_rejects_negative_tolerance() {
        let yaml = r#"
increasing_check:
  routine: increasing
  qc_index: 0
  datasets:
    PRES_CTD:
      acceptable_error: 0
"#;
        let catalog = RoutineCatalog::from_yaml_str(yaml).unwrap();
        let mut overrides = ResolvedOverrides::new();
        overrides.entry("increasing_check".to_string()).or_default().insert(
            "PRES_CTD".to_string(),
            Thresholds {
                acceptable_error: Some(-1.0),
                ..Default::default()
            },
        );
        assert!(matches!(
            catalog.with_overrides(&overrides),
            Err(QcError::Argument(_))
        ));
    }
}
