use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::Local;
use polars::prelude::*;
use tracing::{debug, info, warn};

use crate::catalog::{DatasetEntry, RoutineKind, RoutineSpec, Settings};
use crate::dependencies::ParameterDependencies;
use crate::error::{QcError, Result};
use crate::flags::{primary_from_auto, Flag, FlagString};
use crate::log::{QcLog, QcLogEntry};
use crate::routine::{Routine, RoutineOutcome};
use crate::schema::{column_stem, flag_field, meta, parameter};

const QC_COMMENT: &str = "//COMNT_QC; AUTOMATIC QC PERFORMED BY";

/// One cast: data rows ordered by pressure, metadata comment lines, and the
/// mapping from logical parameter names to the actual column names.
#[derive(Debug, Clone)]
pub struct ProfileDataset {
    pub name: String,
    pub data: DataFrame,
    pub metadata: Vec<String>,
    pub parameter_mapping: HashMap<String, String>,
}

impl ProfileDataset {
    pub fn new(name: impl Into<String>, data: DataFrame) -> Self {
        Self {
            name: name.into(),
            data,
            metadata: Vec::new(),
            parameter_mapping: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Vec<String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_parameter_mapping(mut self, mapping: HashMap<String, String>) -> Self {
        self.parameter_mapping = mapping;
        self
    }

    fn has_column(&self, name: &str) -> bool {
        self.data.column(name).is_ok()
    }

    /// Actual column names for the logical parameters: either all present as
    /// given, or all present after mapping.
    fn resolve_columns(&self, parameters: &[String]) -> Option<Vec<String>> {
        if parameters.iter().all(|p| self.has_column(p)) {
            return Some(parameters.to_vec());
        }
        parameters
            .iter()
            .map(|p| {
                self.parameter_mapping
                    .get(p)
                    .filter(|c| self.has_column(c))
                    .cloned()
            })
            .collect()
    }

    fn pressure(&self) -> Result<Option<Vec<Option<f64>>>> {
        let column = self
            .parameter_mapping
            .get(parameter::PRESSURE)
            .map(String::as_str)
            .unwrap_or(parameter::PRESSURE);
        if !self.has_column(column) {
            return Ok(None);
        }
        float_values(&self.data, column).map(Some)
    }

    fn first_value(&self, column: &str) -> Result<f64> {
        if !self.has_column(column) {
            return Err(QcError::MissingColumn(column.to_string()));
        }
        float_values(&self.data, column)?
            .first()
            .copied()
            .flatten()
            .ok_or_else(|| QcError::InvalidData(format!("{column} has no value in the first row")))
    }
}

/// Column as floats; null, NaN and unparsable strings become `None`.
pub fn float_values(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>> {
    let column = df.column(name)?;
    let values: Vec<Option<f64>> = if matches!(column.dtype(), DataType::String) {
        column
            .str()?
            .into_iter()
            .map(|v| v.and_then(|s| s.trim().parse::<f64>().ok()))
            .collect()
    } else {
        column
            .cast(&DataType::Float64)?
            .f64()?
            .into_iter()
            .collect()
    };
    Ok(values.into_iter().map(|v| v.filter(|x| !x.is_nan())).collect())
}

/// A column counts as available when at least one value is non-missing and
/// non-zero. Columns holding only zeros are therefore skipped.
pub fn data_available(values: &[Option<f64>]) -> bool {
    values.iter().any(|v| matches!(v, Some(x) if *x != 0.0))
}

/// Automatic flag fields of one dataset, opened for writing.
#[derive(Debug, Clone, PartialEq)]
pub struct FlagMatrix {
    routine_count: usize,
    fields: BTreeMap<String, Vec<FlagString>>,
}

impl FlagMatrix {
    /// Create missing `Q0_` columns, reset malformed ones, and parse them all.
    pub fn open(df: &mut DataFrame, routine_count: usize) -> Result<Self> {
        let height = df.height();
        let default = FlagString::new(routine_count).to_string();

        for name in column_names(df) {
            let key = column_stem(&name);
            if meta::is_meta(key) || key.starts_with(flag_field::FLAG_MARKER) {
                continue;
            }
            let auto_key = flag_field::auto_key(key);
            if df.column(&auto_key).is_err() {
                df.with_column(Column::new(auto_key.as_str().into(), vec![default.clone(); height]))?;
            }
        }

        let mut fields = BTreeMap::new();
        for name in column_names(df) {
            if !name.starts_with(flag_field::AUTO_PREFIX) {
                continue;
            }
            let parsed = parse_flag_column(df.column(&name)?, routine_count);
            let flags = match parsed {
                Some(flags) => flags,
                None => {
                    warn!("{name} is not in the {routine_count}-routine flag format, resetting");
                    df.with_column(Column::new(name.as_str().into(), vec![default.clone(); height]))?;
                    vec![FlagString::new(routine_count); height]
                }
            };
            fields.insert(name, flags);
        }

        Ok(Self {
            routine_count,
            fields,
        })
    }

    pub fn routine_count(&self) -> usize {
        self.routine_count
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&[FlagString]> {
        self.fields.get(key).map(Vec::as_slice)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Escalate `flags` into slot `qc_index` of every row of `key`. Returns
    /// false when the dataset has no such flag field.
    pub fn add_qflag(&mut self, key: &str, flags: &[Flag], qc_index: usize) -> bool {
        let Some(rows) = self.fields.get_mut(key) else {
            return false;
        };
        for (row, flag) in rows.iter_mut().zip(flags) {
            row.escalate(qc_index, *flag);
        }
        true
    }

    /// Write every flag field back as fixed-width strings.
    pub fn close(self, df: &mut DataFrame) -> Result<()> {
        for (name, rows) in self.fields {
            let values: Vec<String> = rows.iter().map(ToString::to_string).collect();
            df.with_column(Column::new(name.as_str().into(), values))?;
        }
        Ok(())
    }
}

fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_column_names_str()
        .iter()
        .map(|c| c.to_string())
        .collect()
}

fn parse_flag_column(column: &Column, routine_count: usize) -> Option<Vec<FlagString>> {
    let values = column.str().ok()?;
    values
        .into_iter()
        .map(|v| FlagString::parse(v?, routine_count))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    FlagFieldsOpen,
    RoutineLoopRunning,
    FlagFieldsClosed,
    Synchronized,
    CommentAppended,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub routines_evaluated: usize,
    pub entries_skipped: usize,
    pub failed_rows: usize,
}

/// Runs the routine catalog over datasets and owns the run log.
#[derive(Debug)]
pub struct SessionQC {
    settings: Settings,
    dependencies: ParameterDependencies,
    log: QcLog,
    state: SessionState,
}

impl SessionQC {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            dependencies: ParameterDependencies::default(),
            log: QcLog::new(),
            state: SessionState::Idle,
        }
    }

    pub fn with_dependencies(mut self, dependencies: ParameterDependencies) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn log(&self) -> &QcLog {
        &self.log
    }

    /// Refresh thresholds for the cast position (`LATITUDE_DD`,
    /// `LONGITUDE_DD`) and `MONTH` of the first row.
    pub fn update_routines(&mut self, dataset: &ProfileDataset) -> Result<()> {
        if !self.settings.has_resolver() {
            return Ok(());
        }
        let latitude = dataset.first_value(meta::LATITUDE_DD)?;
        let longitude = dataset.first_value(meta::LONGITUDE_DD)?;
        let month = dataset.first_value(meta::MONTH)?;
        self.settings
            .update_routine_settings(latitude, longitude, month as u32)
    }

    /// Run every routine, then close, synchronize and comment.
    pub fn run(&mut self, dataset: &mut ProfileDataset) -> Result<RunSummary> {
        let mut matrix = self.open_flag_fields(&mut dataset.data)?;
        self.state = SessionState::RoutineLoopRunning;

        let catalog = self.settings.routines().clone();
        let mut summary = RunSummary::default();
        for routine_spec in catalog.routines() {
            for entry in &routine_spec.entries {
                match self.run_entry(dataset, &mut matrix, routine_spec, entry)? {
                    Some(failed) => {
                        summary.routines_evaluated += 1;
                        summary.failed_rows += failed;
                    }
                    None => summary.entries_skipped += 1,
                }
            }
        }

        self.close_flag_fields(matrix, &mut dataset.data)?;
        self.synchronize_flag_fields(&mut dataset.data)?;
        self.append_qc_comment(&mut dataset.metadata);
        Ok(summary)
    }

    /// Returns the number of failing rows, or `None` when the entry was skipped.
    fn run_entry(
        &mut self,
        dataset: &ProfileDataset,
        matrix: &mut FlagMatrix,
        routine_spec: &RoutineSpec,
        entry: &DatasetEntry,
    ) -> Result<Option<usize>> {
        let Some(columns) = dataset.resolve_columns(&entry.parameters) else {
            debug!("{}: no column for {:?}, skipping", routine_spec.name, entry.parameters);
            return Ok(None);
        };
        let data = columns
            .iter()
            .map(|c| float_values(&dataset.data, c))
            .collect::<Result<Vec<_>>>()?;
        if !data.iter().all(|values| data_available(values)) {
            debug!("{}: no data for {:?}, skipping", routine_spec.name, columns);
            return Ok(None);
        }

        let routine = Routine::build(&routine_spec.name, routine_spec.kind, entry)?;
        let fail_flag = entry.fail_flag();
        let outcome = routine.evaluate(&data, fail_flag)?;

        for key in self.flag_targets(dataset, matrix, entry, &columns) {
            if !matrix.add_qflag(&key, &outcome.flags, routine_spec.ordinal_index) {
                debug!("{}: no flag field {key}", routine_spec.name);
            }
        }

        let failing = outcome.failing_rows();
        if !failing.is_empty() {
            info!("QC-{} failed for {}", routine_spec.name, entry.parameter_label());
            self.log_failures(dataset, routine_spec, entry, &data, &outcome, fail_flag)?;
        }
        Ok(Some(failing.len()))
    }

    /// `Q0_` fields receiving a verdict: each involved column's own field
    /// plus the fields of everything derived from it.
    fn flag_targets(
        &self,
        dataset: &ProfileDataset,
        matrix: &FlagMatrix,
        entry: &DatasetEntry,
        columns: &[String],
    ) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for (parameter, column) in entry.parameters.iter().zip(columns) {
            let keys = self
                .dependencies
                .flag_keys(column_stem(column))
                .into_iter()
                .chain(self.dependencies.flag_keys(parameter));
            for key in keys {
                let key = resolve_flag_key(dataset, matrix, key);
                if !targets.contains(&key) {
                    targets.push(key);
                }
            }
        }
        targets
    }

    fn log_failures(
        &mut self,
        dataset: &ProfileDataset,
        routine_spec: &RoutineSpec,
        entry: &DatasetEntry,
        data: &[Vec<Option<f64>>],
        outcome: &RoutineOutcome,
        fail_flag: Flag,
    ) -> Result<()> {
        let pressure = dataset.pressure()?;
        let values: Vec<Option<f64>> = match routine_spec.kind {
            RoutineKind::Diff => data[0]
                .iter()
                .zip(&data[1])
                .map(|(a, b)| Some((*a)? - (*b)?))
                .collect(),
            _ => data[0].clone(),
        };
        let label = entry.parameter_label();
        for row in outcome.failing_rows() {
            self.log.push(
                &dataset.name,
                &routine_spec.name,
                QcLogEntry {
                    parameter: label.clone(),
                    pressure: pressure.as_ref().and_then(|p| p[row]),
                    value: values[row],
                    info: format!("Flagged with: {fail_flag}"),
                },
            );
        }
        Ok(())
    }

    pub fn open_flag_fields(&mut self, df: &mut DataFrame) -> Result<FlagMatrix> {
        let matrix = FlagMatrix::open(df, self.settings.number_of_routines())?;
        self.state = SessionState::FlagFieldsOpen;
        Ok(matrix)
    }

    pub fn close_flag_fields(&mut self, matrix: FlagMatrix, df: &mut DataFrame) -> Result<()> {
        matrix.close(df)?;
        self.state = SessionState::FlagFieldsClosed;
        Ok(())
    }

    /// Import `S` and `B` from every `Q0_` field into its primary `Q_` field.
    /// `B` wins over `S`; rows with neither keep their primary flag.
    ///
    /// ```text
    /// Q0_TEMP_CTD     Q_TEMP_CTD
    /// A00BS   ---->   B
    /// A00AS   ---->   S
    /// A00AA   ---->   (unchanged)
    /// ```
    pub fn synchronize_flag_fields(&mut self, df: &mut DataFrame) -> Result<()> {
        let height = df.height();
        for auto_key in column_names(df) {
            if !auto_key.starts_with(flag_field::AUTO_PREFIX) {
                continue;
            }
            let verdicts: Vec<Option<Flag>> = df
                .column(&auto_key)?
                .str()?
                .into_iter()
                .map(|v| v.and_then(primary_from_auto))
                .collect();

            let primary_key = flag_field::primary_key(&auto_key);
            let mut primary: Vec<Option<String>> = match df.column(&primary_key) {
                Ok(column) => column
                    .cast(&DataType::String)?
                    .str()?
                    .into_iter()
                    .map(|v| v.map(str::to_string))
                    .collect(),
                Err(_) => vec![Some(Flag::NotEvaluated.to_string()); height],
            };
            for (slot, verdict) in primary.iter_mut().zip(&verdicts) {
                if let Some(flag) = verdict {
                    *slot = Some(flag.to_string());
                }
            }
            df.with_column(Column::new(primary_key.as_str().into(), primary))?;
        }
        self.state = SessionState::Synchronized;
        Ok(())
    }

    pub fn append_qc_comment(&mut self, metadata: &mut Vec<String>) {
        let time_stamp = Local::now().format("%Y%m%d%H%M");
        metadata.push(format!(
            "{QC_COMMENT} {}; TIMESTAMP {time_stamp}; {}",
            self.settings.user, self.settings.version
        ));
        self.state = SessionState::CommentAppended;
    }

    pub fn reset_log(&mut self) {
        self.log.reset();
    }

    pub fn write_log(&mut self, path: &Path, reset_log: bool) -> Result<()> {
        self.log.write(path)?;
        if reset_log {
            self.reset_log();
        }
        Ok(())
    }
}

/// Dependents are named logically; use the mapped column's field when the
/// logical one does not exist.
fn resolve_flag_key(dataset: &ProfileDataset, matrix: &FlagMatrix, key: String) -> String {
    if matrix.contains(&key) {
        return key;
    }
    key.strip_prefix(flag_field::AUTO_PREFIX)
        .and_then(|parameter| dataset.parameter_mapping.get(parameter))
        .map(|column| flag_field::auto_key(column_stem(column)))
        .unwrap_or(key)
}
