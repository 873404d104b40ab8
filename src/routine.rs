use crate::boolean::BooleanAccumulator;
use crate::catalog::{DatasetEntry, RoutineKind, Thresholds};
use crate::error::{QcError, Result};
use crate::flags::Flag;

/// Rows in the centered spike window.
pub const SPIKE_WINDOW: usize = 7;
/// Non-missing rows a spike window needs before the row is tested.
pub const SPIKE_MIN_PERIODS: usize = 3;
/// Relative slack on diff comparisons so a gap equal to the limit passes
/// despite binary rounding of the subtraction.
const DIFF_SLACK: f64 = 1e-9;

/// A configured QC test. Missing values never pass a comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Routine {
    Range { min: f64, max: f64 },
    Spike { stddev_factor: f64, min_stddev: f64 },
    Decreasing { acceptable_error: f64 },
    Increasing { acceptable_error: f64 },
    Diff { acceptable_error: f64 },
}

/// Result of running one routine over one parameter entry.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutineOutcome {
    pub passed: Vec<bool>,
    pub flags: Vec<Flag>,
    /// Routine-level verdict for the whole series.
    pub qc_passed: bool,
}

impl RoutineOutcome {
    fn from_accumulator(acc: &BooleanAccumulator, fail_flag: Flag, qc_passed: bool) -> Self {
        let passed = acc.state().to_vec();
        let flags = passed
            .iter()
            .map(|p| if *p { Flag::Accepted } else { fail_flag })
            .collect();
        Self {
            passed,
            flags,
            qc_passed,
        }
    }

    pub fn failing_rows(&self) -> Vec<usize> {
        self.passed
            .iter()
            .enumerate()
            .filter_map(|(i, p)| (!p).then_some(i))
            .collect()
    }
}

impl Routine {
    /// Build the routine for one catalog entry, checking arity and thresholds.
    pub fn build(routine_name: &str, kind: RoutineKind, entry: &DatasetEntry) -> Result<Self> {
        if entry.parameters.len() != kind.arity() {
            return Err(QcError::Argument(format!(
                "{kind} routine '{routine_name}' takes {} parameter(s), got {} for '{}'",
                kind.arity(),
                entry.parameters.len(),
                entry.key
            )));
        }
        Self::from_thresholds(routine_name, kind, &entry.thresholds)
    }

    pub fn from_thresholds(routine_name: &str, kind: RoutineKind, t: &Thresholds) -> Result<Self> {
        let require = |value: Option<f64>, field: &'static str| {
            value.ok_or_else(|| QcError::MissingThreshold {
                routine: routine_name.to_string(),
                field,
            })
        };
        let routine = match kind {
            RoutineKind::Range => Routine::Range {
                min: require(t.min_range_value, "min_range_value")?,
                max: require(t.max_range_value, "max_range_value")?,
            },
            RoutineKind::Spike => Routine::Spike {
                stddev_factor: require(t.acceptable_stddev_factor, "acceptable_stddev_factor")?,
                min_stddev: require(t.min_stddev_value, "min_stddev_value")?,
            },
            RoutineKind::Decreasing => Routine::Decreasing {
                acceptable_error: non_negative(
                    routine_name,
                    require(t.acceptable_error, "acceptable_error")?,
                )?,
            },
            RoutineKind::Increasing => Routine::Increasing {
                acceptable_error: non_negative(
                    routine_name,
                    require(t.acceptable_error, "acceptable_error")?,
                )?,
            },
            RoutineKind::Diff => Routine::Diff {
                acceptable_error: require(t.acceptable_error, "acceptable_error")?,
            },
        };
        Ok(routine)
    }

    pub fn kind(&self) -> RoutineKind {
        match self {
            Routine::Range { .. } => RoutineKind::Range,
            Routine::Spike { .. } => RoutineKind::Spike,
            Routine::Decreasing { .. } => RoutineKind::Decreasing,
            Routine::Increasing { .. } => RoutineKind::Increasing,
            Routine::Diff { .. } => RoutineKind::Diff,
        }
    }

    /// Run the routine over its columns (one, or two for `Diff`).
    pub fn evaluate(&self, columns: &[Vec<Option<f64>>], fail_flag: Flag) -> Result<RoutineOutcome> {
        let arity = self.kind().arity();
        if columns.len() != arity {
            return Err(QcError::Argument(format!(
                "{} routine takes {} column(s), got {}",
                self.kind(),
                arity,
                columns.len()
            )));
        }
        let values = &columns[0];

        match *self {
            Routine::Range { min, max } => {
                let mut acc = BooleanAccumulator::for_values(values);
                acc.add_predicate_from(values, |v| v <= max)?;
                acc.add_predicate_from(values, |v| v >= min)?;
                let qc_passed = acc.all_passed();
                Ok(RoutineOutcome::from_accumulator(&acc, fail_flag, qc_passed))
            }
            Routine::Spike {
                stddev_factor,
                min_stddev,
            } => {
                let bounds = spike_bounds(values, stddev_factor, min_stddev);
                let below_max: Vec<bool> = bounded(values, &bounds, |v, (_, hi)| v <= hi);
                let above_min: Vec<bool> = bounded(values, &bounds, |v, (lo, _)| v >= lo);

                let mut acc = BooleanAccumulator::for_values(values);
                acc.add_predicate(&below_max)?;
                acc.add_predicate(&above_min)?;
                let qc_passed = acc.all_passed();
                Ok(RoutineOutcome::from_accumulator(&acc, fail_flag, qc_passed))
            }
            Routine::Decreasing { acceptable_error } => {
                monotonic(values, fail_flag, |prev, next| prev >= next - acceptable_error)
            }
            Routine::Increasing { acceptable_error } => {
                monotonic(values, fail_flag, |prev, next| prev <= next + acceptable_error)
            }
            Routine::Diff { acceptable_error } => {
                let other = &columns[1];
                if other.len() != values.len() {
                    return Err(QcError::ShapeMismatch {
                        expected: values.len(),
                        got: other.len(),
                    });
                }
                let limit = acceptable_error + DIFF_SLACK * acceptable_error.abs().max(1.0);
                let within: Vec<bool> = values
                    .iter()
                    .zip(other)
                    .map(|(a, b)| matches!((a, b), (Some(a), Some(b)) if (a - b).abs() <= limit))
                    .collect();

                let mut acc = BooleanAccumulator::new(values.len());
                acc.add_predicate(&within)?;
                let qc_passed = acc.all_passed();
                Ok(RoutineOutcome::from_accumulator(&acc, fail_flag, qc_passed))
            }
        }
    }
}

fn non_negative(routine_name: &str, value: f64) -> Result<f64> {
    if value < 0.0 {
        return Err(QcError::Argument(format!(
            "routine '{routine_name}' has negative acceptable_error {value}"
        )));
    }
    Ok(value)
}

/// Acceptance band per row, `None` where the window is too sparse to test.
///
/// Mean and sample standard deviation come from the other rows of the
/// window so an extreme center value cannot widen its own band.
fn spike_bounds(values: &[Option<f64>], stddev_factor: f64, min_stddev: f64) -> Vec<Option<(f64, f64)>> {
    let n = values.len();
    let half = SPIKE_WINDOW / 2;
    (0..n)
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half).min(n - 1);
            if values[lo..=hi].iter().flatten().count() < SPIKE_MIN_PERIODS {
                return None;
            }
            let neighbours: Vec<f64> = (lo..=hi)
                .filter(|&j| j != i)
                .filter_map(|j| values[j])
                .collect();
            if neighbours.len() < 2 {
                return None;
            }
            let count = neighbours.len() as f64;
            let mean = neighbours.iter().sum::<f64>() / count;
            let variance = neighbours.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1.0);
            let band = variance.sqrt().max(min_stddev) * stddev_factor;
            Some((mean - band, mean + band))
        })
        .collect()
}

fn bounded<F>(values: &[Option<f64>], bounds: &[Option<(f64, f64)>], test: F) -> Vec<bool>
where
    F: Fn(f64, (f64, f64)) -> bool,
{
    values
        .iter()
        .zip(bounds)
        .map(|(value, bound)| match (value, bound) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(v), Some(b)) => test(*v, *b),
        })
        .collect()
}

/// Compare each row with its predecessor; the first row has none and passes.
fn monotonic<F>(values: &[Option<f64>], fail_flag: Flag, holds: F) -> Result<RoutineOutcome>
where
    F: Fn(f64, f64) -> bool,
{
    let mut steps = Vec::with_capacity(values.len());
    if !values.is_empty() {
        steps.push(true);
    }
    steps.extend(values.windows(2).map(|pair| match (pair[0], pair[1]) {
        (Some(prev), Some(next)) => holds(prev, next),
        _ => false,
    }));

    let mut acc = BooleanAccumulator::for_values(values);
    acc.add_predicate(&steps)?;

    // With a non-negative tolerance a strictly monotonic series passes every
    // step, so the per-row result already covers the raw check.
    let qc_passed = acc.all_passed();
    Ok(RoutineOutcome::from_accumulator(&acc, fail_flag, qc_passed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().copied().map(Some).collect()
    }

    fn entry(parameters: &[&str], thresholds: Thresholds) -> DatasetEntry {
        DatasetEntry {
            key: parameters.join("-"),
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
            thresholds,
        }
    }

    #[test]
    fn test_range_boundaries() {
        let routine = Routine::Range { min: 0.0, max: 10.0 };
        let eps = 1e-6;
        let data = series(&[0.0, 10.0, -eps, 10.0 + eps, 5.0]);
        let outcome = routine.evaluate(&[data], Flag::Bad).unwrap();
        assert_eq!(outcome.passed, vec![true, true, false, false, true]);
        assert_eq!(
            outcome.flags,
            vec![Flag::Accepted, Flag::Accepted, Flag::Bad, Flag::Bad, Flag::Accepted]
        );
        assert!(!outcome.qc_passed);
        assert_eq!(outcome.failing_rows(), vec![2, 3]);
    }

    #[test]
    fn test_range_missing_value_fails() {
        let routine = Routine::Range { min: 0.0, max: 10.0 };
        let outcome = routine
            .evaluate(&[vec![Some(1.0), None, Some(11.0)]], Flag::Suspicious)
            .unwrap();
        assert_eq!(outcome.passed, vec![true, false, false]);
        assert_eq!(outcome.flags[1], Flag::Suspicious);
    }

    #[test]
    fn test_decreasing() {
        let routine = Routine::Decreasing { acceptable_error: 0.0 };
        let outcome = routine
            .evaluate(&[series(&[5.0, 4.0, 3.0, 2.0, 1.0])], Flag::Bad)
            .unwrap();
        assert!(outcome.passed.iter().all(|p| *p));
        assert!(outcome.qc_passed);

        let outcome = routine
            .evaluate(&[series(&[5.0, 4.0, 4.5, 2.0, 1.0])], Flag::Bad)
            .unwrap();
        assert_eq!(outcome.passed, vec![true, true, false, true, true]);
        assert!(!outcome.qc_passed);

        let tolerant = Routine::Decreasing { acceptable_error: 0.5 };
        let outcome = tolerant
            .evaluate(&[series(&[5.0, 4.0, 4.5, 2.0, 1.0])], Flag::Bad)
            .unwrap();
        assert!(outcome.passed.iter().all(|p| *p));
        assert!(outcome.qc_passed);
    }

    #[test]
    fn test_increasing_first_row_exempt() {
        let routine = Routine::Increasing { acceptable_error: 0.01 };
        let outcome = routine
            .evaluate(&[series(&[100.0, 1.0, 0.995, 2.0, 3.0])], Flag::Bad)
            .unwrap();
        assert_eq!(outcome.passed, vec![true, false, true, true, true]);
    }

    #[test]
    fn test_diff_boundary() {
        let routine = Routine::Diff { acceptable_error: 2.2 };
        let b = series(&[2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);

        let a = series(&[1.0, 2.0, 3.0, 7.2, 5.0, 6.0]);
        let outcome = routine.evaluate(&[a, b.clone()], Flag::Bad).unwrap();
        assert!(outcome.passed.iter().all(|p| *p));
        assert!(outcome.qc_passed);

        let a = series(&[1.0, 2.0, 3.0, 7.3, 5.0, 6.0]);
        let outcome = routine.evaluate(&[a, b], Flag::Bad).unwrap();
        assert_eq!(outcome.failing_rows(), vec![3]);
    }

    #[test]
    fn test_diff_requires_two_parameters() {
        let t = Thresholds {
            acceptable_error: Some(1.0),
            ..Default::default()
        };
        let err = Routine::build("diff", RoutineKind::Diff, &entry(&["A"], t.clone())).unwrap_err();
        assert!(matches!(err, QcError::Argument(_)));
        assert!(Routine::build("diff", RoutineKind::Diff, &entry(&["A", "B", "C"], t.clone())).is_err());
        assert!(Routine::build("diff", RoutineKind::Diff, &entry(&["A", "B"], t)).is_ok());
    }

    #[test]
    fn test_build_checks_thresholds() {
        let err = Routine::build(
            "range_check",
            RoutineKind::Range,
            &entry(
                &["TEMP_CTD"],
                Thresholds {
                    min_range_value: Some(0.0),
                    ..Default::default()
                },
            ),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            QcError::MissingThreshold {
                field: "max_range_value",
                ..
            }
        ));

        let negative = Thresholds {
            acceptable_error: Some(-1.0),
            ..Default::default()
        };
        assert!(Routine::build("dec", RoutineKind::Decreasing, &entry(&["PRES_CTD"], negative)).is_err());
    }

    #[test]
    fn test_spike_flags_single_extreme_point() {
        let routine = Routine::Spike {
            stddev_factor: 3.0,
            min_stddev: 0.1,
        };
        let data = series(&[10.0, 10.1, 10.0, 10.2, 25.0, 10.1, 10.0, 10.1, 10.2]);
        let outcome = routine.evaluate(&[data], Flag::Suspicious).unwrap();
        assert_eq!(outcome.failing_rows(), vec![4]);
        assert_eq!(outcome.flags[4], Flag::Suspicious);
    }

    #[test]
    fn test_spike_sparse_window_is_exempt() {
        let routine = Routine::Spike {
            stddev_factor: 1.0,
            min_stddev: 0.01,
        };
        let outcome = routine
            .evaluate(&[series(&[1.0, 50.0])], Flag::Bad)
            .unwrap();
        assert_eq!(outcome.passed, vec![true, true]);

        let outcome = routine
            .evaluate(&[vec![Some(1.0), None, Some(1.0), Some(1.0)]], Flag::Bad)
            .unwrap();
        assert_eq!(outcome.passed, vec![true, false, true, true]);
    }
}
