use std::collections::BTreeMap;

use crate::error::{QcError, Result};

/// Per-row boolean state shared by every QC routine.
///
/// The accumulator starts all-true and only ever narrows: each predicate is
/// ANDed into the current state. Named "combo" vectors are kept on the side
/// and reduced with `combo_all` / `combo_any`.
#[derive(Debug, Clone)]
pub struct BooleanAccumulator {
    state: Vec<bool>,
    /// Row has a value (not null, not NaN).
    present: Vec<bool>,
    combos: BTreeMap<String, Vec<bool>>,
}

impl BooleanAccumulator {
    pub fn new(len: usize) -> Self {
        Self {
            state: vec![true; len],
            present: vec![true; len],
            combos: BTreeMap::new(),
        }
    }

    /// Accumulator whose presence mask follows the missing values of `values`.
    pub fn for_values(values: &[Option<f64>]) -> Self {
        Self {
            state: vec![true; values.len()],
            present: values.iter().map(Option::is_some).collect(),
            combos: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    pub fn state(&self) -> &[bool] {
        &self.state
    }

    pub fn add_predicate(&mut self, predicate: &[bool]) -> Result<()> {
        self.check_shape(predicate)?;
        for (current, p) in self.state.iter_mut().zip(predicate) {
            *current &= *p;
        }
        Ok(())
    }

    /// Add a predicate computed row by row from `values`.
    pub fn add_predicate_from<F>(&mut self, values: &[Option<f64>], predicate: F) -> Result<()>
    where
        F: Fn(f64) -> bool,
    {
        let mask: Vec<bool> = values.iter().map(|v| v.is_some_and(&predicate)).collect();
        self.add_predicate(&mask)
    }

    pub fn reset(&mut self) {
        self.state.iter_mut().for_each(|b| *b = true);
    }

    pub fn add_combo(
        &mut self,
        name: impl Into<String>,
        predicate: &[bool],
        only_true_values: bool,
    ) -> Result<()> {
        self.check_shape(predicate)?;
        let combo = if only_true_values {
            predicate
                .iter()
                .zip(&self.present)
                .map(|(p, present)| *p && *present)
                .collect()
        } else {
            predicate.to_vec()
        };
        self.combos.insert(name.into(), combo);
        Ok(())
    }

    pub fn remove_combo(&mut self, name: &str) {
        self.combos.remove(name);
    }

    pub fn reset_combos(&mut self) {
        self.combos.clear();
    }

    /// Rows true in every combo. Without combos this is the plain accumulator.
    pub fn combo_all(&self) -> Vec<bool> {
        if self.combos.is_empty() {
            return self.state.clone();
        }
        (0..self.len())
            .map(|i| self.combos.values().all(|combo| combo[i]))
            .collect()
    }

    /// Rows true in at least one combo. Without combos this is the plain accumulator.
    pub fn combo_any(&self) -> Vec<bool> {
        if self.combos.is_empty() {
            return self.state.clone();
        }
        (0..self.len())
            .map(|i| self.combos.values().any(|combo| combo[i]))
            .collect()
    }

    pub fn all_passed(&self) -> bool {
        self.state.iter().all(|b| *b)
    }

    pub fn failing_index(&self) -> Vec<usize> {
        self.positions(false)
    }

    pub fn passing_index(&self) -> Vec<usize> {
        self.positions(true)
    }

    fn positions(&self, wanted: bool) -> Vec<usize> {
        self.state
            .iter()
            .enumerate()
            .filter_map(|(i, b)| (*b == wanted).then_some(i))
            .collect()
    }

    fn check_shape(&self, other: &[bool]) -> Result<()> {
        if other.len() != self.state.len() {
            return Err(QcError::ShapeMismatch {
                expected: self.state.len(),
                got: other.len(),
            });
        }
        Ok(())
    }
}
