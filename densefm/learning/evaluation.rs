use std::{collections::BTreeMap, fmt::Write as _};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while tabulating predictions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvaluationError {
    /// Actual and predicted vectors differ in length.
    #[error("{actual} actual labels but {predicted} predictions")]
    LengthMismatch {
        /// Number of actual labels.
        actual: usize,
        /// Number of predictions.
        predicted: usize,
    },
    /// A label could not be mapped to a class.
    #[error("label at index {index} is not finite")]
    NonFiniteLabel {
        /// Position of the offending label.
        index: usize,
    },
}

/// Crosstab of actual (rows) against predicted (columns) classes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    counts: BTreeMap<i64, BTreeMap<i64, u64>>,
    classes: Vec<i64>,
    total: u64,
}

#[allow(clippy::cast_possible_truncation)]
fn class_of(label: f32, index: usize) -> Result<i64, EvaluationError> {
    if label.is_finite() {
        Ok(label.round() as i64)
    } else {
        Err(EvaluationError::NonFiniteLabel { index })
    }
}

impl ConfusionMatrix {
    /// Tabulates paired labels; each label is rounded to its integer class.
    pub fn from_labels(actual: &[f32], predicted: &[f32]) -> Result<Self, EvaluationError> {
        if actual.len() != predicted.len() {
            return Err(EvaluationError::LengthMismatch {
                actual: actual.len(),
                predicted: predicted.len(),
            });
        }
        let mut matrix = Self::default();
        for (index, (&a, &p)) in actual.iter().zip(predicted).enumerate() {
            matrix.record(class_of(a, index)?, class_of(p, index)?);
        }
        Ok(matrix)
    }

    fn record(&mut self, actual: i64, predicted: i64) {
        *self
            .counts
            .entry(actual)
            .or_default()
            .entry(predicted)
            .or_default() += 1;
        for class in [actual, predicted] {
            if let Err(pos) = self.classes.binary_search(&class) {
                self.classes.insert(pos, class);
            }
        }
        self.total += 1;
    }

    /// Number of tabulated pairs.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    /// Every class seen on either axis, ascending.
    #[must_use]
    pub fn classes(&self) -> &[i64] {
        &self.classes
    }

    /// Cell count for one actual/predicted pair.
    #[must_use]
    pub fn count(&self, actual: i64, predicted: i64) -> u64 {
        self.counts
            .get(&actual)
            .and_then(|row| row.get(&predicted))
            .copied()
            .unwrap_or(0)
    }

    fn actual_total(&self, class: i64) -> u64 {
        self.counts.get(&class).map_or(0, |row| row.values().sum())
    }

    fn predicted_total(&self, class: i64) -> u64 {
        self.counts.values().filter_map(|row| row.get(&class)).sum()
    }

    /// Fraction of pairs on the diagonal. `None` when empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn accuracy(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        let correct: u64 = self.classes.iter().map(|&c| self.count(c, c)).sum();
        Some(correct as f64 / self.total as f64)
    }

    /// True positives over predicted positives for `class`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn precision(&self, class: i64) -> Option<f64> {
        let predicted = self.predicted_total(class);
        (predicted > 0).then(|| self.count(class, class) as f64 / predicted as f64)
    }

    /// True positives over actual positives for `class`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn recall(&self, class: i64) -> Option<f64> {
        let actual = self.actual_total(class);
        (actual > 0).then(|| self.count(class, class) as f64 / actual as f64)
    }

    /// Fixed-width table with actuals down the side and predictions across.
    #[must_use]
    pub fn render(&self) -> String {
        let width = self
            .classes
            .iter()
            .map(|c| c.to_string().len())
            .chain(self.counts.values().flat_map(|row| row.values().map(|n| n.to_string().len())))
            .max()
            .unwrap_or(1)
            .max(4);
        let label = "actuals";
        let mut out = String::new();
        let _ = write!(out, "{:<label_w$} | predictions", "", label_w = label.len());
        out.push('\n');
        let _ = write!(out, "{label}");
        out.push_str(" |");
        for class in &self.classes {
            let _ = write!(out, " {class:>width$}");
        }
        out.push('\n');
        out.push_str(&"-".repeat(label.len() + 2 + self.classes.len() * (width + 1)));
        out.push('\n');
        for &actual in &self.classes {
            let _ = write!(out, "{actual:>w$} |", w = label.len());
            for &predicted in &self.classes {
                let _ = write!(out, " {:>width$}", self.count(actual, predicted));
            }
            out.push('\n');
        }
        out
    }
}
