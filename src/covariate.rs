use std::collections::HashMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Columns of an external biomarker dataset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub times: Vec<f64>,
    pub values: Vec<f64>,
    pub subjects: Vec<u64>,
}

/// The rows of one subject.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectSeries {
    pub subject: u64,
    pub times: Vec<f64>,
    pub values: Vec<f64>,
}

impl Series {
    /// A series where every row belongs to subject 0.
    pub fn pooled(times: Vec<f64>, values: Vec<f64>) -> Self {
        let subjects = vec![0; times.len()];
        Self {
            times,
            values,
            subjects,
        }
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn is_consistent(&self) -> bool {
        self.times.len() == self.values.len() && self.times.len() == self.subjects.len()
    }

    /// Subject identifiers in order of first appearance.
    pub fn subject_ids(&self) -> Vec<u64> {
        self.subjects.iter().copied().unique().collect()
    }

    /// Rows grouped per subject, subjects in order of first appearance,
    /// rows of each subject sorted by time.
    pub fn by_subject(&self) -> Vec<SubjectSeries> {
        self.subject_ids()
            .into_iter()
            .map(|subject| {
                let (times, values): (Vec<f64>, Vec<f64>) = self
                    .subjects
                    .iter()
                    .zip(self.times.iter().zip(&self.values))
                    .filter(|(s, _)| **s == subject)
                    .map(|(_, (t, v))| (*t, *v))
                    .sorted_by(|a, b| a.0.total_cmp(&b.0))
                    .unzip();
                SubjectSeries {
                    subject,
                    times,
                    values,
                }
            })
            .collect()
    }

    /// One value per subject, taking the first row of each subject.
    pub fn first_per_subject(&self) -> Vec<(u64, f64)> {
        self.subject_ids()
            .into_iter()
            .filter_map(|subject| {
                self.subjects
                    .iter()
                    .position(|s| *s == subject)
                    .map(|row| (subject, self.values[row]))
            })
            .collect()
    }
}

/// Lookup of covariate and observation datasets by name.
pub trait CovariateSource: Send + Sync {
    fn lookup(&self, name: &str) -> Option<Series>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryCovariates {
    series: HashMap<String, Series>,
}

impl InMemoryCovariates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, series: Series) {
        self.series.insert(name.into(), series);
    }

    pub fn with(mut self, name: impl Into<String>, series: Series) -> Self {
        self.insert(name, series);
        self
    }
}

impl CovariateSource for InMemoryCovariates {
    fn lookup(&self, name: &str) -> Option<Series> {
        self.series.get(name).cloned()
    }
}
