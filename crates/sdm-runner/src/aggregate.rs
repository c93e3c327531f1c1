use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use sdm_core::{Result, SdmError};
use serde::Serialize;

use crate::config::FitterConfig;
use crate::coordinator::TrialReport;
use crate::workspace::{Trial, OUTPUT_DIR};

/// Where one finished trial left its fitter output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialResults {
    pub trial_id: String,
    pub output_dir: PathBuf,
}

impl TrialResults {
    pub fn new(trial_id: impl Into<String>, trial_dir: impl Into<PathBuf>) -> Self {
        Self {
            trial_id: trial_id.into(),
            output_dir: trial_dir.into().join(OUTPUT_DIR),
        }
    }
}

impl From<&Trial> for TrialResults {
    fn from(trial: &Trial) -> Self {
        Self {
            trial_id: trial.id.clone(),
            output_dir: trial.output_dir(),
        }
    }
}

/// Successful trials out of a batch of reports, in report order.
pub fn successful_results(reports: &[TrialReport]) -> Vec<TrialResults> {
    reports
        .iter()
        .filter(|r| r.outcome.is_success())
        .map(|r| TrialResults::from(&r.trial))
        .collect()
}

/// Contribution samples per covariate, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct ContributionTable {
    order: Vec<String>,
    samples: HashMap<String, Vec<f64>>,
}

impl ContributionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, covariate: &str, value: f64) {
        match self.samples.get_mut(covariate) {
            Some(values) => values.push(value),
            None => {
                self.order.push(covariate.to_string());
                self.samples.insert(covariate.to_string(), vec![value]);
            }
        }
    }

    pub fn samples(&self, covariate: &str) -> Option<&[f64]> {
        self.samples.get(covariate).map(Vec::as_slice)
    }

    pub fn mean(&self, covariate: &str) -> Option<f64> {
        let values = self.samples.get(covariate)?;
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Mean contribution per covariate, highest first, at most `top_k`.
    /// Equal means keep first-seen order.
    pub fn rank(&self, top_k: usize) -> RankedPredictors {
        let mut ranked: Vec<RankedPredictor> = self
            .order
            .iter()
            .filter_map(|name| {
                let mean = self.mean(name)?;
                Some(RankedPredictor {
                    name: name.clone(),
                    mean_contribution: mean,
                    samples: self.samples[name].len(),
                })
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.mean_contribution
                .partial_cmp(&a.mean_contribution)
                .unwrap_or(Ordering::Equal)
        });
        ranked.truncate(top_k);
        ranked
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedPredictor {
    pub name: String,
    pub mean_contribution: f64,
    pub samples: usize,
}

pub type RankedPredictors = Vec<RankedPredictor>;

/// Reads fitter results files and ranks covariates by mean contribution.
#[derive(Debug, Clone)]
pub struct ContributionAggregator {
    results_file: String,
    marker: String,
    top_k: usize,
}

impl ContributionAggregator {
    pub fn new(results_file: impl Into<String>, marker: impl Into<String>, top_k: usize) -> Self {
        Self {
            results_file: results_file.into(),
            marker: marker.into(),
            top_k,
        }
    }

    pub fn from_fitter(fitter: &FitterConfig, top_k: usize) -> Self {
        Self::new(&fitter.results_file, &fitter.contribution_marker, top_k)
    }

    pub fn aggregate(&self, trials: &[TrialResults]) -> Result<RankedPredictors> {
        Ok(self.collect(trials)?.rank(self.top_k))
    }

    pub fn collect(&self, trials: &[TrialResults]) -> Result<ContributionTable> {
        let mut table = ContributionTable::new();
        for trial in trials {
            self.read_trial(trial, &mut table)?;
        }
        Ok(table)
    }

    /// Header plus the first data row; later rows are not summary rows.
    fn read_trial(&self, trial: &TrialResults, table: &mut ContributionTable) -> Result<()> {
        let path = trial.output_dir.join(&self.results_file);
        let parse_err = |reason: String| SdmError::ResultParse {
            trial_id: trial.trial_id.clone(),
            path: path.clone(),
            reason,
        };

        let raw = fs::read_to_string(&path)
            .map_err(|e| parse_err(format!("cannot open results file: {}", e)))?;
        let mut lines = raw.lines().filter(|l| !l.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| parse_err("missing header row".to_string()))?;
        let header = split_fields(header);

        let columns: Vec<(usize, String)> = header
            .iter()
            .enumerate()
            .filter(|(_, h)| h.contains(self.marker.as_str()))
            .filter_map(|(i, h)| {
                let name = h.replace(self.marker.as_str(), "").trim().to_string();
                (!name.is_empty()).then_some((i, name))
            })
            .collect();

        let Some(row) = lines.next() else {
            tracing::debug!(trial_id = %trial.trial_id, "results file has no data rows");
            return Ok(());
        };
        let row = split_fields(row);

        for (idx, name) in columns {
            let cell = row
                .get(idx)
                .ok_or_else(|| parse_err(format!("row is missing the '{}' column", name)))?;
            let value: f64 = cell
                .parse()
                .map_err(|_| parse_err(format!("non-numeric contribution '{}' for {}", cell, name)))?;
            if !value.is_finite() {
                return Err(parse_err(format!("non-finite contribution for {}", name)));
            }
            table.record(&name, value);
        }
        Ok(())
    }
}

fn split_fields(line: &str) -> Vec<String> {
    line.split(',')
        .map(|f| f.trim().trim_matches('"').trim().to_string())
        .collect()
}
