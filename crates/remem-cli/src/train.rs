//! Batch learning from a JSON dataset of `{keywords, text}` records.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use rayon::prelude::*;
use serde::Deserialize;

use remem_core::{CancelFlag, Signal};
use remem_store::{LearnReport, Memory};

/// A dataset entry. Both fields are optional so that incomplete records can
/// be counted and skipped instead of failing the whole file.
#[derive(Debug, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub keywords: Option<Signal>,
    #[serde(default)]
    pub text: Option<String>,
}

pub enum RecordOutcome {
    Learned(LearnReport),
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TrainSummary {
    pub trained: usize,
    pub reached_target: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl TrainSummary {
    fn tally(outcomes: &[RecordOutcome]) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            match outcome {
                RecordOutcome::Learned(report) => {
                    summary.trained += 1;
                    if report.reached_target {
                        summary.reached_target += 1;
                    }
                }
                RecordOutcome::Skipped(_) => summary.skipped += 1,
                RecordOutcome::Failed(_) => summary.failed += 1,
            }
        }
        summary
    }
}

/// First `*.json` in `dir`, by file name.
pub fn default_dataset(dir: &Path) -> Result<PathBuf> {
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("cannot read {}", dir.display()))?;
    let mut candidates: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    candidates.sort();
    match candidates.into_iter().next() {
        Some(path) => Ok(path),
        None => bail!("no .json dataset found in {}", dir.display()),
    }
}

/// Parse a dataset: a JSON array whose elements are decoded one by one.
/// Elements that are not record-shaped become `None`.
pub fn load_dataset(path: &Path) -> Result<Vec<Option<Record>>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read dataset {}", path.display()))?;
    let items: Vec<serde_json::Value> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON array", path.display()))?;
    Ok(items
        .into_iter()
        .map(|item| serde_json::from_value(item).ok())
        .collect())
}

fn learn_record(memory: &Memory, record: Option<&Record>, cancel: &CancelFlag) -> RecordOutcome {
    let Some(record) = record else {
        return RecordOutcome::Skipped("not a {keywords, text} object".to_string());
    };
    let (Some(keywords), Some(text)) = (&record.keywords, &record.text) else {
        return RecordOutcome::Skipped("missing keywords or text".to_string());
    };
    if keywords.is_empty() || text.is_empty() {
        return RecordOutcome::Skipped("empty keywords or text".to_string());
    }
    match memory.learn_with_cancel(keywords, text, cancel) {
        Ok(report) => RecordOutcome::Learned(report),
        Err(e) => RecordOutcome::Failed(e.to_string()),
    }
}

/// Learn every record on a pool of `jobs` threads.
///
/// One record's failure never stops the others. Outcomes are returned in
/// dataset order; cell ids follow completion order.
pub fn train(
    memory: &Memory,
    records: &[Option<Record>],
    jobs: usize,
    cancel: &CancelFlag,
) -> Result<(Vec<RecordOutcome>, TrainSummary)> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .context("cannot start worker pool")?;

    let outcomes: Vec<RecordOutcome> = pool.install(|| {
        records
            .par_iter()
            .enumerate()
            .map(|(index, record)| {
                let outcome = learn_record(memory, record.as_ref(), cancel);
                match &outcome {
                    RecordOutcome::Learned(report) => tracing::info!(
                        "record {index}: learned {} ({} epochs, loss {:.6e})",
                        report.cell_id,
                        report.epochs,
                        report.final_loss
                    ),
                    RecordOutcome::Skipped(why) => tracing::warn!("record {index}: skipped, {why}"),
                    RecordOutcome::Failed(why) => tracing::warn!("record {index}: failed, {why}"),
                }
                outcome
            })
            .collect()
    });

    let summary = TrainSummary::tally(&outcomes);
    Ok((outcomes, summary))
}
