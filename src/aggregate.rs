//! Batch post-processing: phase differences of many captures, grouped by gain configuration.

use crate::circular::CircularAccumulator;
use crate::error::SyncError;
use crate::phase::phase_difference;
use crate::session::{load_capture, ConfigKey, DATA_EXTENSION, DATA_PREFIX};
use failure::{Error, ResultExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One phase difference (radians) together with the gains it was measured at
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhaseSample {
    pub key: ConfigKey,
    pub angle: f64,
}

/// A row of the exported table
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GroupSummary {
    #[serde(rename = "TX Gain A")]
    pub tx_gain_a: f64,
    #[serde(rename = "TX Gain B")]
    pub tx_gain_b: f64,
    #[serde(rename = "RX Gain A")]
    pub rx_gain_a: f64,
    #[serde(rename = "RX Gain B")]
    pub rx_gain_b: f64,
    #[serde(rename = "Circular Mean (degrees)")]
    pub mean_degrees: f64,
    #[serde(rename = "Circular Std Dev (degrees)")]
    pub std_degrees: f64,
    #[serde(rename = "Samples")]
    pub samples: usize,
}

impl GroupSummary {
    pub fn key(&self) -> ConfigKey {
        ConfigKey {
            tx_gain_a: self.tx_gain_a,
            tx_gain_b: self.tx_gain_b,
            rx_gain_a: self.rx_gain_a,
            rx_gain_b: self.rx_gain_b,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PhaseAggregator {
    groups: BTreeMap<ConfigKey, CircularAccumulator>,
}

impl PhaseAggregator {
    pub fn push(&mut self, sample: PhaseSample) {
        self.groups.entry(sample.key).or_default().push(sample.angle);
    }

    pub fn add_capture<I: IntoIterator<Item = f64>>(&mut self, key: ConfigKey, angles: I) {
        self.groups.entry(key).or_default().extend(angles);
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// One row per non-empty group, ordered by key. Empty groups produce no row
    pub fn summaries(&self) -> Vec<GroupSummary> {
        self.groups
            .iter()
            .filter_map(|(key, acc)| match acc.finish() {
                Ok(stat) => Some(GroupSummary {
                    tx_gain_a: key.tx_gain_a,
                    tx_gain_b: key.tx_gain_b,
                    rx_gain_a: key.rx_gain_a,
                    rx_gain_b: key.rx_gain_b,
                    mean_degrees: stat.mean_degrees(),
                    std_degrees: stat.std_degrees(),
                    samples: stat.count,
                }),
                Err(e) => {
                    debug!(?key, "no statistic: {}", e);
                    None
                }
            })
            .collect()
    }
}

#[derive(Clone, Debug, Default)]
pub struct BatchReport {
    pub summaries: Vec<GroupSummary>,
    pub processed: usize,
    pub skipped: usize,
}

fn collect_data_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), Error> {
    for entry in std::fs::read_dir(dir).with_context(|_| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            collect_data_files(&path, out)?;
            continue;
        }
        let is_data = path.extension().map_or(false, |e| e == DATA_EXTENSION)
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with(DATA_PREFIX));
        if is_data {
            out.push(path);
        }
    }
    Ok(())
}

/// Walks `dir` recursively and aggregates every capture found. Captures with missing or broken
/// metadata (or unreadable samples) are logged and skipped. `sample_rate` overrides the rate
/// recorded in the metadata.
pub fn process_directory(dir: &Path, sample_rate: Option<f64>) -> Result<BatchReport, Error> {
    let mut files = Vec::new();
    collect_data_files(dir, &mut files)?;
    files.sort();

    let mut aggregator = PhaseAggregator::default();
    let mut report = BatchReport::default();
    for path in &files {
        let (session, buffer) = match load_capture(path) {
            Ok(capture) => capture,
            Err(e) => {
                match e.downcast_ref::<SyncError>() {
                    Some(SyncError::MissingMetadata { .. }) => warn!("skipping: {}", e),
                    _ => warn!(path = %path.display(), "skipping unreadable capture: {}", e),
                }
                report.skipped += 1;
                continue;
            }
        };
        let rate = sample_rate.unwrap_or_else(|| session.sample_rate());
        match phase_difference(&buffer, rate) {
            Ok(diff) => {
                info!(path = %path.display(), samples = diff.len(), "processed");
                aggregator.add_capture(session.key(), diff);
                report.processed += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), "skipping: {}", e);
                report.skipped += 1;
            }
        }
    }

    report.summaries = aggregator.summaries();
    info!(
        processed = report.processed,
        skipped = report.skipped,
        groups = report.summaries.len(),
        "batch done"
    );
    Ok(report)
}

pub fn write_csv<W: Write>(summaries: &[GroupSummary], w: W) -> Result<(), Error> {
    let mut writer = csv::Writer::from_writer(w);
    for row in summaries {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}
