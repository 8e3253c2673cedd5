//! Capture sessions and their on-disk form. Every capture is a pair of files sharing one token:
//! `data_<token>.iq` with the samples and `metadata_<token>.yml` with the session parameters.

use crate::config::StreamConfig;
use crate::error::SyncError;
use crate::iq_buffer::IqBuffer;
use chrono::NaiveDateTime;
use failure::{Error, ResultExt};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::info;

pub const DATA_PREFIX: &str = "data_";
pub const METADATA_PREFIX: &str = "metadata_";
pub const DATA_EXTENSION: &str = "iq";
pub const METADATA_EXTENSION: &str = "yml";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const TOKEN_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%6f";

/// The gains a capture was taken with. Captures sharing a key are aggregated together.
/// Compared bit-for-bit with `f64::total_cmp`, so `0.0` and `-0.0` are different keys.
#[derive(Clone, Copy, Debug)]
pub struct ConfigKey {
    pub tx_gain_a: f64,
    pub tx_gain_b: f64,
    pub rx_gain_a: f64,
    pub rx_gain_b: f64,
}

impl ConfigKey {
    fn as_array(&self) -> [f64; 4] {
        [self.tx_gain_a, self.tx_gain_b, self.rx_gain_a, self.rx_gain_b]
    }
}

impl PartialEq for ConfigKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ConfigKey {}

impl PartialOrd for ConfigKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ConfigKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_array()
            .iter()
            .zip(other.as_array().iter())
            .map(|(a, b)| a.total_cmp(b))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

/// Parameters of one capture. Fixed once created.
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureSession {
    experiment_id: String,
    measurement_id: String,
    tx_gain: [f64; 2],
    rx_gain: [f64; 2],
    sample_rate: f64,
    frequency: f64,
    capture_time: f64,
    num_channels: usize,
    timestamp: NaiveDateTime,
}

impl CaptureSession {
    pub fn new(
        experiment_id: &str,
        measurement_id: &str,
        tx_gain: [f64; 2],
        rx_gain: [f64; 2],
        stream: &StreamConfig,
        timestamp: NaiveDateTime,
    ) -> Self {
        Self {
            experiment_id: experiment_id.to_string(),
            measurement_id: measurement_id.to_string(),
            tx_gain,
            rx_gain,
            sample_rate: stream.sample_rate,
            frequency: stream.frequency,
            capture_time: stream.capture_secs,
            num_channels: stream.channels.len(),
            timestamp,
        }
    }

    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    pub fn measurement_id(&self) -> &str {
        &self.measurement_id
    }

    pub fn tx_gain(&self) -> [f64; 2] {
        self.tx_gain
    }

    pub fn rx_gain(&self) -> [f64; 2] {
        self.rx_gain
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn capture_time(&self) -> f64 {
        self.capture_time
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    pub fn key(&self) -> ConfigKey {
        ConfigKey {
            tx_gain_a: self.tx_gain[0],
            tx_gain_b: self.tx_gain[1],
            rx_gain_a: self.rx_gain[0],
            rx_gain_b: self.rx_gain[1],
        }
    }

    /// Shared part of the data and metadata file names
    pub fn file_token(&self, host: &str) -> String {
        format!(
            "{}_{}_{}_gainA{}_gainB{}_{}",
            host,
            self.experiment_id,
            self.measurement_id,
            self.rx_gain[0],
            self.rx_gain[1],
            self.timestamp.format(TOKEN_TIMESTAMP_FORMAT)
        )
    }

    pub fn data_file_name(&self, host: &str) -> String {
        format!("{}{}.{}", DATA_PREFIX, self.file_token(host), DATA_EXTENSION)
    }

    pub fn metadata_file_name(&self, host: &str) -> String {
        format!(
            "{}{}.{}",
            METADATA_PREFIX,
            self.file_token(host),
            METADATA_EXTENSION
        )
    }

    pub fn to_record(&self) -> MetadataRecord {
        MetadataRecord {
            experiment_id: Some(Value::String(self.experiment_id.clone())),
            measurement_id: Some(Value::String(self.measurement_id.clone())),
            tx_gain: None,
            tx_gain_a: Some(self.tx_gain[0]),
            tx_gain_b: Some(self.tx_gain[1]),
            rx_gain_a: Some(self.rx_gain[0]),
            rx_gain_b: Some(self.rx_gain[1]),
            timestamp: Some(self.timestamp.format(TIMESTAMP_FORMAT).to_string()),
            sampling_rate: Some(self.sample_rate),
            frequency: Some(self.frequency),
            capture_time: Some(self.capture_time),
            num_channels: Some(self.num_channels),
        }
    }
}

/// The YAML record as written to disk. Everything is optional here, `into_session` decides
/// what is required.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement_id: Option<Value>,
    /// Older captures used one gain for both TX channels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_gain: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_gain_a: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_gain_b: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rx_gain_a: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rx_gain_b: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampling_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_channels: Option<usize>,
}

fn id_string(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl MetadataRecord {
    /// Validates the record. `path` is only used in error messages
    pub fn into_session(self, path: &Path) -> Result<CaptureSession, Error> {
        let missing = |field: &str| -> Error {
            SyncError::MissingMetadata {
                path: path.display().to_string(),
                reason: format!("field `{}` is missing", field),
            }
            .into()
        };

        let tx_gain = match (self.tx_gain_a, self.tx_gain_b, self.tx_gain) {
            (Some(a), Some(b), _) => [a, b],
            (None, None, Some(g)) => [g, g],
            (None, _, _) => return Err(missing("tx_gain_a")),
            (_, None, _) => return Err(missing("tx_gain_b")),
        };
        let timestamp = self.timestamp.ok_or_else(|| missing("timestamp"))?;
        let timestamp = NaiveDateTime::parse_from_str(&timestamp, TIMESTAMP_FORMAT).map_err(|e| {
            Error::from(SyncError::MissingMetadata {
                path: path.display().to_string(),
                reason: format!("bad timestamp `{}`: {}", timestamp, e),
            })
        })?;

        Ok(CaptureSession {
            experiment_id: id_string(self.experiment_id).ok_or_else(|| missing("experiment_id"))?,
            measurement_id: id_string(self.measurement_id)
                .ok_or_else(|| missing("measurement_id"))?,
            tx_gain,
            rx_gain: [
                self.rx_gain_a.ok_or_else(|| missing("rx_gain_a"))?,
                self.rx_gain_b.ok_or_else(|| missing("rx_gain_b"))?,
            ],
            sample_rate: self.sampling_rate.ok_or_else(|| missing("sampling_rate"))?,
            frequency: self.frequency.ok_or_else(|| missing("frequency"))?,
            capture_time: self.capture_time.ok_or_else(|| missing("capture_time"))?,
            num_channels: self.num_channels.unwrap_or(2),
            timestamp,
        })
    }
}

/// The metadata file paired with a data file, or `None` if `data_path` does not follow the
/// `data_<token>` naming
pub fn metadata_path(data_path: &Path) -> Option<PathBuf> {
    let stem = data_path.file_stem()?.to_str()?;
    let token = stem.strip_prefix(DATA_PREFIX)?;
    Some(data_path.with_file_name(format!(
        "{}{}.{}",
        METADATA_PREFIX, token, METADATA_EXTENSION
    )))
}

pub fn write_metadata(path: &Path, session: &CaptureSession) -> Result<(), Error> {
    let file = File::create(path).with_context(|_| format!("creating {}", path.display()))?;
    serde_yaml::to_writer(BufWriter::new(file), &session.to_record())?;
    Ok(())
}

/// Loads and validates the metadata paired with `data_path`
pub fn load_metadata(data_path: &Path) -> Result<CaptureSession, Error> {
    let not_found = |reason: &str| -> Error {
        SyncError::MissingMetadata {
            path: data_path.display().to_string(),
            reason: reason.to_string(),
        }
        .into()
    };
    let meta_path = metadata_path(data_path).ok_or_else(|| not_found("not a data_ file"))?;
    if !meta_path.exists() {
        return Err(not_found(&format!("{} not found", meta_path.display())));
    }
    let file = File::open(&meta_path)?;
    let record: MetadataRecord = serde_yaml::from_reader(BufReader::new(file))
        .with_context(|_| format!("parsing {}", meta_path.display()))?;
    record.into_session(&meta_path)
}

/// Writes the samples and their metadata into `dir`. Returns the data file path
pub fn save_capture(
    dir: &Path,
    host: &str,
    session: &CaptureSession,
    buffer: &IqBuffer,
) -> Result<PathBuf, Error> {
    let data_path = dir.join(session.data_file_name(host));
    let meta_path = dir.join(session.metadata_file_name(host));
    write_metadata(&meta_path, session)?;
    let file =
        File::create(&data_path).with_context(|_| format!("creating {}", data_path.display()))?;
    buffer.write_to(BufWriter::new(file))?;
    info!(
        data = %data_path.display(),
        metadata = %meta_path.display(),
        samples = buffer.len(),
        "capture saved"
    );
    Ok(data_path)
}

pub fn load_capture(data_path: &Path) -> Result<(CaptureSession, IqBuffer), Error> {
    let session = load_metadata(data_path)?;
    let file =
        File::open(data_path).with_context(|_| format!("opening {}", data_path.display()))?;
    let buffer = IqBuffer::read_from(BufReader::new(file), session.num_channels())?;
    Ok((session, buffer))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::radio::Sample;
    use chrono::{NaiveDate, Timelike};

    fn session() -> CaptureSession {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_micro_opt(14, 7, 9, 123_456)
            .unwrap();
        CaptureSession::new("exp3", "12", [40., 40.], [30., 35.5], &StreamConfig::default(), ts)
    }

    fn is_missing(err: &Error) -> bool {
        match err.downcast_ref::<SyncError>() {
            Some(SyncError::MissingMetadata { .. }) => true,
            _ => false,
        }
    }

    #[test]
    fn key_equality_agrees_with_ordering() {
        let key = |rx_gain_a| ConfigKey {
            tx_gain_a: 40.,
            tx_gain_b: 40.,
            rx_gain_a,
            rx_gain_b: 30.,
        };
        let zero = key(0.0);
        let negative_zero = key(-0.0);
        assert_ne!(zero, negative_zero);
        assert_ne!(zero.cmp(&negative_zero), Ordering::Equal);
        assert_eq!(zero, key(0.0));
        assert_eq!(zero.cmp(&key(0.0)), Ordering::Equal);

        let mut groups = std::collections::BTreeMap::new();
        groups.insert(zero, 1);
        groups.insert(negative_zero, 2);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups.keys().filter(|k| **k == zero).count(), 1);
    }

    #[test]
    fn file_names_share_a_token() {
        let s = session();
        let data = s.data_file_name("node1");
        assert_eq!(data, "data_node1_exp3_12_gainA30_gainB35.5_20240305_140709_123456.iq");
        assert_eq!(
            metadata_path(Path::new(&data)).unwrap(),
            PathBuf::from(s.metadata_file_name("node1"))
        );
        assert_eq!(metadata_path(Path::new("/x/capture.iq")), None);
    }

    #[test]
    fn capture_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let rows = vec![
            (0..50).map(|i| Sample::new(i as f32, 0.5)).collect(),
            (0..50).map(|i| Sample::new(-(i as f32), 0.25)).collect(),
        ];
        let buffer = IqBuffer::from_rows(rows).unwrap();
        let s = session();
        let path = save_capture(dir.path(), "node1", &s, &buffer).unwrap();
        let (back, samples) = load_capture(&path).unwrap();
        // Timestamps are stored to the second
        assert_eq!(back.key(), s.key());
        assert_eq!(back.experiment_id(), "exp3");
        assert_eq!(back.timestamp(), s.timestamp().with_nanosecond(0).unwrap());
        assert_eq!(samples, buffer);
    }

    #[test]
    fn single_tx_gain_applies_to_both_channels() {
        let yaml = "experiment_id: 4\nmeasurement_id: 1\ntx_gain: 50\nrx_gain_a: 20\n\
                    rx_gain_b: 25\ntimestamp: '2024-01-01 00:00:00'\nsampling_rate: 250000.0\n\
                    frequency: 920000000.0\ncapture_time: 2\n";
        let record: MetadataRecord = serde_yaml::from_str(yaml).unwrap();
        let s = record.into_session(Path::new("m.yml")).unwrap();
        assert_eq!(s.tx_gain(), [50., 50.]);
        assert_eq!(s.experiment_id(), "4");
        assert_eq!(s.num_channels(), 2);
    }

    #[test]
    fn missing_fields_are_reported() {
        let mut record = session().to_record();
        record.rx_gain_b = None;
        assert!(is_missing(&record.into_session(Path::new("m.yml")).unwrap_err()));

        let mut record = session().to_record();
        record.tx_gain_b = None;
        assert!(is_missing(&record.into_session(Path::new("m.yml")).unwrap_err()));

        let dir = tempfile::tempdir().unwrap();
        let orphan = dir.path().join("data_orphan.iq");
        std::fs::write(&orphan, b"").unwrap();
        assert!(is_missing(&load_metadata(&orphan).unwrap_err()));
    }
}
