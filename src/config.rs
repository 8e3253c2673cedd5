use crate::error::SyncError;
use crate::zadoff_chu::{self, ReferenceSequence};
use failure::{Error, ResultExt};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Everything a node needs for one measurement. Any section (or field) left out of the JSON
/// file keeps the value of the two-channel B210 measurement setup.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub timing: TimingConfig,
    pub stream: StreamConfig,
    pub rendezvous: RendezvousConfig,
    pub reference: ReferenceConfig,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|_| format!("reading config {}", path.display()))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the sessions cannot run with, before any of them is turned into a
    /// `Duration` or a buffer size
    pub fn validate(&self) -> Result<(), Error> {
        let timing = &self.timing;
        let stream = &self.stream;
        let rendezvous = &self.rendezvous;
        let durations = [
            ("timing.clock_timeout_secs", timing.clock_timeout_secs),
            ("timing.pps_settle_secs", timing.pps_settle_secs),
            ("timing.retune_at_secs", timing.retune_at_secs),
            ("timing.lo_lock_timeout_secs", timing.lo_lock_timeout_secs),
            ("stream.tx_start_offset_secs", stream.tx_start_offset_secs),
            ("stream.rx_start_offset_secs", stream.rx_start_offset_secs),
            ("stream.async_poll_secs", stream.async_poll_secs),
            ("stream.io_timeout_secs", stream.io_timeout_secs),
            ("rendezvous.sync_delay_secs", rendezvous.sync_delay_secs),
            ("rendezvous.sync_timeout_secs", rendezvous.sync_timeout_secs),
            ("rendezvous.start_offset_secs", rendezvous.start_offset_secs),
        ];
        for &(name, value) in durations.iter() {
            check_duration(name, value)?;
        }
        if let Some(value) = rendezvous.ready_timeout_secs {
            check_duration("rendezvous.ready_timeout_secs", value)?;
        }
        if !(stream.sample_rate > 0.0 && stream.sample_rate.is_finite()) {
            return Err(invalid("stream.sample_rate", stream.sample_rate, "positive"));
        }
        if !(stream.capture_secs > 0.0 && stream.capture_secs.is_finite()) {
            return Err(invalid("stream.capture_secs", stream.capture_secs, "positive"));
        }
        if !timing.rx_lo_offset_hz.is_finite() {
            return Err(invalid("timing.rx_lo_offset_hz", timing.rx_lo_offset_hz, "finite"));
        }
        Ok(())
    }
}

fn invalid(name: &str, value: f64, expected: &str) -> Error {
    SyncError::InvalidParameter(format!("{} is {}, has to be {}", name, value, expected)).into()
}

fn check_duration(name: &str, value: f64) -> Result<(), Error> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(invalid(name, value, "a finite number of seconds, not negative"))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long to wait for the external 10 MHz reference to lock
    pub clock_timeout_secs: f64,
    /// Sleep after arming the PPS reset. Must cover at least one full PPS period
    pub pps_settle_secs: f64,
    /// Hardware time at which the initial retune takes effect
    pub retune_at_secs: f64,
    pub lo_lock_timeout_secs: f64,
    /// RX is tuned this far below TX, so the loopback tone shows up at this baseband frequency
    pub rx_lo_offset_hz: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            clock_timeout_secs: 1.0,
            pps_settle_secs: 2.0,
            retune_at_secs: 0.2,
            lo_lock_timeout_secs: 5.0,
            rx_lo_offset_hz: 1e3,
        }
    }
}

impl TimingConfig {
    pub fn clock_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.clock_timeout_secs)
    }

    pub fn pps_settle(&self) -> Duration {
        Duration::from_secs_f64(self.pps_settle_secs)
    }

    pub fn lo_lock_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.lo_lock_timeout_secs)
    }
}

/// What the transmitter repeats for the whole capture
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxWaveform {
    /// Constant complex amplitude per channel, seen as a tone at the RX LO offset
    Tone,
    /// Back-to-back time-domain frames of the reference sequence, for frame alignment
    ZadoffChu,
}

impl Default for TxWaveform {
    fn default() -> Self {
        TxWaveform::Tone
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub sample_rate: f64,
    pub frequency: f64,
    pub channels: Vec<usize>,
    pub capture_secs: f64,
    /// Offsets from the common start time at which TX and RX begin
    pub tx_start_offset_secs: f64,
    pub rx_start_offset_secs: f64,
    /// Per-channel complex amplitude of the transmitted tone, as magnitude and phase (rad)
    pub tx_amplitude: Vec<f32>,
    pub tx_phase: Vec<f32>,
    pub tx_waveform: TxWaveform,
    /// Length of the repeating TX buffer, in multiples of the stream's `max_samps`
    pub tx_blocks_per_send: usize,
    pub async_poll_secs: f64,
    /// Timeout for every send/receive after the first one. The first one also covers the wait
    /// until the scheduled start
    pub io_timeout_secs: f64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            sample_rate: 250e3,
            frequency: 920e6,
            channels: vec![0, 1],
            capture_secs: 2.0,
            tx_start_offset_secs: 1.0,
            rx_start_offset_secs: 2.0,
            tx_amplitude: vec![0.8, 0.8],
            tx_phase: vec![0.0, 0.0],
            tx_waveform: TxWaveform::Tone,
            tx_blocks_per_send: 100,
            async_poll_secs: 0.1,
            io_timeout_secs: 1.0,
        }
    }
}

impl StreamConfig {
    /// Samples dropped from the beginning of every capture while the frontend settles
    pub fn warmup_samps(&self) -> usize {
        (self.sample_rate / 10.0) as usize
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.io_timeout_secs)
    }

    pub fn async_poll(&self) -> Duration {
        Duration::from_secs_f64(self.async_poll_secs)
    }

    /// The receive buffer holds twice the requested duration
    pub fn buffer_capacity(&self) -> usize {
        (self.capture_secs * self.sample_rate * 2.0) as usize
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Number of distinct nodes the coordinator waits for
    pub expected_nodes: usize,
    /// Pause between the last READY and the SYNC broadcast
    pub sync_delay_secs: f64,
    /// Coordinator gives up if not all nodes are ready by then. `None` waits forever
    pub ready_timeout_secs: Option<f64>,
    /// Participant gives up waiting for SYNC after this long
    pub sync_timeout_secs: f64,
    /// Added to the local hardware time on SYNC to get the common start time
    pub start_offset_secs: f64,
    pub request_addr: String,
    pub publish_addr: String,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            expected_nodes: 2,
            sync_delay_secs: 2.0,
            ready_timeout_secs: None,
            sync_timeout_secs: 60.0,
            start_offset_secs: 1.0,
            request_addr: "127.0.0.1:5556".to_string(),
            publish_addr: "127.0.0.1:5557".to_string(),
        }
    }
}

impl RendezvousConfig {
    pub fn sync_delay(&self) -> Duration {
        Duration::from_secs_f64(self.sync_delay_secs)
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_secs.map(Duration::from_secs_f64)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.sync_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub root: u64,
    pub length: usize,
    pub shift: i64,
    /// Normalized correlation level above which a sample counts as a frame start
    pub threshold: f32,
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        Self {
            root: 7,
            length: 353,
            shift: 0,
            threshold: 0.8,
        }
    }
}

impl ReferenceConfig {
    pub fn generate(&self) -> Result<ReferenceSequence, Error> {
        zadoff_chu::generate(self.root, self.length, self.shift)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.stream.sample_rate, 250e3);
        assert_eq!(config.stream.channels, vec![0, 1]);
        assert_eq!(config.stream.warmup_samps(), 25_000);
        assert_eq!(config.stream.buffer_capacity(), 1_000_000);
        assert_eq!(config.reference.length, 353);
        assert_eq!(config.rendezvous.expected_nodes, 2);
        assert!(config.rendezvous.ready_timeout().is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_json(
            r#"{ "stream": { "capture_secs": 0.5 }, "reference": { "root": 5, "length": 63 } }"#,
        )
        .unwrap();
        assert_eq!(config.stream.capture_secs, 0.5);
        assert_eq!(config.stream.frequency, 920e6);
        assert_eq!(config.stream.tx_waveform, TxWaveform::Tone);
        assert_eq!(config.reference.threshold, 0.8);
        assert_eq!(config.reference.generate().unwrap().len(), 63);
    }

    fn rejected_field(json: &str) -> String {
        let err = Config::from_json(json).unwrap_err();
        match err.downcast_ref::<SyncError>() {
            Some(SyncError::InvalidParameter(msg)) => msg.clone(),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn unusable_values_are_rejected() {
        assert!(rejected_field(r#"{ "stream": { "io_timeout_secs": -1 } }"#)
            .starts_with("stream.io_timeout_secs"));
        assert!(rejected_field(r#"{ "timing": { "pps_settle_secs": -0.5 } }"#)
            .starts_with("timing.pps_settle_secs"));
        assert!(rejected_field(r#"{ "rendezvous": { "ready_timeout_secs": -3 } }"#)
            .starts_with("rendezvous.ready_timeout_secs"));
        assert!(rejected_field(r#"{ "stream": { "sample_rate": 0 } }"#)
            .starts_with("stream.sample_rate"));
        assert!(rejected_field(r#"{ "stream": { "sample_rate": -250000 } }"#)
            .starts_with("stream.sample_rate"));
        assert!(rejected_field(r#"{ "stream": { "capture_secs": 0 } }"#)
            .starts_with("stream.capture_secs"));
        // JSON has no NaN literal, but a config built in code can still carry one
        let mut config = Config::default();
        config.timing.clock_timeout_secs = std::f64::NAN;
        assert!(config.validate().is_err());
        config.timing.clock_timeout_secs = std::f64::INFINITY;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_durations_are_accepted() {
        let config = Config::from_json(
            r#"{ "stream": { "tx_start_offset_secs": 0 }, "rendezvous": { "ready_timeout_secs": 0 } }"#,
        )
        .unwrap();
        assert_eq!(config.stream.tx_start_offset_secs, 0.0);
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn waveform_is_selected_by_name() {
        let config = Config::from_json(r#"{ "stream": { "tx_waveform": "zadoff_chu" } }"#).unwrap();
        assert_eq!(config.stream.tx_waveform, TxWaveform::ZadoffChu);
        assert!(Config::from_json(r#"{ "stream": { "tx_waveform": "chirp" } }"#).is_err());
    }

    #[test]
    fn bad_reference_is_rejected() {
        let config = Config::from_json(r#"{ "reference": { "root": 6, "length": 9 } }"#).unwrap();
        assert!(config.reference.generate().is_err());
    }
}
