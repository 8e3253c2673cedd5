//! One measurement on one node: lock and discipline the radio, agree on a start time, capture
//! and write the result to disk.

use crate::config::{Config, TxWaveform};
use crate::error::SyncError;
use crate::radio::{Direction, RadioControl};
use crate::scheduler::{lock_reference, schedule_retune_within, zero_time_at_next_pps};
use crate::session::{save_capture, CaptureSession};
use crate::stream::{run_capture, CaptureSchedule, FaultCounters};
use failure::{bail, Error};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Who is measuring what, and where the capture goes
#[derive(Clone, Debug)]
pub struct NodeSettings {
    pub host: String,
    pub experiment_id: String,
    pub measurement_id: String,
    /// Gains of channels A and B, in the order of `StreamConfig::channels`
    pub tx_gain: [f64; 2],
    pub rx_gain: [f64; 2],
    pub out_dir: PathBuf,
}

#[derive(Debug)]
pub struct NodeReport {
    pub data_path: PathBuf,
    pub samples: usize,
    pub tx_faults: FaultCounters,
    pub rx_faults: FaultCounters,
    pub saturated: bool,
    pub aborted: bool,
}

/// Reference lock, PPS time reset, rates and gains, then a timed retune of every channel.
/// Any failure here ends the session.
pub fn prepare_radio<R: RadioControl>(
    radio: &mut R,
    config: &Config,
    settings: &NodeSettings,
) -> Result<(), Error> {
    let channels = &config.stream.channels;
    if channels.len() > 2 {
        return Err(SyncError::InvalidParameter(format!(
            "gains are given for two channels, {} configured",
            channels.len()
        ))
        .into());
    }

    lock_reference(radio, config.timing.clock_timeout())?;
    zero_time_at_next_pps(radio, config.timing.pps_settle())?;

    for (i, &channel) in channels.iter().enumerate() {
        for &direction in &[Direction::Tx, Direction::Rx] {
            radio.set_rate(direction, channel, config.stream.sample_rate)?;
        }
        radio.set_gain(Direction::Tx, channel, settings.tx_gain[i])?;
        radio.set_gain(Direction::Rx, channel, settings.rx_gain[i])?;
        info!(
            channel,
            tx_gain = radio.gain(Direction::Tx, channel)?,
            rx_gain = radio.gain(Direction::Rx, channel)?,
            "gains set"
        );
    }

    schedule_retune_within(
        radio,
        config.stream.frequency,
        channels,
        config.timing.retune_at_secs,
        config.timing.rx_lo_offset_hz,
        config.timing.lo_lock_timeout(),
    )
}

fn check_abort(abort: &AtomicBool, stage: &'static str) -> Result<(), Error> {
    if abort.load(Ordering::Relaxed) {
        warn!(stage, "session aborted");
        return Err(SyncError::Aborted { stage }.into());
    }
    Ok(())
}

/// Runs a full session. `start_base` supplies the common base time on the radio's clock, either
/// from the rendezvous or simply "now" for a standalone node. An abort before the capture starts
/// ends the session with `Aborted`; an abort during the capture keeps what was received. Nothing
/// is written if the capture holds no samples.
pub fn run_node<R, F>(
    radio: &mut R,
    config: &Config,
    settings: &NodeSettings,
    start_base: F,
    abort: &AtomicBool,
) -> Result<NodeReport, Error>
where
    R: RadioControl,
    F: FnOnce(&R) -> Result<f64, Error>,
{
    let reference = match config.stream.tx_waveform {
        TxWaveform::ZadoffChu => Some(config.reference.generate()?),
        TxWaveform::Tone => None,
    };
    prepare_radio(radio, config, settings)?;
    check_abort(abort, "preparing the radio")?;

    let base = start_base(radio)?;
    check_abort(abort, "agreeing on a start time")?;
    let schedule = CaptureSchedule::from_base(base, &config.stream);
    let outcome = run_capture(radio, &config.stream, reference.as_ref(), schedule, abort)?;
    let aborted = abort.load(Ordering::Relaxed);
    if aborted {
        warn!("session aborted, keeping the partial capture");
    }
    if outcome.buffer.is_empty() {
        bail!("capture holds no samples after the warm-up trim, nothing saved");
    }

    let session = CaptureSession::new(
        &settings.experiment_id,
        &settings.measurement_id,
        settings.tx_gain,
        settings.rx_gain,
        &config.stream,
        chrono::Local::now().naive_local(),
    );
    let data_path = save_capture(&settings.out_dir, &settings.host, &session, &outcome.buffer)?;

    Ok(NodeReport {
        data_path,
        samples: outcome.buffer.len(),
        tx_faults: outcome.tx_faults,
        rx_faults: outcome.rx_faults,
        saturated: outcome.quality.saturated(),
        aborted,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::align::PeakPolicy;
    use crate::channel_est::frame_phases;
    use crate::config::{StreamConfig, TimingConfig};
    use crate::phase;
    use crate::radio::Sample;
    use crate::radio::HardwareClock;
    use crate::session::load_capture;
    use crate::sim::{SimConfig, SimulatedRadio};
    use crate::stream::Waveform;
    use std::time::Duration;

    fn quick_config() -> Config {
        Config {
            timing: TimingConfig {
                pps_settle_secs: 0.1,
                retune_at_secs: 0.15,
                lo_lock_timeout_secs: 1.0,
                ..TimingConfig::default()
            },
            stream: StreamConfig {
                capture_secs: 0.3,
                tx_start_offset_secs: 0.05,
                rx_start_offset_secs: 0.1,
                tx_blocks_per_send: 4,
                ..StreamConfig::default()
            },
            ..Config::default()
        }
    }

    fn quick_radio(channel_phase: Vec<f64>) -> SimulatedRadio {
        SimulatedRadio::new(SimConfig {
            pps_period: Duration::from_millis(50),
            channel_phase,
            ..SimConfig::default()
        })
    }

    fn settings(out_dir: PathBuf) -> NodeSettings {
        NodeSettings {
            host: "node1".into(),
            experiment_id: "exp".into(),
            measurement_id: "7".into(),
            tx_gain: [40., 41.],
            rx_gain: [30., 35.],
            out_dir,
        }
    }

    #[test]
    fn standalone_session_writes_a_readable_capture() {
        let dir = tempfile::tempdir().unwrap();
        let config = quick_config();
        let mut radio = quick_radio(vec![0.5, 0.0]);
        let abort = AtomicBool::new(false);
        let report = run_node(
            &mut radio,
            &config,
            &settings(dir.path().to_path_buf()),
            |r| Ok(r.time_now()),
            &abort,
        )
        .unwrap();

        assert!(!report.aborted);
        assert!(!report.saturated);
        assert_eq!(report.rx_faults.total(), 0);
        assert_eq!(radio.gain(Direction::Rx, 1).unwrap(), 35.);
        assert_eq!(radio.frequency(Direction::Tx, 0), Some(920e6));
        assert_eq!(radio.frequency(Direction::Rx, 0), Some(920e6 - 1e3));
        assert_eq!(radio.eob_count(), 1);

        let (session, buffer) = load_capture(&report.data_path).unwrap();
        assert_eq!(buffer.len(), report.samples);
        assert_eq!(session.rx_gain(), [30., 35.]);
        assert_eq!(session.measurement_id(), "7");
        let stat = phase::estimate(&buffer, session.sample_rate()).unwrap();
        assert!((stat.mean - 0.5).abs() < 0.05, "mean {}", stat.mean);
    }

    #[test]
    fn reference_frames_survive_a_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = quick_config();
        config.stream.tx_waveform = TxWaveform::ZadoffChu;
        let reference = config.reference.generate().unwrap();
        let frame = Waveform::reference_frames(&reference, &[1.0], &[0.0], 0).unwrap();
        let mut radio = SimulatedRadio::new(SimConfig {
            pps_period: Duration::from_millis(50),
            channel_phase: vec![0.5, 0.0],
            rx_frame: frame.channel(0).to_vec(),
            ..SimConfig::default()
        });
        let abort = AtomicBool::new(false);
        let report = run_node(
            &mut radio,
            &config,
            &settings(dir.path().to_path_buf()),
            |r| Ok(r.time_now()),
            &abort,
        )
        .unwrap();

        let (_, buffer) = load_capture(&report.data_path).unwrap();
        let rows: Vec<&[Sample]> = buffer.rows().iter().map(|r| r.as_slice()).collect();
        let phases = frame_phases(&rows, &reference, config.reference.threshold, PeakPolicy::default())
            .unwrap();
        assert!(phases.len() > 100, "{} frames", phases.len());
        for row in &phases {
            assert!((row.phase_degrees + 0.5f64.to_degrees()).abs() < 0.1, "{:?}", row);
        }
    }

    #[test]
    fn start_time_failure_skips_the_capture() {
        let dir = tempfile::tempdir().unwrap();
        let config = quick_config();
        let mut radio = quick_radio(vec![0.0, 0.0]);
        let abort = AtomicBool::new(false);
        let res = run_node(
            &mut radio,
            &config,
            &settings(dir.path().to_path_buf()),
            |_| Err(SyncError::UnexpectedMessage("OK".into()).into()),
            &abort,
        );
        assert!(res.is_err());
        assert_eq!(radio.eob_count(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn abort_before_capture_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let config = quick_config();
        let mut radio = quick_radio(vec![0.0, 0.0]);
        let abort = AtomicBool::new(false);
        // Ctrl-C arrives while the node waits for its start time
        let err = run_node(
            &mut radio,
            &config,
            &settings(dir.path().to_path_buf()),
            |r| {
                abort.store(true, Ordering::Relaxed);
                Ok(r.time_now())
            },
            &abort,
        )
        .unwrap_err();
        match err.downcast_ref::<SyncError>() {
            Some(SyncError::Aborted { stage }) => assert_eq!(*stage, "agreeing on a start time"),
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(radio.eob_count(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn capture_shorter_than_warm_up_is_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = quick_config();
        // 0.05 s of samples against a 0.1 s warm-up
        config.stream.capture_secs = 0.05;
        let mut radio = quick_radio(vec![0.0, 0.0]);
        let abort = AtomicBool::new(false);
        let res = run_node(
            &mut radio,
            &config,
            &settings(dir.path().to_path_buf()),
            |r| Ok(r.time_now()),
            &abort,
        );
        assert!(res.is_err());
        assert_eq!(radio.eob_count(), 1);
        assert_eq!(radio.stop_count(), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn unlocked_reference_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = quick_config();
        config.timing.clock_timeout_secs = 0.05;
        let mut radio = SimulatedRadio::new(SimConfig {
            ref_lock_delay: None,
            ..SimConfig::default()
        });
        let err = prepare_radio(&mut radio, &config, &settings(dir.path().to_path_buf()))
            .unwrap_err();
        match err.downcast_ref::<SyncError>() {
            Some(SyncError::ClockNotLocked { board: 0, .. }) => (),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
