//! Concurrent transmit/receive of one capture. TX and RX each run on their own thread, own their
//! stream and their fault counters, and stop when their cancel flag is raised. Cleanup (end of
//! burst on TX, stream stop on RX) runs from drop guards, so it also happens on error.

use crate::align;
use crate::config::{StreamConfig, TxWaveform};
use crate::error::SyncError;
use crate::iq_buffer::IqBuffer;
use crate::quality::QualityReport;
use crate::radio::{
    Action, AsyncEvent, HardwareClock, RadioControl, RxErrorCode, RxStream, Sample,
    ScheduledEvent, StreamCommand, TxMetadata, TxStream,
};
use crate::zadoff_chu::ReferenceSequence;
use failure::{format_err, Error};
use num::{Complex, Zero};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Granularity at which the orchestrator checks the abort flag while a capture runs
const ABORT_POLL: Duration = Duration::from_millis(50);
const EOB_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamFault {
    Underflow,
    SequenceError,
    Overflow,
    Timeout,
    Other,
}

impl StreamFault {
    /// `None` for events that are not faults (burst acknowledgements)
    pub fn from_async(event: AsyncEvent) -> Option<Self> {
        match event {
            AsyncEvent::BurstAck => None,
            AsyncEvent::Underflow | AsyncEvent::UnderflowInPacket => Some(StreamFault::Underflow),
            AsyncEvent::SeqError | AsyncEvent::SeqErrorInPacket => {
                Some(StreamFault::SequenceError)
            }
            AsyncEvent::TimeError | AsyncEvent::Other(_) => Some(StreamFault::Other),
        }
    }

    pub fn from_rx_code(code: RxErrorCode) -> Option<Self> {
        match code {
            RxErrorCode::None => None,
            RxErrorCode::Timeout => Some(StreamFault::Timeout),
            RxErrorCode::Overflow => Some(StreamFault::Overflow),
            _ => Some(StreamFault::Other),
        }
    }
}

/// Faults seen by one streaming task. Never shared: each task creates its own and hands it back
/// when joined.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultCounters {
    pub underflow: u64,
    pub sequence_error: u64,
    pub timeout: u64,
    pub overflow: u64,
    pub other: u64,
}

impl FaultCounters {
    pub fn record(&mut self, fault: StreamFault) {
        match fault {
            StreamFault::Underflow => self.underflow += 1,
            StreamFault::SequenceError => self.sequence_error += 1,
            StreamFault::Timeout => self.timeout += 1,
            StreamFault::Overflow => self.overflow += 1,
            StreamFault::Other => self.other += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.underflow + self.sequence_error + self.timeout + self.overflow + self.other
    }
}

/// The per-channel buffer the transmitter sends over and over
#[derive(Clone, Debug)]
pub struct Waveform {
    channels: Vec<Vec<Sample>>,
}

impl Waveform {
    /// Constant complex amplitude `amplitude[i] * e^(j phase[i])` on channel `i`
    pub fn constant(amplitude: &[f32], phase: &[f32], len: usize) -> Result<Self, Error> {
        if amplitude.len() != phase.len() {
            return Err(SyncError::InvalidParameter(format!(
                "{} amplitudes but {} phases",
                amplitude.len(),
                phase.len()
            ))
            .into());
        }
        let channels = amplitude
            .iter()
            .zip(phase)
            .map(|(a, p)| vec![Complex::new(0., *p).exp() * *a; len])
            .collect();
        Ok(Self { channels })
    }

    /// The time-domain frame of `reference`, scaled to a peak magnitude of one, repeated as
    /// often as fits in `len` samples (at least once) and multiplied by each channel's complex
    /// amplitude. Whole frames only, so the repeated buffer stays a periodic frame train.
    pub fn reference_frames(
        reference: &ReferenceSequence,
        amplitude: &[f32],
        phase: &[f32],
        len: usize,
    ) -> Result<Self, Error> {
        let frame = align::kernel(reference);
        let peak = frame.iter().map(|s| s.norm()).fold(0f32, f32::max);
        if peak == 0. {
            return Err(SyncError::InvalidParameter("reference frame is silent".into()).into());
        }
        let repeats = (len / frame.len()).max(1);
        let weights = Self::constant(amplitude, phase, 1)?;
        let channels: Vec<Vec<Sample>> = weights
            .channels
            .iter()
            .map(|w| {
                let w = w[0] / peak;
                frame
                    .iter()
                    .cycle()
                    .take(repeats * frame.len())
                    .map(|s| s * w)
                    .collect::<Vec<Sample>>()
            })
            .collect();
        Ok(Self { channels })
    }

    /// The waveform `config` asks for, about `len` samples long. A Zadoff-Chu waveform needs the
    /// reference sequence.
    pub fn for_stream(
        config: &StreamConfig,
        reference: Option<&ReferenceSequence>,
        len: usize,
    ) -> Result<Self, Error> {
        match (config.tx_waveform, reference) {
            (TxWaveform::Tone, _) => Self::constant(&config.tx_amplitude, &config.tx_phase, len),
            (TxWaveform::ZadoffChu, Some(reference)) => {
                Self::reference_frames(reference, &config.tx_amplitude, &config.tx_phase, len)
            }
            (TxWaveform::ZadoffChu, None) => Err(SyncError::InvalidParameter(
                "a Zadoff-Chu waveform needs a reference sequence".into(),
            )
            .into()),
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, |c| c.len())
    }

    pub fn channel(&self, idx: usize) -> &[Sample] {
        &self.channels[idx]
    }
}

/// Sends the end-of-burst marker when dropped
struct EndOfBurst<'a, T: TxStream> {
    tx: &'a mut T,
}

impl<'a, T: TxStream> Deref for EndOfBurst<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.tx
    }
}

impl<'a, T: TxStream> DerefMut for EndOfBurst<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.tx
    }
}

impl<'a, T: TxStream> Drop for EndOfBurst<'a, T> {
    fn drop(&mut self) {
        let empty: Vec<&[Sample]> = (0..self.tx.num_channels()).map(|_| &[][..]).collect();
        let mut md = TxMetadata {
            start: None,
            end_of_burst: true,
        };
        match self.tx.send(&empty, &mut md, EOB_TIMEOUT) {
            Ok(_) => debug!("end of burst sent"),
            Err(e) => warn!("could not send end of burst: {}", e),
        }
    }
}

/// Issues a stream stop when dropped
struct StreamStop<'a, R: RxStream> {
    rx: &'a mut R,
}

impl<'a, R: RxStream> Deref for StreamStop<'a, R> {
    type Target = R;
    fn deref(&self) -> &R {
        self.rx
    }
}

impl<'a, R: RxStream> DerefMut for StreamStop<'a, R> {
    fn deref_mut(&mut self) -> &mut R {
        self.rx
    }
}

impl<'a, R: RxStream> Drop for StreamStop<'a, R> {
    fn drop(&mut self) {
        match self.rx.issue_stream_cmd(StreamCommand::StopContinuous) {
            Ok(()) => debug!("receive stream stopped"),
            Err(e) => warn!("could not stop receive stream: {}", e),
        }
    }
}

/// Loops as a transmitter until `cancel` is raised or the radio acknowledges the burst.
/// `start` is consumed by the first send.
pub fn transmit<T: TxStream>(
    tx: &mut T,
    waveform: &Waveform,
    start: ScheduledEvent,
    config: &StreamConfig,
    cancel: &AtomicBool,
) -> Result<FaultCounters, Error> {
    if waveform.num_channels() != tx.num_channels() {
        return Err(SyncError::InvalidParameter(format!(
            "waveform has {} channels, stream has {}",
            waveform.num_channels(),
            tx.num_channels()
        ))
        .into());
    }
    let mut faults = FaultCounters::default();
    let buffs: Vec<&[Sample]> = waveform.channels.iter().map(|c| c.as_slice()).collect();
    let mut md = TxMetadata::starting_at(start);
    let mut tx = EndOfBurst { tx };

    while !cancel.load(Ordering::Relaxed) {
        tx.send(&buffs, &mut md, config.io_timeout())?;

        let event = match tx.recv_async_msg(config.async_poll()) {
            Some(event) => event,
            None => continue,
        };
        match StreamFault::from_async(event) {
            None => {
                info!("burst acknowledged");
                break;
            }
            Some(fault) => {
                faults.record(fault);
                match fault {
                    StreamFault::Underflow => warn!(?event, "TX underflow"),
                    StreamFault::SequenceError => error!(?event, "TX sequence error"),
                    _ => warn!(?event, "unexpected TX async event"),
                }
            }
        }
    }

    debug!(?faults, "transmit finished");
    Ok(faults)
}

/// What the receive task hands back when joined
#[derive(Debug)]
pub struct Received {
    pub buffer: IqBuffer,
    pub faults: FaultCounters,
    /// Hardware time of the first sample left after the warm-up trim, taken from the timestamp
    /// of the first stored block. `None` if nothing is left or that block carried no time
    pub first_sample_time: Option<f64>,
}

/// Receives into a fresh buffer until `cancel` is raised. The first receive waits up to
/// `first_timeout` (which has to cover the time until `start`), later ones the configured I/O
/// timeout. The warm-up prefix is trimmed before the buffer is returned.
pub fn receive<R: RxStream>(
    rx: &mut R,
    config: &StreamConfig,
    start: ScheduledEvent,
    first_timeout: Duration,
    cancel: &AtomicBool,
) -> Result<Received, Error> {
    let num_channels = rx.num_channels();
    let max_samps = rx.max_samps();
    let mut buffer = IqBuffer::with_capacity(num_channels, config.buffer_capacity());
    let mut block = vec![vec![Sample::zero(); max_samps]; num_channels];
    let mut faults = FaultCounters::default();
    let mut timeout = first_timeout;
    let mut full = false;
    let mut first_block_time = None;
    let scheduled = start.at();

    rx.issue_stream_cmd(StreamCommand::StartContinuous(start))?;
    let mut rx = StreamStop { rx };

    while !cancel.load(Ordering::Relaxed) {
        let md = rx.recv(&mut block, timeout)?;
        timeout = config.io_timeout();

        if let Some(fault) = StreamFault::from_rx_code(md.error) {
            faults.record(fault);
            match fault {
                StreamFault::Timeout => warn!("RX timeout"),
                StreamFault::Overflow => warn!("RX overflow"),
                _ => error!(code = ?md.error, "RX error"),
            }
        }

        if md.num_samps == 0 {
            continue;
        }
        if buffer.push_block(&block, md.num_samps) {
            if buffer.len() == md.num_samps {
                first_block_time = md.time;
                debug!(time = ?md.time, scheduled, "first block stored");
            }
        } else if !full {
            full = true;
            debug!(len = buffer.len(), "receive buffer full, dropping further blocks");
        }
    }
    drop(rx);

    let warmup = config.warmup_samps();
    buffer.trim_front(warmup);
    let first_sample_time = if buffer.is_empty() {
        None
    } else {
        first_block_time.map(|t| t + warmup as f64 / config.sample_rate)
    };
    debug!(?faults, len = buffer.len(), ?first_sample_time, "receive finished");
    Ok(Received {
        buffer,
        faults,
        first_sample_time,
    })
}

/// Hardware times at which the two streams start
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CaptureSchedule {
    pub tx_start: f64,
    pub rx_start: f64,
}

impl CaptureSchedule {
    /// Offsets both starts from a common base time (the rendezvous start time, or "now")
    pub fn from_base(base: f64, config: &StreamConfig) -> Self {
        Self {
            tx_start: base + config.tx_start_offset_secs,
            rx_start: base + config.rx_start_offset_secs,
        }
    }

    pub fn after_now<C: HardwareClock>(clock: &C, config: &StreamConfig) -> Self {
        Self::from_base(clock.time_now(), config)
    }
}

#[derive(Debug)]
pub struct CaptureOutcome {
    pub buffer: IqBuffer,
    /// Hardware time of `buffer`'s first sample, if the radio timestamps its blocks
    pub first_sample_time: Option<f64>,
    pub tx_faults: FaultCounters,
    pub rx_faults: FaultCounters,
    pub quality: QualityReport,
}

fn join<T>(handle: std::thread::JoinHandle<Result<T, Error>>, name: &str) -> Result<T, Error> {
    handle
        .join()
        .map_err(|_| format_err!("{} task panicked", name))?
}

/// Runs one capture: TX and RX threads, a wait covering the capture, then RX is stopped before
/// TX so the receiver never records the transmitter going silent. `abort` ends the wait early.
/// `reference` is only used when the configured waveform is the Zadoff-Chu frame train.
pub fn run_capture<R: RadioControl>(
    radio: &mut R,
    config: &StreamConfig,
    reference: Option<&ReferenceSequence>,
    schedule: CaptureSchedule,
    abort: &AtomicBool,
) -> Result<CaptureOutcome, Error> {
    if config.channels.is_empty() {
        return Err(SyncError::InvalidParameter("no channels to stream".into()).into());
    }
    let mut tx = radio.tx_stream(&config.channels)?;
    let mut rx = radio.rx_stream(&config.channels)?;
    let waveform =
        Waveform::for_stream(config, reference, tx.max_samps() * config.tx_blocks_per_send)?;
    debug!(kind = ?config.tx_waveform, len = waveform.len(), "transmit waveform ready");

    let now = radio.time_now();
    let first_timeout =
        Duration::from_secs_f64((schedule.rx_start - now).max(0.0)) + config.io_timeout();
    let wait = config
        .capture_secs
        .max(schedule.rx_start - now + config.capture_secs);
    info!(
        now,
        tx_start = schedule.tx_start,
        rx_start = schedule.rx_start,
        wait,
        "starting capture"
    );

    let cancel_tx = Arc::new(AtomicBool::new(false));
    let cancel_rx = Arc::new(AtomicBool::new(false));

    let tx_handle = {
        let cancel = cancel_tx.clone();
        let config = config.clone();
        let start = ScheduledEvent::new(schedule.tx_start, Action::StartTx);
        std::thread::spawn(move || transmit(&mut tx, &waveform, start, &config, &cancel))
    };
    let rx_handle = {
        let cancel = cancel_rx.clone();
        let config = config.clone();
        let start = ScheduledEvent::new(schedule.rx_start, Action::StartRx);
        std::thread::spawn(move || receive(&mut rx, &config, start, first_timeout, &cancel))
    };

    let deadline = Instant::now() + Duration::from_secs_f64(wait.max(0.0));
    while Instant::now() < deadline {
        if abort.load(Ordering::Relaxed) {
            warn!("capture aborted");
            break;
        }
        std::thread::sleep(ABORT_POLL.min(deadline.saturating_duration_since(Instant::now())));
    }

    cancel_rx.store(true, Ordering::Relaxed);
    let rx_res = join(rx_handle, "receive");
    cancel_tx.store(true, Ordering::Relaxed);
    let tx_res = join(tx_handle, "transmit");

    let Received {
        buffer,
        faults: rx_faults,
        first_sample_time,
    } = rx_res?;
    let tx_faults = tx_res?;
    info!(?tx_faults, ?rx_faults, samples = buffer.len(), "capture finished");

    let quality = QualityReport::analyze(&buffer);
    quality.log();

    Ok(CaptureOutcome {
        buffer,
        first_sample_time,
        tx_faults,
        rx_faults,
        quality,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{SimConfig, SimulatedRadio};

    fn short_capture() -> StreamConfig {
        StreamConfig {
            capture_secs: 0.3,
            tx_start_offset_secs: 0.05,
            rx_start_offset_secs: 0.1,
            tx_blocks_per_send: 4,
            ..StreamConfig::default()
        }
    }

    #[test]
    fn classifies_events() {
        assert_eq!(StreamFault::from_async(AsyncEvent::BurstAck), None);
        assert_eq!(
            StreamFault::from_async(AsyncEvent::UnderflowInPacket),
            Some(StreamFault::Underflow)
        );
        assert_eq!(
            StreamFault::from_async(AsyncEvent::SeqError),
            Some(StreamFault::SequenceError)
        );
        assert_eq!(
            StreamFault::from_async(AsyncEvent::Other(42)),
            Some(StreamFault::Other)
        );
        assert_eq!(StreamFault::from_rx_code(RxErrorCode::None), None);
        assert_eq!(
            StreamFault::from_rx_code(RxErrorCode::LateCommand),
            Some(StreamFault::Other)
        );
    }

    #[test]
    fn waveform_has_requested_amplitude_and_phase() {
        let w = Waveform::constant(&[0.8, 0.5], &[0.0, std::f32::consts::FRAC_PI_2], 10).unwrap();
        assert_eq!(w.channel(0).len(), 10);
        assert!((w.channel(0)[3] - Complex::new(0.8, 0.)).norm() < 1e-6);
        assert!((w.channel(1)[9] - Complex::new(0., 0.5)).norm() < 1e-6);
        assert!(Waveform::constant(&[0.8], &[0.0, 0.0], 10).is_err());
    }

    #[test]
    fn reference_waveform_repeats_whole_frames() {
        let zc = crate::zadoff_chu::generate(7, 353, 0).unwrap();
        let w = Waveform::reference_frames(&zc, &[0.8, 0.4], &[0.0, 1.0], 1000).unwrap();
        assert_eq!(w.len(), 2 * 353);
        let peak = w.channel(0).iter().map(|s| s.norm()).fold(0f32, f32::max);
        assert!((peak - 0.8).abs() < 1e-5);
        assert_eq!(w.channel(0)[5], w.channel(0)[353 + 5]);
        // Channel 1 is channel 0 scaled by 0.5 and rotated by one radian
        let ratio = w.channel(1)[17] / w.channel(0)[17];
        assert!((ratio - Complex::new(0., 1.).exp() * 0.5).norm() < 1e-5);

        // Shorter than a frame still gives one frame
        assert_eq!(Waveform::reference_frames(&zc, &[0.8], &[0.0], 100).unwrap().len(), 353);
    }

    #[test]
    fn stream_config_selects_the_waveform() {
        let zc = crate::zadoff_chu::generate(7, 353, 0).unwrap();
        let mut config = StreamConfig::default();
        assert_eq!(Waveform::for_stream(&config, Some(&zc), 50).unwrap().len(), 50);
        config.tx_waveform = TxWaveform::ZadoffChu;
        assert_eq!(Waveform::for_stream(&config, Some(&zc), 4080).unwrap().len(), 11 * 353);
        assert!(Waveform::for_stream(&config, None, 4080).is_err());
    }

    #[test]
    fn capture_on_simulator() {
        let mut radio = SimulatedRadio::new(SimConfig {
            rx_faults: vec![(3, RxErrorCode::Overflow), (5, RxErrorCode::Timeout)],
            tx_events: vec![AsyncEvent::Underflow, AsyncEvent::SeqError, AsyncEvent::Other(7)],
            ..SimConfig::default()
        });
        let config = short_capture();
        let schedule = CaptureSchedule::after_now(&radio, &config);
        let abort = AtomicBool::new(false);
        let outcome = run_capture(&mut radio, &config, None, schedule, &abort).unwrap();

        let buf = &outcome.buffer;
        assert_eq!(buf.num_channels(), 2);
        assert!(buf.len() > 10_000, "captured {} samples", buf.len());
        assert!(buf.len() <= config.buffer_capacity());

        assert_eq!(outcome.rx_faults.overflow, 1);
        assert_eq!(outcome.rx_faults.timeout, 1);
        assert_eq!(outcome.tx_faults.underflow, 1);
        assert_eq!(outcome.tx_faults.sequence_error, 1);
        assert_eq!(outcome.tx_faults.other, 1);

        assert_eq!(radio.eob_count(), 1);
        assert_eq!(radio.stop_count(), 1);
        assert_eq!(radio.tx_started_at(), Some(schedule.tx_start));
        let first = outcome.first_sample_time.unwrap();
        assert!((first - (schedule.rx_start + 0.1)).abs() < 1e-9, "first sample at {}", first);
    }

    #[test]
    fn receive_stops_storing_once_full() {
        let rate = 20e3;
        let mut radio = SimulatedRadio::new(SimConfig {
            sample_rate: rate,
            ..SimConfig::default()
        });
        let config = StreamConfig {
            sample_rate: rate,
            capture_secs: 0.25,
            ..StreamConfig::default()
        };
        // Room for four 2040-sample blocks, about eight arrive before the cancel
        assert_eq!(config.buffer_capacity(), 10_000);
        assert_eq!(config.warmup_samps(), 2_000);

        let mut rx = radio.rx_stream(&[0, 1]).unwrap();
        let cancel = Arc::new(AtomicBool::new(false));
        let canceller = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(800));
                cancel.store(true, Ordering::Relaxed);
            })
        };
        let at = radio.time_now();
        let start = ScheduledEvent::new(at, Action::StartRx);
        let received = receive(&mut rx, &config, start, Duration::from_secs(1), &cancel).unwrap();
        canceller.join().unwrap();

        assert_eq!(received.buffer.len(), 4 * 2040 - 2000);
        assert_eq!(received.faults.total(), 0);
        let first = received.first_sample_time.unwrap();
        assert!((first - (at + 2000. / rate)).abs() < 1e-9);
        assert_eq!(radio.stop_count(), 1);
    }

    #[test]
    fn burst_ack_ends_transmit_early() {
        let mut radio = SimulatedRadio::new(SimConfig {
            tx_events: vec![AsyncEvent::Underflow, AsyncEvent::BurstAck],
            ..SimConfig::default()
        });
        let mut tx = radio.tx_stream(&[0, 1]).unwrap();
        let config = StreamConfig::default();
        let waveform = Waveform::constant(&[0.8, 0.8], &[0., 0.], 2040).unwrap();
        let start = ScheduledEvent::new(radio.time_now(), Action::StartTx);
        // Never raised: only the acknowledgement can end the loop
        let cancel = AtomicBool::new(false);
        let started = Instant::now();
        let faults = transmit(&mut tx, &waveform, start, &config, &cancel).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(faults.underflow, 1);
        assert_eq!(faults.total(), 1);
        assert_eq!(radio.eob_count(), 1);
    }

    #[test]
    fn abort_still_cleans_up() {
        let mut radio = SimulatedRadio::new(SimConfig::default());
        let config = short_capture();
        let schedule = CaptureSchedule::after_now(&radio, &config);
        let abort = AtomicBool::new(true);
        let started = Instant::now();
        let outcome = run_capture(&mut radio, &config, None, schedule, &abort).unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(outcome.buffer.len() <= config.buffer_capacity());
        assert_eq!(radio.eob_count(), 1);
        assert_eq!(radio.stop_count(), 1);
    }

    #[test]
    fn failed_start_still_ends_burst() {
        let mut radio = SimulatedRadio::new(SimConfig::default());
        let mut rx = radio.rx_stream(&[0, 1]).unwrap();
        let config = StreamConfig::default();
        // A start event with the wrong action is rejected by the stream
        let start = ScheduledEvent::new(0.0, Action::Stop);
        let cancel = AtomicBool::new(false);
        assert!(receive(&mut rx, &config, start, Duration::from_millis(10), &cancel).is_err());

        let mut tx = radio.tx_stream(&[0, 1]).unwrap();
        let waveform = Waveform::constant(&[0.8, 0.8], &[0., 0.], 8).unwrap();
        let start = ScheduledEvent::new(0.0, Action::StartRx);
        assert!(transmit(&mut tx, &waveform, start, &config, &cancel).is_err());
        assert_eq!(radio.eob_count(), 1);
    }
}
