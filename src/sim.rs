//! A simulated radio for tests and dry runs. The hardware clock runs in real time (so streaming
//! and scheduling behave like they would on a device), the receive side produces a tone with a
//! configurable phase per channel, and faults can be scripted on both directions.

use crate::radio::{
    Action, AsyncEvent, Direction, HardwareClock, RadioControl, RxErrorCode, RxMetadata,
    RxStream, Sample, ScheduledEvent, StreamCommand, TxMetadata, TxStream,
};
use failure::{bail, Error};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// TX sends may run this far ahead of the hardware clock before they are throttled
const TX_LEAD_SECS: f64 = 0.05;

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub num_channels: usize,
    pub num_boards: usize,
    pub max_samps: usize,
    pub sample_rate: f64,
    /// Hardware time when the simulator is created (before any PPS reset)
    pub initial_time: f64,
    pub pps_period: Duration,
    /// The reference reports lock this long after creation. `None` never locks
    pub ref_lock_delay: Option<Duration>,
    /// Each further board locks this much later than the one before it
    pub ref_lock_stagger: Duration,
    /// LOs report lock this long after a tune takes effect. `None` never locks
    pub lo_lock_delay: Option<Duration>,
    /// Baseband frequency of the received tone
    pub tone_freq: f64,
    pub tone_amplitude: f32,
    /// Phase (rad) of the received tone on each physical channel
    pub channel_phase: Vec<f64>,
    /// When not empty, RX repeats this frame (scaled by `tone_amplitude` and rotated by the
    /// channel's phase) instead of the tone
    pub rx_frame: Vec<Sample>,
    /// Peak amplitude of the uniform noise added to I and Q
    pub noise: f32,
    /// Receive block index at which to report an error code instead of samples
    pub rx_faults: Vec<(u64, RxErrorCode)>,
    /// Events waiting on the TX async channel when the stream is created
    pub tx_events: Vec<AsyncEvent>,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            num_channels: 2,
            num_boards: 1,
            max_samps: 2040,
            sample_rate: 250e3,
            initial_time: 0.0,
            pps_period: Duration::from_secs(1),
            ref_lock_delay: Some(Duration::from_millis(0)),
            ref_lock_stagger: Duration::from_millis(0),
            lo_lock_delay: Some(Duration::from_millis(5)),
            tone_freq: 1e3,
            tone_amplitude: 0.5,
            channel_phase: vec![0.0, 0.0],
            rx_frame: Vec::new(),
            noise: 0.0,
            rx_faults: Vec::new(),
            tx_events: Vec::new(),
            seed: 0,
        }
    }
}

struct SimState {
    created: Instant,
    /// Raw (free-running) time at which the hardware time was zero
    epoch: f64,
    /// Raw time of the armed PPS edge and the value the counter takes there
    pending_pps: Option<(f64, f64)>,
    rates: HashMap<(Direction, usize), f64>,
    gains: HashMap<(Direction, usize), f64>,
    freqs: HashMap<(Direction, usize), f64>,
    /// Hardware time at which each LO reports lock. Missing means never tuned (locked)
    lo_lock_at: HashMap<(Direction, usize), Option<f64>>,
    scheduled: Vec<ScheduledEvent>,
    eob_count: usize,
    stop_count: usize,
    tx_started_at: Option<f64>,
}

impl SimState {
    fn raw(&self) -> f64 {
        self.created.elapsed().as_secs_f64()
    }

    fn hw_time(&mut self) -> f64 {
        let raw = self.raw();
        if let Some((edge, value)) = self.pending_pps {
            if raw >= edge {
                self.epoch = edge - value;
                self.pending_pps = None;
            }
        }
        raw - self.epoch
    }
}

type Shared = Arc<Mutex<SimState>>;

fn lock(state: &Shared) -> MutexGuard<'_, SimState> {
    // A panicking test thread must not take the whole simulator down with it
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone)]
pub struct SimulatedRadio {
    config: Arc<SimConfig>,
    state: Shared,
}

impl SimulatedRadio {
    pub fn new(config: SimConfig) -> Self {
        let state = SimState {
            created: Instant::now(),
            epoch: -config.initial_time,
            pending_pps: None,
            rates: HashMap::new(),
            gains: HashMap::new(),
            freqs: HashMap::new(),
            lo_lock_at: HashMap::new(),
            scheduled: Vec::new(),
            eob_count: 0,
            stop_count: 0,
            tx_started_at: None,
        };
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Number of end-of-burst markers received on any TX stream
    pub fn eob_count(&self) -> usize {
        lock(&self.state).eob_count
    }

    /// Number of stop commands received on any RX stream
    pub fn stop_count(&self) -> usize {
        lock(&self.state).stop_count
    }

    pub fn frequency(&self, direction: Direction, channel: usize) -> Option<f64> {
        lock(&self.state).freqs.get(&(direction, channel)).cloned()
    }

    /// Activation times of all timed tune commands received so far
    pub fn scheduled_tunes(&self) -> Vec<(f64, Action)> {
        lock(&self.state)
            .scheduled
            .iter()
            .map(|e| (e.at(), e.action()))
            .collect()
    }

    pub fn tx_started_at(&self) -> Option<f64> {
        lock(&self.state).tx_started_at
    }

    fn check_channel(&self, channel: usize) -> Result<(), Error> {
        if channel >= self.config.num_channels {
            bail!(
                "channel {} out of range ({} channels)",
                channel,
                self.config.num_channels
            );
        }
        Ok(())
    }

    fn lock_time_after(&self, activation: f64) -> Option<f64> {
        self.config
            .lo_lock_delay
            .map(|d| activation + d.as_secs_f64())
    }
}

impl HardwareClock for SimulatedRadio {
    fn time_now(&self) -> f64 {
        lock(&self.state).hw_time()
    }
}

impl RadioControl for SimulatedRadio {
    type Tx = SimTxStream;
    type Rx = SimRxStream;

    fn num_boards(&self) -> usize {
        self.config.num_boards
    }

    fn ref_locked(&self, board: usize) -> Result<bool, Error> {
        if board >= self.config.num_boards {
            bail!("board {} out of range", board);
        }
        let raw = lock(&self.state).raw();
        let stagger = self.config.ref_lock_stagger.as_secs_f64() * board as f64;
        Ok(self
            .config
            .ref_lock_delay
            .map_or(false, |d| raw >= d.as_secs_f64() + stagger))
    }

    fn lo_locked(&self, direction: Direction, channel: usize) -> Result<bool, Error> {
        self.check_channel(channel)?;
        let mut state = lock(&self.state);
        let now = state.hw_time();
        Ok(match state.lo_lock_at.get(&(direction, channel)) {
            None => true,
            Some(None) => false,
            Some(Some(t)) => now >= *t,
        })
    }

    fn set_time_next_pps(&mut self, time: f64) -> Result<(), Error> {
        let period = self.config.pps_period.as_secs_f64();
        let mut state = lock(&self.state);
        let raw = state.raw();
        let edge = ((raw / period).floor() + 1.0) * period;
        state.pending_pps = Some((edge, time));
        Ok(())
    }

    fn set_rate(&mut self, direction: Direction, channel: usize, rate: f64) -> Result<(), Error> {
        self.check_channel(channel)?;
        if rate <= 0.0 {
            bail!("sample rate must be positive, got {}", rate);
        }
        lock(&self.state).rates.insert((direction, channel), rate);
        Ok(())
    }

    fn set_gain(&mut self, direction: Direction, channel: usize, gain: f64) -> Result<(), Error> {
        self.check_channel(channel)?;
        lock(&self.state).gains.insert((direction, channel), gain);
        Ok(())
    }

    fn gain(&self, direction: Direction, channel: usize) -> Result<f64, Error> {
        self.check_channel(channel)?;
        Ok(lock(&self.state)
            .gains
            .get(&(direction, channel))
            .cloned()
            .unwrap_or(0.0))
    }

    fn tune_now(&mut self, direction: Direction, channel: usize, freq: f64) -> Result<f64, Error> {
        self.check_channel(channel)?;
        let mut state = lock(&self.state);
        let now = state.hw_time();
        state.freqs.insert((direction, channel), freq);
        let locks_at = self.lock_time_after(now);
        state.lo_lock_at.insert((direction, channel), locks_at);
        Ok(freq)
    }

    fn submit(&mut self, event: ScheduledEvent) -> Result<(), Error> {
        match event.action() {
            Action::Tune {
                direction,
                channel,
                freq,
            } => {
                self.check_channel(channel)?;
                let mut state = lock(&self.state);
                let now = state.hw_time();
                state.freqs.insert((direction, channel), freq);
                let locks_at = self.lock_time_after(event.at().max(now));
                state.lo_lock_at.insert((direction, channel), locks_at);
                state.scheduled.push(event);
                Ok(())
            }
            other => bail!("{:?} has to be issued on a stream, not the device", other),
        }
    }

    fn tx_stream(&mut self, channels: &[usize]) -> Result<SimTxStream, Error> {
        for &ch in channels {
            self.check_channel(ch)?;
        }
        Ok(SimTxStream {
            radio: self.clone(),
            channels: channels.to_vec(),
            start: None,
            sent: 0,
            events: self.config.tx_events.iter().cloned().collect(),
        })
    }

    fn rx_stream(&mut self, channels: &[usize]) -> Result<SimRxStream, Error> {
        for &ch in channels {
            self.check_channel(ch)?;
        }
        Ok(SimRxStream {
            radio: self.clone(),
            channels: channels.to_vec(),
            start: None,
            produced: 0,
            block_index: 0,
            faults: self.config.rx_faults.iter().cloned().collect(),
            rng: StdRng::seed_from_u64(self.config.seed),
        })
    }
}

impl SimulatedRadio {
    fn rate(&self, direction: Direction, channel: usize) -> f64 {
        lock(&self.state)
            .rates
            .get(&(direction, channel))
            .cloned()
            .unwrap_or(self.config.sample_rate)
    }
}

pub struct SimTxStream {
    radio: SimulatedRadio,
    channels: Vec<usize>,
    start: Option<f64>,
    sent: u64,
    events: VecDeque<AsyncEvent>,
}

impl TxStream for SimTxStream {
    fn num_channels(&self) -> usize {
        self.channels.len()
    }

    fn max_samps(&self) -> usize {
        self.radio.config.max_samps
    }

    fn send(
        &mut self,
        buffs: &[&[Sample]],
        md: &mut TxMetadata,
        timeout: Duration,
    ) -> Result<usize, Error> {
        if buffs.len() != self.channels.len() {
            bail!(
                "expected {} channel buffers, got {}",
                self.channels.len(),
                buffs.len()
            );
        }
        if let Some(start) = md.start.take() {
            if start.action() != Action::StartTx {
                bail!("TX burst cannot start with {:?}", start.action());
            }
            self.start = Some(start.at());
            self.sent = 0;
            lock(&self.radio.state).tx_started_at = Some(start.at());
        }
        let n = buffs.first().map_or(0, |b| b.len());
        if md.end_of_burst {
            lock(&self.radio.state).eob_count += 1;
            self.events.push_back(AsyncEvent::BurstAck);
            self.start = None;
            return Ok(n);
        }
        let start = match self.start {
            Some(start) => start,
            None => bail!("TX stream is not in a burst"),
        };

        // Throttle to the hardware clock so a send loop behaves like one on a device
        let rate = self.radio.rate(Direction::Tx, self.channels[0]);
        let ahead = (self.sent + n as u64) as f64 / rate - (self.radio.time_now() - start);
        if ahead > TX_LEAD_SECS {
            let wait = Duration::from_secs_f64(ahead - TX_LEAD_SECS);
            if wait > timeout {
                std::thread::sleep(timeout);
                return Ok(0);
            }
            std::thread::sleep(wait);
        }
        self.sent += n as u64;
        Ok(n)
    }

    fn recv_async_msg(&mut self, timeout: Duration) -> Option<AsyncEvent> {
        match self.events.pop_front() {
            Some(event) => Some(event),
            None => {
                std::thread::sleep(timeout);
                None
            }
        }
    }
}

pub struct SimRxStream {
    radio: SimulatedRadio,
    channels: Vec<usize>,
    start: Option<f64>,
    produced: u64,
    block_index: u64,
    faults: HashMap<u64, RxErrorCode>,
    rng: StdRng,
}

impl RxStream for SimRxStream {
    fn num_channels(&self) -> usize {
        self.channels.len()
    }

    fn max_samps(&self) -> usize {
        self.radio.config.max_samps
    }

    fn issue_stream_cmd(&mut self, cmd: StreamCommand) -> Result<(), Error> {
        match cmd {
            StreamCommand::StartContinuous(event) => {
                if event.action() != Action::StartRx {
                    bail!("RX stream cannot start with {:?}", event.action());
                }
                self.start = Some(event.at());
                self.produced = 0;
                self.block_index = 0;
            }
            StreamCommand::StopContinuous => {
                self.start = None;
                lock(&self.radio.state).stop_count += 1;
            }
        }
        Ok(())
    }

    fn recv(
        &mut self,
        buffs: &mut [Vec<Sample>],
        timeout: Duration,
    ) -> Result<RxMetadata, Error> {
        if buffs.len() != self.channels.len() {
            bail!(
                "expected {} channel buffers, got {}",
                self.channels.len(),
                buffs.len()
            );
        }
        let timed_out = RxMetadata {
            num_samps: 0,
            error: RxErrorCode::Timeout,
            time: None,
        };
        let start = match self.start {
            Some(start) => start,
            None => {
                std::thread::sleep(timeout);
                return Ok(timed_out);
            }
        };

        let config = &self.radio.config;
        let rate = self.radio.rate(Direction::Rx, self.channels[0]);
        let n = buffs
            .iter()
            .map(|b| b.len())
            .min()
            .unwrap_or(0)
            .min(config.max_samps);
        let block_end = start + (self.produced + n as u64) as f64 / rate;
        let now = self.radio.time_now();
        if block_end > now {
            let wait = Duration::from_secs_f64(block_end - now);
            if wait > timeout {
                std::thread::sleep(timeout);
                return Ok(timed_out);
            }
            std::thread::sleep(wait);
        }

        let block = self.block_index;
        self.block_index += 1;
        let first = self.produced;
        let t0 = start + first as f64 / rate;
        // Samples of a faulted block are lost, like on the device
        self.produced += n as u64;
        if let Some(code) = self.faults.get(&block) {
            return Ok(RxMetadata {
                num_samps: 0,
                error: *code,
                time: Some(t0),
            });
        }

        for (buff, &ch) in buffs.iter_mut().zip(&self.channels) {
            let phase0 = config.channel_phase.get(ch).cloned().unwrap_or(0.0);
            let rotation = Sample::new(0., phase0 as f32).exp() * config.tone_amplitude;
            for (i, s) in buff.iter_mut().take(n).enumerate() {
                let mut v = if config.rx_frame.is_empty() {
                    let t = t0 + i as f64 / rate;
                    let phase = 2. * PI * config.tone_freq * t + phase0;
                    Sample::new(
                        (config.tone_amplitude as f64 * phase.cos()) as f32,
                        (config.tone_amplitude as f64 * phase.sin()) as f32,
                    )
                } else {
                    let idx = (first + i as u64) % config.rx_frame.len() as u64;
                    config.rx_frame[idx as usize] * rotation
                };
                if config.noise > 0. {
                    v.re += self.rng.gen_range(-config.noise, config.noise);
                    v.im += self.rng.gen_range(-config.noise, config.noise);
                }
                *s = v;
            }
        }

        Ok(RxMetadata {
            num_samps: n,
            error: RxErrorCode::None,
            time: Some(t0),
        })
    }
}
