//! The radio abstraction the rest of the crate is written against. A hardware driver (or the
//! simulator in `sim`) implements these traits; nothing else in the crate talks to a device.

use failure::Error;
use num::Complex;
use std::time::Duration;

pub type Sample = Complex<f32>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Tx,
    Rx,
}

/// What a scheduled event does once the hardware clock reaches its time
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Action {
    Tune {
        direction: Direction,
        channel: usize,
        freq: f64,
    },
    StartTx,
    StartRx,
    Stop,
}

/// A command tagged with the hardware time (seconds since the last PPS reset) at which it
/// takes effect. It is deliberately not `Clone`: the radio consumes each event exactly once.
#[derive(Debug, PartialEq)]
pub struct ScheduledEvent {
    at: f64,
    action: Action,
}

impl ScheduledEvent {
    pub fn new(at: f64, action: Action) -> Self {
        Self { at, action }
    }

    pub fn at(&self) -> f64 {
        self.at
    }

    pub fn action(&self) -> Action {
        self.action
    }
}

/// Metadata handed to `TxStream::send`. The start event is taken by the first send that sees
/// it, later sends continue the same burst.
#[derive(Debug, Default)]
pub struct TxMetadata {
    pub start: Option<ScheduledEvent>,
    pub end_of_burst: bool,
}

impl TxMetadata {
    pub fn starting_at(start: ScheduledEvent) -> Self {
        Self {
            start: Some(start),
            end_of_burst: false,
        }
    }
}

/// Event codes reported on the transmit async status channel
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsyncEvent {
    BurstAck,
    Underflow,
    UnderflowInPacket,
    SeqError,
    SeqErrorInPacket,
    TimeError,
    Other(u32),
}

/// Error code attached to every received block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxErrorCode {
    None,
    Timeout,
    Overflow,
    LateCommand,
    BrokenChain,
    Alignment,
    BadPacket,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RxMetadata {
    /// Number of valid samples written to each channel buffer
    pub num_samps: usize,
    pub error: RxErrorCode,
    /// Hardware time of the first sample, if the block carries one
    pub time: Option<f64>,
}

pub enum StreamCommand {
    StartContinuous(ScheduledEvent),
    StopContinuous,
}

/// Hardware time in seconds. Only meaningful after the time has been zeroed on a PPS edge
pub trait HardwareClock {
    fn time_now(&self) -> f64;
}

pub trait TxStream {
    fn num_channels(&self) -> usize;
    fn max_samps(&self) -> usize;
    /// Send one buffer per channel. Returns the number of samples accepted per channel, which
    /// is less than the buffer length if `timeout` expired
    fn send(
        &mut self,
        buffs: &[&[Sample]],
        md: &mut TxMetadata,
        timeout: Duration,
    ) -> Result<usize, Error>;
    /// Next event from the async status channel, or `None` if nothing arrived within `timeout`
    fn recv_async_msg(&mut self, timeout: Duration) -> Option<AsyncEvent>;
}

pub trait RxStream {
    fn num_channels(&self) -> usize;
    fn max_samps(&self) -> usize;
    fn issue_stream_cmd(&mut self, cmd: StreamCommand) -> Result<(), Error>;
    /// Fill `buffs` (one per channel, each at least `max_samps` long)
    fn recv(&mut self, buffs: &mut [Vec<Sample>], timeout: Duration)
        -> Result<RxMetadata, Error>;
}

/// Device-level control: sensors, time, tuning and stream creation
pub trait RadioControl: HardwareClock {
    type Tx: TxStream + Send + 'static;
    type Rx: RxStream + Send + 'static;

    fn num_boards(&self) -> usize;
    fn ref_locked(&self, board: usize) -> Result<bool, Error>;
    fn lo_locked(&self, direction: Direction, channel: usize) -> Result<bool, Error>;
    /// Arm the time counter to take the value `time` at the next PPS edge
    fn set_time_next_pps(&mut self, time: f64) -> Result<(), Error>;
    fn set_rate(&mut self, direction: Direction, channel: usize, rate: f64) -> Result<(), Error>;
    fn set_gain(&mut self, direction: Direction, channel: usize, gain: f64) -> Result<(), Error>;
    fn gain(&self, direction: Direction, channel: usize) -> Result<f64, Error>;
    /// Tune immediately. Returns the actual frequency
    fn tune_now(&mut self, direction: Direction, channel: usize, freq: f64) -> Result<f64, Error>;
    /// Queue a timed command
    fn submit(&mut self, event: ScheduledEvent) -> Result<(), Error>;
    fn tx_stream(&mut self, channels: &[usize]) -> Result<Self::Tx, Error>;
    fn rx_stream(&mut self, channels: &[usize]) -> Result<Self::Rx, Error>;
}
