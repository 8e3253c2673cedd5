use crate::radio::Direction;
use failure::Fail;
use std::time::Duration;

/// Conditions callers are expected to tell apart. Everything else travels as a plain
/// `failure::Error`.
#[derive(Debug, Fail)]
pub enum SyncError {
    /// The 10 MHz reference never reported lock. Fatal for the session
    #[fail(display = "reference clock not locked on board {} after {:?}", board, timeout)]
    ClockNotLocked { board: usize, timeout: Duration },
    /// An LO did not confirm the new frequency before the caller's deadline
    #[fail(
        display = "{:?} LO on channel {} did not lock within {:?}",
        direction, channel, timeout
    )]
    ToneLockTimeout {
        direction: Direction,
        channel: usize,
        timeout: Duration,
    },
    #[fail(display = "invalid parameter: {}", _0)]
    InvalidParameter(String),
    /// The metadata record of a capture is absent or lacks a required field
    #[fail(display = "missing metadata for {}: {}", path, reason)]
    MissingMetadata { path: String, reason: String },
    #[fail(display = "aggregation group has no samples")]
    EmptyAggregationGroup,
    #[fail(display = "rendezvous timed out after {:?} while {}", timeout, stage)]
    RendezvousTimeout {
        timeout: Duration,
        stage: &'static str,
    },
    #[fail(display = "unexpected message on the bus: {}", _0)]
    UnexpectedMessage(String),
    /// The session was asked to stop before it could capture anything
    #[fail(display = "aborted while {}", stage)]
    Aborted { stage: &'static str },
}
