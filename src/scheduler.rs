//! Time and frequency discipline for a node. The order of operations matters for phase
//! coherence: lock to the shared reference, zero the hardware clock on a PPS edge, then retune
//! every channel with timed commands so all LOs change at the same hardware instant.

use crate::error::SyncError;
use crate::radio::{Action, Direction, RadioControl, ScheduledEvent};
use failure::Error;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Poll interval used while waiting for lock sensors
pub const LOCK_POLL: Duration = Duration::from_millis(10);

/// Waits until every board reports a locked reference. `timeout` bounds the whole wait, not
/// each board. Not retried on failure.
pub fn lock_reference<R: RadioControl>(radio: &R, timeout: Duration) -> Result<(), Error> {
    let start = Instant::now();
    for board in 0..radio.num_boards() {
        while !radio.ref_locked(board)? {
            if start.elapsed() > timeout {
                return Err(SyncError::ClockNotLocked { board, timeout }.into());
            }
            std::thread::sleep(LOCK_POLL);
        }
        debug!(board, "reference locked");
    }
    info!("reference clock locked on {} board(s)", radio.num_boards());
    Ok(())
}

/// Arms the time counter to read zero on the next PPS edge and waits `settle` for the edge to
/// pass. `settle` has to cover at least a full PPS period.
pub fn zero_time_at_next_pps<R: RadioControl>(radio: &mut R, settle: Duration) -> Result<(), Error> {
    radio.set_time_next_pps(0.0)?;
    std::thread::sleep(settle);
    info!(time = radio.time_now(), "hardware time reset on PPS");
    Ok(())
}

/// Retunes every channel at hardware time `at`: TX to `freq`, RX to `freq - rx_lo_offset`.
/// Blocks until every LO reports lock, however long that takes.
pub fn schedule_retune<R: RadioControl>(
    radio: &mut R,
    freq: f64,
    channels: &[usize],
    at: f64,
    rx_lo_offset: f64,
) -> Result<(), Error> {
    submit_tunes(radio, freq, channels, at, rx_lo_offset)?;
    wait_lo_lock(radio, channels, None)
}

/// Like `schedule_retune`, but fails with `ToneLockTimeout` if a channel is not locked by
/// `timeout` after the commands were submitted.
pub fn schedule_retune_within<R: RadioControl>(
    radio: &mut R,
    freq: f64,
    channels: &[usize],
    at: f64,
    rx_lo_offset: f64,
    timeout: Duration,
) -> Result<(), Error> {
    submit_tunes(radio, freq, channels, at, rx_lo_offset)?;
    wait_lo_lock(radio, channels, Some(timeout))
}

fn submit_tunes<R: RadioControl>(
    radio: &mut R,
    freq: f64,
    channels: &[usize],
    at: f64,
    rx_lo_offset: f64,
) -> Result<(), Error> {
    let now = radio.time_now();
    if at <= now {
        debug!(at, now, "retune time already passed, commands execute immediately");
    }
    for &channel in channels {
        radio.submit(ScheduledEvent::new(
            at,
            Action::Tune {
                direction: Direction::Rx,
                channel,
                freq: freq - rx_lo_offset,
            },
        ))?;
        radio.submit(ScheduledEvent::new(
            at,
            Action::Tune {
                direction: Direction::Tx,
                channel,
                freq,
            },
        ))?;
    }
    Ok(())
}

fn wait_lo_lock<R: RadioControl>(
    radio: &R,
    channels: &[usize],
    timeout: Option<Duration>,
) -> Result<(), Error> {
    let start = Instant::now();
    for &direction in &[Direction::Rx, Direction::Tx] {
        for &channel in channels {
            while !radio.lo_locked(direction, channel)? {
                if let Some(timeout) = timeout {
                    if start.elapsed() > timeout {
                        return Err(SyncError::ToneLockTimeout {
                            direction,
                            channel,
                            timeout,
                        }
                        .into());
                    }
                }
                std::thread::sleep(LOCK_POLL);
            }
            debug!(?direction, channel, "LO locked");
        }
    }
    Ok(())
}
