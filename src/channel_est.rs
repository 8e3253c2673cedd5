use crate::align::{align, FrameTensor, PeakPolicy};
use crate::error::SyncError;
use crate::iq_buffer::IqBuffer;
use crate::radio::Sample;
use crate::zadoff_chu::ReferenceSequence;
use failure::{Error, ResultExt};
use num::{Complex, Zero};
use rustfft::FFTplanner;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;
use tracing::{debug, info};

/// Per-subcarrier channel response for every (capture, frame)
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelResponse {
    captures: usize,
    frames: usize,
    len: usize,
    data: Vec<Sample>,
}

impl ChannelResponse {
    pub fn num_captures(&self) -> usize {
        self.captures
    }

    pub fn num_frames(&self) -> usize {
        self.frames
    }

    pub fn num_subcarriers(&self) -> usize {
        self.len
    }

    pub fn response(&self, capture: usize, frame: usize) -> &[Sample] {
        let start = (capture * self.frames + frame) * self.len;
        &self.data[start..start + self.len]
    }

    /// Phase (radians) of capture `a` relative to capture `b` in one frame, combining all
    /// subcarriers weighted by their magnitude
    pub fn relative_phase(&self, a: usize, b: usize, frame: usize) -> f64 {
        let sum: Complex<f64> = self
            .response(a, frame)
            .iter()
            .zip(self.response(b, frame))
            .map(|(x, y)| {
                let p = x * y.conj();
                Complex::new(p.re as f64, p.im as f64)
            })
            .sum();
        sum.arg()
    }
}

/// FFT of every frame divided element-wise by the reference. With the reference used as the
/// frequency-domain frame this is the channel seen by each subcarrier.
pub fn estimate_channel(
    frames: &FrameTensor,
    reference: &ReferenceSequence,
) -> Result<ChannelResponse, Error> {
    let n = frames.frame_len();
    if n != reference.len() {
        return Err(SyncError::InvalidParameter(format!(
            "frames are {} samples long but the reference has {}",
            n,
            reference.len()
        ))
        .into());
    }

    let mut planner = FFTplanner::new(false);
    let fft = planner.plan_fft(n);
    let mut data = Vec::with_capacity(frames.num_captures() * frames.num_frames() * n);
    let mut spectrum = vec![Complex::zero(); n];
    for capture in 0..frames.num_captures() {
        for frame in 0..frames.num_frames() {
            let mut input = frames.frame(capture, frame).to_vec();
            fft.process(&mut input, &mut spectrum);
            data.extend(spectrum.iter().zip(reference.iter()).map(|(x, r)| x / r));
        }
    }

    Ok(ChannelResponse {
        captures: frames.num_captures(),
        frames: frames.num_frames(),
        len: n,
        data,
    })
}

/// Reads every file as `num_channels` rows of little-endian f32 IQ and returns all rows in file
/// order. Receivers that record one channel per file use `num_channels = 1`.
pub fn load_captures<P: AsRef<Path>>(
    paths: &[P],
    num_channels: usize,
) -> Result<Vec<Vec<Sample>>, Error> {
    let mut captures = Vec::new();
    for path in paths {
        let path = path.as_ref();
        let file = File::open(path).with_context(|_| format!("opening {}", path.display()))?;
        let buffer = IqBuffer::read_from(BufReader::new(file), num_channels)
            .with_context(|_| format!("reading {}", path.display()))?;
        debug!(path = %path.display(), samples = buffer.len(), "capture loaded");
        captures.extend(buffer.into_rows());
    }
    Ok(captures)
}

/// A row of the channel report
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FramePhase {
    #[serde(rename = "Frame")]
    pub frame: usize,
    /// Frame start on the first capture, in samples
    #[serde(rename = "Offset")]
    pub offset: usize,
    #[serde(rename = "Capture")]
    pub capture: usize,
    /// Phase of `capture` relative to the first capture
    #[serde(rename = "Relative Phase (degrees)")]
    pub phase_degrees: f64,
}

/// Aligns the captures on the reference frames, estimates the channel of every frame and
/// reports the phase of each capture relative to the first one, frame by frame.
pub fn frame_phases(
    captures: &[&[Sample]],
    reference: &ReferenceSequence,
    threshold: f32,
    policy: PeakPolicy,
) -> Result<Vec<FramePhase>, Error> {
    let frames = align(captures, reference, threshold, policy)?;
    let response = estimate_channel(&frames, reference)?;
    let mut rows = Vec::with_capacity(frames.num_frames() * captures.len().saturating_sub(1));
    for (frame, peak) in frames.peaks().iter().enumerate() {
        for capture in 1..response.num_captures() {
            rows.push(FramePhase {
                frame,
                offset: peak.offset,
                capture,
                phase_degrees: response.relative_phase(capture, 0, frame).to_degrees(),
            });
        }
    }
    info!(
        captures = response.num_captures(),
        frames = response.num_frames(),
        "channel estimated"
    );
    Ok(rows)
}

pub fn write_frame_phases<W: Write>(rows: &[FramePhase], w: W) -> Result<(), Error> {
    let mut writer = csv::Writer::from_writer(w);
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}
