//! Frame alignment against a known Zadoff-Chu reference. The reference is treated as the
//! frequency-domain frame, so the transmitted (time-domain) frame is its inverse FFT. Frame
//! starts are found by cross-correlating each capture with that kernel.

use crate::error::SyncError;
use crate::radio::Sample;
use crate::zadoff_chu::ReferenceSequence;
use failure::Error;
use num::{Complex, Zero};
use rustfft::FFTplanner;
use tracing::debug;

/// Time-domain frame: inverse FFT of the reference, scaled by 1/N
pub fn kernel(reference: &ReferenceSequence) -> Vec<Sample> {
    let n = reference.len();
    let mut input = reference.samples().to_vec();
    let mut output = vec![Complex::zero(); n];
    let mut planner = FFTplanner::new(true);
    planner.plan_fft(n).process(&mut input, &mut output);
    output.iter().map(|x| *x / n as f32).collect()
}

/// `c[k] = sum_n x[n + k] * conj(h[n])` for every `k` in `[0, x.len())`. Terms past the end of
/// `x` are zero, so offsets near the end only see a partial frame.
pub fn cross_correlate(x: &[Sample], h: &[Sample]) -> Vec<Sample> {
    if x.is_empty() || h.is_empty() {
        return vec![Complex::zero(); x.len()];
    }
    let size = (x.len() + h.len() - 1).next_power_of_two();
    let forward = |v: &[Sample]| -> Vec<Sample> {
        let mut input = v.to_vec();
        input.resize(size, Complex::zero());
        let mut output = vec![Complex::zero(); size];
        FFTplanner::new(false).plan_fft(size).process(&mut input, &mut output);
        output
    };
    let xf = forward(x);
    let hf = forward(h);

    let mut prod: Vec<Sample> = xf.iter().zip(&hf).map(|(a, b)| a * b.conj()).collect();
    let mut corr = vec![Complex::zero(); size];
    FFTplanner::new(true).plan_fft(size).process(&mut prod, &mut corr);
    corr.truncate(x.len());
    for c in corr.iter_mut() {
        *c = *c / size as f32;
    }
    corr
}

/// Correlation magnitudes divided by their maximum. All zeros if the capture is silent
pub fn normalized_correlation(x: &[Sample], h: &[Sample]) -> Vec<f32> {
    let mags: Vec<f32> = cross_correlate(x, h).iter().map(|c| c.norm()).collect();
    let max = mags.iter().cloned().fold(0f32, f32::max);
    if max == 0. {
        return mags;
    }
    mags.iter().map(|m| m / max).collect()
}

/// Which of the above-threshold offsets become frame starts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeakPolicy {
    /// Every offset above the threshold, so one physical peak can yield several adjacent frames
    AllAboveThreshold,
    /// Only the first offset of every contiguous run above the threshold
    FirstOfRun,
    /// Offsets that are the largest value within `radius` samples on either side
    LocalMaximum { radius: usize },
}

impl Default for PeakPolicy {
    fn default() -> Self {
        PeakPolicy::AllAboveThreshold
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CorrelationPeak {
    pub offset: usize,
    pub magnitude: f32,
}

/// Candidate frame starts in increasing offset order
pub fn find_peaks(norm: &[f32], threshold: f32, policy: PeakPolicy) -> Vec<CorrelationPeak> {
    let above = |i: usize| norm[i] > threshold;
    (0..norm.len())
        .filter(|&i| above(i))
        .filter(|&i| match policy {
            PeakPolicy::AllAboveThreshold => true,
            PeakPolicy::FirstOfRun => i == 0 || !above(i - 1),
            PeakPolicy::LocalMaximum { radius } => {
                let lo = i.saturating_sub(radius);
                let hi = (i + radius + 1).min(norm.len());
                // Ties go to the earliest offset
                (lo..i).all(|j| norm[j] < norm[i]) && (i + 1..hi).all(|j| norm[j] <= norm[i])
            }
        })
        .map(|i| CorrelationPeak {
            offset: i,
            magnitude: norm[i],
        })
        .collect()
}

/// Drops peaks whose frame of `frame_len` samples would run past `signal_len`
pub fn retain_complete(
    peaks: Vec<CorrelationPeak>,
    frame_len: usize,
    signal_len: usize,
) -> Vec<CorrelationPeak> {
    let before = peaks.len();
    let kept: Vec<CorrelationPeak> = peaks
        .into_iter()
        .filter(|p| p.offset + frame_len <= signal_len)
        .collect();
    if kept.len() < before {
        debug!(dropped = before - kept.len(), "discarded incomplete trailing frames");
    }
    kept
}

/// Frames cut out of every capture, indexed (capture, frame, sample)
#[derive(Clone, Debug, PartialEq)]
pub struct FrameTensor {
    captures: usize,
    frames: usize,
    len: usize,
    data: Vec<Sample>,
    peaks: Vec<CorrelationPeak>,
}

impl FrameTensor {
    pub fn num_captures(&self) -> usize {
        self.captures
    }

    pub fn num_frames(&self) -> usize {
        self.frames
    }

    pub fn frame_len(&self) -> usize {
        self.len
    }

    /// Frame starts, as located on the first capture
    pub fn peaks(&self) -> &[CorrelationPeak] {
        &self.peaks
    }

    pub fn frame(&self, capture: usize, frame: usize) -> &[Sample] {
        let start = (capture * self.frames + frame) * self.len;
        &self.data[start..start + self.len]
    }
}

/// Locates frames on the first capture and cuts the same windows out of every capture. All
/// captures are assumed to share one time base (synchronised receivers), so a window is only
/// kept if it fits in the shortest capture.
pub fn align(
    captures: &[&[Sample]],
    reference: &ReferenceSequence,
    threshold: f32,
    policy: PeakPolicy,
) -> Result<FrameTensor, Error> {
    let first = match captures.first() {
        Some(first) => first,
        None => return Err(SyncError::InvalidParameter("no captures to align".into()).into()),
    };
    let n = reference.len();
    let norm = normalized_correlation(first, &kernel(reference));
    let candidates = find_peaks(&norm, threshold, policy);
    let shortest = captures.iter().map(|c| c.len()).min().unwrap_or(0);
    let peaks = retain_complete(candidates, n, shortest);

    let mut data = Vec::with_capacity(captures.len() * peaks.len() * n);
    for capture in captures {
        for p in &peaks {
            data.extend_from_slice(&capture[p.offset..p.offset + n]);
        }
    }
    debug!(captures = captures.len(), frames = peaks.len(), "frames aligned");

    Ok(FrameTensor {
        captures: captures.len(),
        frames: peaks.len(),
        len: n,
        data,
        peaks,
    })
}
