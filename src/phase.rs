//! Phase difference between the two receive channels of a loopback capture. The tone sits at
//! `TONE_FREQ` in baseband (RX is tuned below TX by that much), so both rows are band-passed
//! around it before their instantaneous phases are compared.

use crate::circular::{CircularAccumulator, CircularStatistic};
use crate::error::SyncError;
use crate::iq_buffer::IqBuffer;
use crate::radio::Sample;
use biquad::{Biquad, Coefficients, DirectForm1};
use failure::Error;
use num::Complex;
use std::f64::consts::PI;

pub const TONE_FREQ: f64 = 1e3;
pub const HALF_BANDWIDTH: f64 = 100.;
/// Number of cascaded second-order sections
pub const FILTER_SECTIONS: usize = 5;

/// A band-pass applied to I and Q separately, with identical real coefficients
pub struct ToneFilter {
    sample_rate: f64,
    sections: Vec<Coefficients<f64>>,
    re: Vec<DirectForm1<f64>>,
    im: Vec<DirectForm1<f64>>,
}

/// Butterworth band-pass of order `FILTER_SECTIONS` with its -3 dB edges at
/// `TONE_FREQ -/+ HALF_BANDWIDTH`. The analog prototype is shifted to the (prewarped) band,
/// moved to z with the bilinear transform and split into second-order sections, one per
/// conjugate pole pair. Every section gets the zeros at z = 1 and z = -1 and is scaled to unit
/// gain at the band centre.
fn butterworth_band_pass(sample_rate: f64) -> Vec<Coefficients<f64>> {
    let fs2 = 2. * sample_rate;
    let warp = |f: f64| fs2 * (PI * f / sample_rate).tan();
    let (w1, w2) = (
        warp(TONE_FREQ - HALF_BANDWIDTH),
        warp(TONE_FREQ + HALF_BANDWIDTH),
    );
    let w0 = (w1 * w2).sqrt();
    let bw = w2 - w1;
    // z^-1 at the centre frequency
    let zc = Complex::new(0., -2. * (w0 / fs2).atan()).exp();

    let n = FILTER_SECTIONS as f64;
    (0..FILTER_SECTIONS)
        .map(|k| {
            let proto = Complex::new(0., PI * (2. * k as f64 + n + 1.) / (2. * n)).exp();
            let half = proto * (bw / 2.);
            let root = (half * half - w0 * w0).sqrt();
            // Of the two band-pass poles, keep the upper one. Its conjugate comes from the
            // conjugate prototype pole (or from this one, for the real prototype pole)
            let s = if (half + root).im >= (half - root).im {
                half + root
            } else {
                half - root
            };
            let pole = (Complex::new(fs2, 0.) + s) / (Complex::new(fs2, 0.) - s);
            let (a1, a2) = (-2. * pole.re, pole.norm_sqr());
            let num = Complex::new(1., 0.) - zc * zc;
            let den = Complex::new(1., 0.) + zc * a1 + zc * zc * a2;
            let g = (den / num).norm();
            Coefficients {
                a1,
                a2,
                b0: g,
                b1: 0.,
                b2: -g,
            }
        })
        .collect()
}

impl ToneFilter {
    pub fn new(sample_rate: f64) -> Result<Self, Error> {
        if !(sample_rate > 0.) || TONE_FREQ + HALF_BANDWIDTH >= sample_rate / 2. {
            return Err(SyncError::InvalidParameter(format!(
                "a {} Hz tone cannot be filtered at {} S/s",
                TONE_FREQ, sample_rate
            ))
            .into());
        }
        let sections = butterworth_band_pass(sample_rate);
        let cascade = |sections: &[Coefficients<f64>]| -> Vec<DirectForm1<f64>> {
            sections
                .iter()
                .map(|c| DirectForm1::<f64>::new(*c))
                .collect()
        };
        Ok(Self {
            sample_rate,
            re: cascade(&sections),
            im: cascade(&sections),
            sections,
        })
    }

    /// Magnitude response of the whole cascade at `freq` Hz
    pub fn gain_at(&self, freq: f64) -> f64 {
        let zi = Complex::new(0., -2. * PI * freq / self.sample_rate).exp();
        self.sections
            .iter()
            .map(|c| {
                let num = Complex::new(c.b0, 0.) + zi * c.b1 + zi * zi * c.b2;
                let den = Complex::new(1., 0.) + zi * c.a1 + zi * zi * c.a2;
                (num / den).norm()
            })
            .product()
    }

    pub fn run(&mut self, x: Sample) -> Complex<f64> {
        let re = self.re.iter_mut().fold(x.re as f64, |v, f| f.run(v));
        let im = self.im.iter_mut().fold(x.im as f64, |v, f| f.run(v));
        Complex::new(re, im)
    }

    pub fn filter(&mut self, signal: &[Sample]) -> Vec<Complex<f64>> {
        signal.iter().map(|x| self.run(*x)).collect()
    }
}

/// Removes jumps larger than pi between consecutive phases by adding multiples of 2 pi, the
/// same way numpy's `unwrap` does (including its choice at exactly pi).
pub fn unwrap(phase: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(phase.len());
    let mut correction = 0.;
    for (i, &p) in phase.iter().enumerate() {
        if i > 0 {
            let dd = p - phase[i - 1];
            let mut ddmod = (dd + PI).rem_euclid(2. * PI) - PI;
            if ddmod == -PI && dd > 0. {
                ddmod = PI;
            }
            if dd.abs() >= PI {
                correction += ddmod - dd;
            }
        }
        out.push(p + correction);
    }
    out
}

/// Maps an angle into (-pi, pi]. Idempotent
pub fn wrap(angle: f64) -> f64 {
    if angle > -PI && angle <= PI {
        return angle;
    }
    let w = (angle + PI).rem_euclid(2. * PI) - PI;
    if w <= -PI {
        PI
    } else {
        w
    }
}

/// Per-sample wrapped phase of row 0 minus row 1, after band-passing both rows
pub fn phase_difference(buffer: &IqBuffer, sample_rate: f64) -> Result<Vec<f64>, Error> {
    if buffer.num_channels() < 2 {
        return Err(SyncError::InvalidParameter(format!(
            "need two channels to compare, capture has {}",
            buffer.num_channels()
        ))
        .into());
    }
    let phases = |row: &[Sample]| -> Result<Vec<f64>, Error> {
        let filtered = ToneFilter::new(sample_rate)?.filter(row);
        Ok(unwrap(&filtered.iter().map(|s| s.arg()).collect::<Vec<_>>()))
    };
    let p0 = phases(buffer.channel(0))?;
    let p1 = phases(buffer.channel(1))?;
    Ok(p0.iter().zip(&p1).map(|(a, b)| wrap(a - b)).collect())
}

/// Circular statistic of the phase difference over a single capture
pub fn estimate(buffer: &IqBuffer, sample_rate: f64) -> Result<CircularStatistic, Error> {
    let mut acc = CircularAccumulator::default();
    acc.extend(phase_difference(buffer, sample_rate)?);
    acc.finish()
}
