//! Advisory checks run once after every capture. Nothing here fails a capture, the results are
//! logged so an operator can adjust gains.

use crate::iq_buffer::IqBuffer;
use crate::phase::{unwrap, wrap};
use tracing::{debug, info, warn};

/// Magnitude above which the whole capture is flagged as saturated
pub const SATURATION_LEVEL: f32 = 1.0;
/// Per-channel level for the "close to saturation" warnings
pub const NEAR_SATURATION_LEVEL: f32 = 0.9;

#[derive(Clone, Debug, PartialEq)]
pub struct ChannelQuality {
    pub mean_amplitude: f32,
    pub std_amplitude: f32,
    pub min_amplitude: f32,
    pub max_amplitude: f32,
    pub max_i: f32,
    pub max_q: f32,
}

impl ChannelQuality {
    fn measure(samples: &[crate::radio::Sample]) -> Self {
        if samples.is_empty() {
            return Self {
                mean_amplitude: 0.,
                std_amplitude: 0.,
                min_amplitude: 0.,
                max_amplitude: 0.,
                max_i: 0.,
                max_q: 0.,
            };
        }
        let n = samples.len() as f64;
        let mut sum = 0f64;
        let mut sum_sq = 0f64;
        let mut min = std::f32::INFINITY;
        let mut max = 0f32;
        let (mut max_i, mut max_q) = (0f32, 0f32);
        for s in samples {
            let a = s.norm();
            sum += a as f64;
            sum_sq += (a as f64) * (a as f64);
            min = min.min(a);
            max = max.max(a);
            max_i = max_i.max(s.re.abs());
            max_q = max_q.max(s.im.abs());
        }
        let mean = sum / n;
        let var = (sum_sq / n - mean * mean).max(0.);
        Self {
            mean_amplitude: mean as f32,
            std_amplitude: var.sqrt() as f32,
            min_amplitude: min,
            max_amplitude: max,
            max_i,
            max_q,
        }
    }

    pub fn iq_near_saturation(&self) -> bool {
        self.max_i > NEAR_SATURATION_LEVEL || self.max_q > NEAR_SATURATION_LEVEL
    }

    pub fn amplitude_near_saturation(&self) -> bool {
        self.max_amplitude > NEAR_SATURATION_LEVEL
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct QualityReport {
    pub max_amplitude: f32,
    pub channels: Vec<ChannelQuality>,
    /// Mean (wrapped) and standard deviation of the raw CH0 - CH1 phase difference in degrees.
    /// Unfiltered, so only indicative. `None` with fewer than two channels or no samples
    pub phase_difference: Option<(f64, f64)>,
}

impl QualityReport {
    pub fn analyze(buffer: &IqBuffer) -> Self {
        let channels: Vec<ChannelQuality> = buffer
            .rows()
            .iter()
            .map(|row| ChannelQuality::measure(row))
            .collect();
        let max_amplitude = channels
            .iter()
            .map(|c| c.max_amplitude)
            .fold(0f32, f32::max);

        let phase_difference = if buffer.num_channels() >= 2 && !buffer.is_empty() {
            let p0 = unwrap(&buffer.channel(0).iter().map(|s| s.arg() as f64).collect::<Vec<_>>());
            let p1 = unwrap(&buffer.channel(1).iter().map(|s| s.arg() as f64).collect::<Vec<_>>());
            let diff: Vec<f64> = p0.iter().zip(&p1).map(|(a, b)| a - b).collect();
            let n = diff.len() as f64;
            let mean = diff.iter().sum::<f64>() / n;
            let var = diff.iter().map(|d| (d - mean) * (d - mean)).sum::<f64>() / n;
            Some((wrap(mean).to_degrees(), var.sqrt().to_degrees()))
        } else {
            None
        };

        Self {
            max_amplitude,
            channels,
            phase_difference,
        }
    }

    pub fn saturated(&self) -> bool {
        self.max_amplitude > SATURATION_LEVEL
    }

    pub fn log(&self) {
        if self.saturated() {
            warn!(
                "potential IQ saturation: max amplitude {:.4} (> {})",
                self.max_amplitude, SATURATION_LEVEL
            );
        } else {
            debug!("max IQ amplitude {:.4}", self.max_amplitude);
        }
        if let Some((mean, std)) = self.phase_difference {
            info!("average phase difference CH0 - CH1: {:.2} deg (std {:.2} deg)", mean, std);
        }
        for (ch, q) in self.channels.iter().enumerate() {
            info!(
                "RX {}: amplitude avg={:.4} std={:.4} min={:.4} max={:.4}, max |I|={:.4} max |Q|={:.4}",
                ch,
                q.mean_amplitude,
                q.std_amplitude,
                q.min_amplitude,
                q.max_amplitude,
                q.max_i,
                q.max_q
            );
            if q.iq_near_saturation() {
                warn!("RX {}: I/Q component close to saturation, consider reducing gain", ch);
            }
            if q.amplitude_near_saturation() {
                warn!("RX {}: amplitude close to saturation, consider reducing gain", ch);
            }
        }
    }
}
