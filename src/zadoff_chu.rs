use crate::error::SyncError;
use failure::Error;
use num::integer::gcd;
use num::Complex;
use std::f64::consts::PI;
use std::ops::Deref;
use std::sync::Arc;

/// A Zadoff-Chu sequence. Cloning is cheap and shares the samples, so every stage of the
/// pipeline can hold the same reference without copying it.
#[derive(Clone, Debug, PartialEq)]
pub struct ReferenceSequence {
    root: u64,
    length: usize,
    shift: i64,
    samples: Arc<[Complex<f32>]>,
}

impl ReferenceSequence {
    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn shift(&self) -> i64 {
        self.shift
    }

    pub fn samples(&self) -> &[Complex<f32>] {
        &self.samples
    }
}

impl Deref for ReferenceSequence {
    type Target = [Complex<f32>];

    fn deref(&self) -> &[Complex<f32>] {
        &self.samples
    }
}

/// Generates `exp(-j * pi * u * n * (n + (N mod 2) + 2q) / N)` for `n` in `[0, N)`.
///
/// Requires `0 < u < N` and `gcd(u, N) = 1`; anything else is rejected rather than corrected,
/// since every node has to derive the exact same sequence on its own. The exponent is reduced
/// modulo `2N` with integer arithmetic first, which keeps the result exact for long sequences
/// and makes it bit-identical across calls.
pub fn generate(u: u64, length: usize, q: i64) -> Result<ReferenceSequence, Error> {
    let n_len = length as u64;
    if u == 0 {
        return Err(SyncError::InvalidParameter("root index u must be strictly positive".into()).into());
    }
    if u >= n_len {
        return Err(SyncError::InvalidParameter(format!(
            "root index u={} must be smaller than the length N={}",
            u, length
        ))
        .into());
    }
    if gcd(u, n_len) != 1 {
        return Err(SyncError::InvalidParameter(format!(
            "gcd(u={}, N={}) must be 1",
            u, length
        ))
        .into());
    }

    let modulus = 2 * n_len as i128;
    let cf = (n_len % 2) as i128;
    let samples: Vec<Complex<f32>> = (0..n_len as i128)
        .map(|n| {
            let exponent = (u as i128 * n * (n + cf + 2 * q as i128)).rem_euclid(modulus);
            let phase = -PI * exponent as f64 / n_len as f64;
            Complex::new(phase.cos() as f32, phase.sin() as f32)
        })
        .collect();

    Ok(ReferenceSequence {
        root: u,
        length,
        shift: q,
        samples: samples.into(),
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::SyncError;

    fn is_invalid(res: Result<ReferenceSequence, Error>) -> bool {
        match res {
            Err(e) => match e.downcast_ref::<SyncError>() {
                Some(SyncError::InvalidParameter(_)) => true,
                _ => false,
            },
            Ok(_) => false,
        }
    }

    #[test]
    fn unit_magnitude_and_length() {
        for &(u, n, q) in &[(7u64, 353usize, 0i64), (1, 139, 0), (5, 64, 3), (25, 63, -2)] {
            let seq = generate(u, n, q).unwrap();
            assert_eq!(seq.len(), n);
            for s in seq.iter() {
                assert!((s.norm() - 1.).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn repeated_calls_are_bit_identical() {
        let a = generate(7, 353, 0).unwrap();
        let b = generate(7, 353, 0).unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.re.to_bits(), y.re.to_bits());
            assert_eq!(x.im.to_bits(), y.im.to_bits());
        }
    }

    #[test]
    fn matches_closed_form() {
        let seq = generate(7, 353, 0).unwrap();
        for n in [0usize, 1, 2, 100, 352].iter() {
            let n = *n as f64;
            let phase = -PI * 7. * n * (n + 1.) / 353.;
            let expected = Complex::new(phase.cos(), phase.sin());
            let got = seq[n as usize];
            assert!((got.re as f64 - expected.re).abs() < 1e-5);
            assert!((got.im as f64 - expected.im).abs() < 1e-5);
        }
    }

    #[test]
    fn cyclic_shift_is_applied() {
        // For odd N, a shift q multiplies sample n by exp(-j*2*pi*u*q*n/N)
        let base = generate(7, 353, 0).unwrap();
        let shifted = generate(7, 353, 2).unwrap();
        for n in 0..353 {
            let phase = -2. * PI * 7. * 2. * n as f64 / 353.;
            let rot = Complex::new(phase.cos() as f32, phase.sin() as f32);
            assert!((base[n] * rot - shifted[n]).norm() < 1e-4);
        }
    }

    #[test]
    fn rejects_bad_parameters() {
        assert!(is_invalid(generate(0, 353, 0)));
        assert!(is_invalid(generate(353, 353, 0)));
        assert!(is_invalid(generate(400, 353, 0)));
        assert!(is_invalid(generate(6, 9, 0)));
        assert!(is_invalid(generate(1, 0, 0)));
    }
}
