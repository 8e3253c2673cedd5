use crate::error::SyncError;
use failure::Error;

/// Running sums for a circular mean. Angles are in radians.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CircularAccumulator {
    sum_sin: f64,
    sum_cos: f64,
    count: usize,
}

/// Circular mean (in (-pi, pi]) and circular standard deviation `sqrt(-2 ln R)`, both radians
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CircularStatistic {
    pub mean: f64,
    pub std: f64,
    pub count: usize,
}

impl CircularStatistic {
    pub fn mean_degrees(&self) -> f64 {
        self.mean.to_degrees()
    }

    pub fn std_degrees(&self) -> f64 {
        self.std.to_degrees()
    }
}

impl CircularAccumulator {
    pub fn push(&mut self, angle: f64) {
        self.sum_sin += angle.sin();
        self.sum_cos += angle.cos();
        self.count += 1;
    }

    pub fn merge(&mut self, other: &CircularAccumulator) {
        self.sum_sin += other.sum_sin;
        self.sum_cos += other.sum_cos;
        self.count += other.count;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn finish(&self) -> Result<CircularStatistic, Error> {
        if self.count == 0 {
            return Err(SyncError::EmptyAggregationGroup.into());
        }
        let n = self.count as f64;
        let (s, c) = (self.sum_sin / n, self.sum_cos / n);
        // Rounding can push R a hair above 1 for identical angles
        let r = s.hypot(c);
        let std = if r >= 1. { 0. } else { (-2. * r.ln()).sqrt() };
        Ok(CircularStatistic {
            mean: s.atan2(c),
            std,
            count: self.count,
        })
    }
}

impl Extend<f64> for CircularAccumulator {
    fn extend<I: IntoIterator<Item = f64>>(&mut self, iter: I) {
        for angle in iter {
            self.push(angle);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::f64::consts::PI;

    fn stat(angles: &[f64]) -> CircularStatistic {
        let mut acc = CircularAccumulator::default();
        acc.extend(angles.iter().cloned());
        acc.finish().unwrap()
    }

    #[test]
    fn identical_angles_have_zero_spread() {
        for &a in &[0., 1.234, -2.9, PI] {
            let s = stat(&vec![a; 1000]);
            assert!((s.mean - a).abs() < 1e-9 || (a == PI && (s.mean + PI).abs() < 1e-9));
            assert!(s.std.abs() < 1e-6, "std {}", s.std);
            assert!(!s.std.is_nan());
        }
    }

    #[test]
    fn mean_across_the_wrap_boundary() {
        let eps = 1e-3;
        let s = stat(&[0., 2. * PI - eps]);
        assert!(s.mean.abs() < eps);
        let s = stat(&[PI - eps, -PI + eps]);
        assert!((s.mean.abs() - PI).abs() < 1e-9);
    }

    #[test]
    fn spread_matches_closed_form() {
        // Two angles +-d give R = cos(d)
        let d = 0.4f64;
        let s = stat(&[d, -d]);
        assert!(s.mean.abs() < 1e-12);
        assert!((s.std - (-2. * d.cos().ln()).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn merging_equals_pushing() {
        let mut a = CircularAccumulator::default();
        a.extend(vec![0.1, 0.2]);
        let mut b = CircularAccumulator::default();
        b.extend(vec![0.3]);
        a.merge(&b);
        assert_eq!(a.len(), 3);
        assert!((a.finish().unwrap().mean - stat(&[0.1, 0.2, 0.3]).mean).abs() < 1e-12);
    }

    #[test]
    fn empty_group_has_no_statistic() {
        let err = CircularAccumulator::default().finish().unwrap_err();
        match err.downcast_ref::<SyncError>() {
            Some(SyncError::EmptyAggregationGroup) => (),
            other => panic!("unexpected error {:?}", other),
        }
    }
}
