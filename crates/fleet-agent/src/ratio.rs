//! Exponentially-damped failure ratio, in the style of the kernel load average.
//!
//! Each update folds one sample into three averages with fixed-point decay
//! factors for one, five and fifteen minutes at a five second tick:
//!
//! ```text
//! avg' = (avg · exp + sample · (FIXED_1 − exp)) / FIXED_1
//! ```

use fleet_core::ProbeStatus;

pub const FIXED_1: f64 = 2048.0;
pub const EXP_1: f64 = 1884.0;
pub const EXP_5: f64 = 2014.0;
pub const EXP_15: f64 = 2037.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FailureRatio {
    avg: [f64; 3],
}

/// Sample weight of one probe outcome.
pub fn sample(status: ProbeStatus) -> f64 {
    match status {
        ProbeStatus::Error => 1.0,
        ProbeStatus::Warning => 0.5,
        ProbeStatus::Success | ProbeStatus::Unknown => 0.0,
    }
}

fn decay(avg: f64, exp: f64, sample: f64) -> f64 {
    (avg * exp + sample * (FIXED_1 - exp)) / FIXED_1
}

impl FailureRatio {
    pub fn update(&mut self, status: ProbeStatus) {
        let s = sample(status);
        for (avg, exp) in self.avg.iter_mut().zip([EXP_1, EXP_5, EXP_15]) {
            *avg = decay(*avg, exp, s);
        }
    }

    /// `[1m, 5m, 15m]`
    pub fn averages(&self) -> [f64; 3] {
        self.avg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_weights() {
        let mut r = FailureRatio::default();
        r.update(ProbeStatus::Error);
        let [one, five, fifteen] = r.averages();
        assert!((one - 164.0 / 2048.0).abs() < 1e-12);
        assert!((five - 34.0 / 2048.0).abs() < 1e-12);
        assert!((fifteen - 11.0 / 2048.0).abs() < 1e-12);
    }

    #[test]
    fn short_window_reacts_fastest_and_converges() {
        let mut r = FailureRatio::default();
        for _ in 0..12 {
            r.update(ProbeStatus::Error);
        }
        let [one, five, fifteen] = r.averages();
        assert!(one > five && five > fifteen);

        for _ in 0..2000 {
            r.update(ProbeStatus::Warning);
        }
        for avg in r.averages() {
            assert!((avg - 0.5).abs() < 1e-3, "{avg}");
        }

        for _ in 0..2000 {
            r.update(ProbeStatus::Success);
        }
        assert!(r.averages().iter().all(|avg| *avg < 1e-3));
    }
}
