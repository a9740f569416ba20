//! Simulated sensor board for running the daemon off-device.
//!
//! Each channel is a mean-reverting random walk with per-sample noise and a
//! day/night swing, so consecutive readings are coherent and the stores see
//! plausible data:
//! - temperature and humidity move against each other through the day
//! - the CPU runs a roughly constant margin above ambient
//! - gas resistances drift slowly and occasionally spike

use std::f64::consts::PI;

use crate::error::SensorError;
use crate::sensor::{Board, Climate, Gas};

// ---------------------------------------------------------------------------
// Noise
// ---------------------------------------------------------------------------

/// Roughly standard-normal noise: twelve uniforms summed, minus their mean.
fn approx_std_normal() -> f64 {
    (0..12).map(|_| fastrand::f64()).sum::<f64>() - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Per-channel state
// ---------------------------------------------------------------------------

/// One simulated quantity.
struct Walk {
    value: f64,
    center: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    min: f64,
    max: f64,
}

impl Walk {
    fn new(center: f64, walk_sigma: f64, noise_sigma: f64, min: f64, max: f64) -> Self {
        Self {
            value: center,
            center,
            walk_sigma,
            mean_reversion: 0.02,
            noise_sigma,
            min,
            max,
        }
    }

    /// Advance the walk and return an instantaneous sample around it.
    fn step(&mut self, offset: f64) -> f64 {
        let pull = self.mean_reversion * (self.center - self.value);
        let walk = gaussian(0.0, self.walk_sigma);
        self.value = (self.value + pull + walk).clamp(self.min, self.max);
        (self.value + offset + gaussian(0.0, self.noise_sigma)).clamp(self.min, self.max)
    }
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

pub struct SimBoard {
    temperature: Walk,
    pressure: Walk,
    humidity: Walk,
    oxidising: Walk,
    reducing: Walk,
    nh3: Walk,
    lux: Walk,
    /// How far the CPU runs above the raw board temperature.
    cpu_margin: Walk,

    gas_spike_prob: f32,
    diurnal_period_s: f64,
}

impl SimBoard {
    /// `diurnal_period_s` controls the day/night cycle length.  Use 600
    /// (10 min) for fast dev iteration or 86400 for real-time.
    pub fn new(diurnal_period_s: f64) -> Self {
        Self {
            temperature: Walk::new(24.0, 0.02, 0.05, -20.0, 60.0),
            pressure: Walk::new(1013.0, 0.05, 0.1, 900.0, 1100.0),
            humidity: Walk::new(45.0, 0.05, 0.2, 0.0, 100.0),
            oxidising: Walk::new(20_000.0, 50.0, 100.0, 1_000.0, 200_000.0),
            reducing: Walk::new(300_000.0, 500.0, 1_000.0, 10_000.0, 1_500_000.0),
            nh3: Walk::new(100_000.0, 200.0, 500.0, 5_000.0, 800_000.0),
            lux: Walk::new(150.0, 2.0, 1.0, 0.0, 64_000.0),
            cpu_margin: Walk::new(20.0, 0.05, 0.3, 5.0, 40.0),
            gas_spike_prob: 0.01,
            diurnal_period_s,
        }
    }

    /// Day/night phase in [-1, 1], peaking at "afternoon" (period / 4).
    fn diurnal(&self) -> f64 {
        let now_s = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        (2.0 * PI * now_s / self.diurnal_period_s).sin()
    }

    fn spike(&self, sigma: f64) -> f64 {
        if fastrand::f32() < self.gas_spike_prob {
            gaussian(0.0, sigma)
        } else {
            0.0
        }
    }
}

impl Board for SimBoard {
    fn cpu_temperature(&mut self) -> Result<f64, SensorError> {
        Ok(self.temperature.value + self.cpu_margin.step(0.0))
    }

    fn climate(&mut self) -> Result<Climate, SensorError> {
        let day = self.diurnal();
        Ok(Climate {
            temperature: self.temperature.step(4.0 * day),
            pressure: self.pressure.step(0.0),
            humidity: self.humidity.step(-8.0 * day),
        })
    }

    fn gas(&mut self) -> Result<Gas, SensorError> {
        let ox_spike = self.spike(5_000.0);
        let red_spike = self.spike(50_000.0);
        Ok(Gas {
            oxidising: self.oxidising.step(ox_spike),
            reducing: self.reducing.step(red_spike),
            nh3: self.nh3.step(0.0),
        })
    }

    fn lux(&mut self) -> Result<f64, SensorError> {
        let day = self.diurnal();
        Ok(self.lux.step(140.0 * day.max(0.0)))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_within_physical_range() {
        let mut board = SimBoard::new(600.0);
        for _ in 0..500 {
            let c = board.climate().unwrap();
            assert!((-20.0..=60.0).contains(&c.temperature), "{c:?}");
            assert!((900.0..=1100.0).contains(&c.pressure), "{c:?}");
            assert!((0.0..=100.0).contains(&c.humidity), "{c:?}");

            let g = board.gas().unwrap();
            assert!(g.oxidising > 0.0 && g.reducing > 0.0 && g.nh3 > 0.0, "{g:?}");

            let lux = board.lux().unwrap();
            assert!(lux >= 0.0, "lux {lux}");
        }
    }

    #[test]
    fn cpu_runs_warmer_than_board() {
        let mut board = SimBoard::new(600.0);
        for _ in 0..100 {
            let raw = board.climate().unwrap().temperature;
            let cpu = board.cpu_temperature().unwrap();
            assert!(cpu > raw - 5.0, "cpu {cpu} vs raw {raw}");
        }
    }

    #[test]
    fn temporal_coherence() {
        // Consecutive pressure readings should be far closer than the range.
        let mut board = SimBoard::new(86_400.0);
        let samples: Vec<f64> = (0..100).map(|_| board.climate().unwrap().pressure).collect();
        let max_jump = samples
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0_f64, f64::max);
        assert!(max_jump < 5.0, "max consecutive jump too large: {max_jump}");
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let sum: f64 = (0..n).map(|_| approx_std_normal()).sum();
        let mean = sum / n as f64;
        // With n=5000 the std error is 1/sqrt(5000) ≈ 0.014, so ±0.15 is
        // generous.
        assert!(
            mean.abs() < 0.15,
            "approx_std_normal mean should be near zero: {mean}"
        );
    }
}
