//! Stateful light-intensity simulator for local development.
//!
//! Models a photoresistor next to the grow light:
//! - Daylight curve between sunrise and sunset
//! - Cloud cover as a mean-reverting random walk
//! - Per-reading electronic noise
//! - Closed-loop response to the grow light relay

use std::fmt;

/// Full-scale reading of the analog sensor (10-bit ADC).
pub const MAX_READING: f64 = 1023.0;

const SUNRISE_HOUR: f64 = 6.0;
const SUNSET_HOUR: f64 = 20.0;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Weather profiles selectable via the `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Bright midday well above the default threshold; the grow light
    /// should switch off around noon.
    Sunny,
    /// Midday hovers near the threshold with drifting clouds.
    Cloudy,
    /// Dark all day; the grow light should stay on through the window.
    Overcast,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "sunny" => Self::Sunny,
            "overcast" => Self::Overcast,
            _ => Self::Cloudy, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sunny => write!(f, "sunny"),
            Self::Cloudy => write!(f, "cloudy"),
            Self::Overcast => write!(f, "overcast"),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct LightSim {
    /// Peak daylight reading on a clear day.
    peak: f64,
    /// Current cloud attenuation, 0.0 (clear) ..= 1.0 (fully blocked).
    cloud: f64,
    cloud_mean: f64,
    cloud_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    /// What the grow light adds when on.
    lamp: f64,
    lamp_on: bool,
}

impl LightSim {
    pub fn new(scenario: Scenario) -> Self {
        let (peak, cloud_mean, cloud_sigma) = match scenario {
            Scenario::Sunny => (950.0, 0.1, 0.03),
            Scenario::Cloudy => (950.0, 0.45, 0.08),
            Scenario::Overcast => (950.0, 0.85, 0.03),
        };

        Self {
            peak,
            cloud: cloud_mean,
            cloud_mean,
            cloud_sigma,
            mean_reversion: 0.1,
            noise_sigma: 8.0,
            lamp: 180.0,
            lamp_on: false,
        }
    }

    /// Inform the simulator whether the grow light is currently on.
    pub fn set_lamp(&mut self, on: bool) {
        self.lamp_on = on;
    }

    /// Clear-sky daylight at `hour` (fractional local hour), 0 at night.
    fn daylight(&self, hour: f64) -> f64 {
        if !(SUNRISE_HOUR..SUNSET_HOUR).contains(&hour) {
            return 0.0;
        }
        let phase = (hour - SUNRISE_HOUR) / (SUNSET_HOUR - SUNRISE_HOUR);
        self.peak * (std::f64::consts::PI * phase).sin()
    }

    /// Produce the next reading for local `hour`. The cloud state evolves
    /// with each call.
    pub fn sample(&mut self, hour: f64) -> f64 {
        let pull = self.mean_reversion * (self.cloud_mean - self.cloud);
        self.cloud = (self.cloud + pull + gaussian(0.0, self.cloud_sigma)).clamp(0.0, 1.0);

        let lamp = if self.lamp_on { self.lamp } else { 0.0 };
        let reading =
            self.daylight(hour) * (1.0 - self.cloud) + lamp + gaussian(0.0, self.noise_sigma);

        reading.round().clamp(0.0, MAX_READING)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn mean(sim: &mut LightSim, hour: f64, n: usize) -> f64 {
        (0..n).map(|_| sim.sample(hour)).sum::<f64>() / n as f64
    }

    #[test]
    fn readings_within_sensor_range() {
        for scenario in [Scenario::Sunny, Scenario::Cloudy, Scenario::Overcast] {
            let mut sim = LightSim::new(scenario);
            sim.set_lamp(true);
            for i in 0..500 {
                let v = sim.sample(f64::from(i % 24));
                assert!((0.0..=MAX_READING).contains(&v), "out of range: {v}");
            }
        }
    }

    #[test]
    fn night_is_dark_without_lamp() {
        let mut sim = LightSim::new(Scenario::Sunny);
        assert!(mean(&mut sim, 2.0, 50) < 30.0);
    }

    #[test]
    fn sunny_noon_is_above_default_threshold() {
        let mut sim = LightSim::new(Scenario::Sunny);
        assert!(mean(&mut sim, 13.0, 50) > 500.0);
    }

    #[test]
    fn overcast_noon_is_below_default_threshold() {
        let mut sim = LightSim::new(Scenario::Overcast);
        assert!(mean(&mut sim, 13.0, 50) < 500.0);
    }

    #[test]
    fn lamp_raises_readings() {
        let mut sim = LightSim::new(Scenario::Overcast);
        let before = mean(&mut sim, 22.0, 50);
        sim.set_lamp(true);
        let after = mean(&mut sim, 22.0, 50);
        assert!(after > before + 100.0, "before={before:.0} after={after:.0}");
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("SUNNY"), Scenario::Sunny);
        assert_eq!(Scenario::from_str_lossy("overcast"), Scenario::Overcast);
        assert_eq!(Scenario::from_str_lossy("cloudy"), Scenario::Cloudy);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Cloudy);
    }

    #[test]
    fn scenario_display() {
        assert_eq!(Scenario::Sunny.to_string(), "sunny");
        assert_eq!(Scenario::Cloudy.to_string(), "cloudy");
        assert_eq!(Scenario::Overcast.to_string(), "overcast");
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let sum: f64 = (0..n).map(|_| approx_std_normal()).sum();
        let mean = sum / n as f64;
        assert!(mean.abs() < 0.15, "mean should be near zero: {mean}");
    }
}
