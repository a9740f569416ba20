//! Board backend reading the kernel IIO drivers through sysfs.
//!
//! The BME280 (bmp280 driver), LTR559 (ltr501 driver) and the ADS1015 behind
//! the MICS6814 gas sensor all expose their channels as sysfs attributes, so
//! no register access happens here.  The CPU temperature comes from
//! `sysinfo`, falling back to `vcgencmd`.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Command;

use sysinfo::Components;

use crate::config::{IioChannel, IioConfig};
use crate::error::SensorError;
use crate::sensor::{Board, Climate, Gas};

/// Supply voltage across the gas sensor dividers.
const GAS_SUPPLY_V: f64 = 3.3;
/// Load resistor in series with each gas sensing element, in ohms.
const GAS_LOAD_OHMS: f64 = 56_000.0;

/// Component labels that identify the SoC temperature sensor.
const CPU_LABELS: &[&str] = &["cpu", "soc", "thermal"];

pub struct IioBoard {
    channels: IioConfig,
    components: Components,
}

impl IioBoard {
    pub fn new(channels: IioConfig) -> Self {
        let components = Components::new_with_refreshed_list();
        tracing::info!(
            components = components.list().len(),
            temperature = %channels.temperature.path.display(),
            lux = %channels.lux.path.display(),
            "iio board initialised"
        );
        Self {
            channels,
            components,
        }
    }

    fn sysfs_cpu_temperature(&mut self) -> Option<f64> {
        self.components.refresh();
        self.components
            .list()
            .iter()
            .find(|c| {
                let label = c.label().to_ascii_lowercase();
                CPU_LABELS.iter().any(|l| label.contains(l))
            })
            .map(|c| f64::from(c.temperature()))
            .filter(|t| t.is_finite())
    }
}

impl Board for IioBoard {
    fn cpu_temperature(&mut self) -> Result<f64, SensorError> {
        if let Some(t) = self.sysfs_cpu_temperature() {
            return Ok(t);
        }

        let output = Command::new("vcgencmd")
            .arg("measure_temp")
            .output()
            .map_err(|e| SensorError::io("vcgencmd", e))?;
        parse_vcgencmd_temp(&String::from_utf8_lossy(&output.stdout))
    }

    fn climate(&mut self) -> Result<Climate, SensorError> {
        Ok(Climate {
            temperature: read_channel(&self.channels.temperature)?,
            pressure: read_channel(&self.channels.pressure)?,
            humidity: read_channel(&self.channels.humidity)?,
        })
    }

    fn gas(&mut self) -> Result<Gas, SensorError> {
        Ok(Gas {
            oxidising: divider_resistance(read_channel(&self.channels.oxidising)?)?,
            reducing: divider_resistance(read_channel(&self.channels.reducing)?)?,
            nh3: divider_resistance(read_channel(&self.channels.nh3)?)?,
        })
    }

    fn lux(&mut self) -> Result<f64, SensorError> {
        read_channel(&self.channels.lux)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_channel(ch: &IioChannel) -> Result<f64, SensorError> {
    Ok(read_sysfs_value(&ch.path)? * ch.scale)
}

fn read_sysfs_value(path: &Path) -> Result<f64, SensorError> {
    let what = path.display().to_string();
    let text = fs::read_to_string(path).map_err(|e| match e.kind() {
        // i2c transfers that never complete surface as ETIMEDOUT
        ErrorKind::TimedOut => SensorError::Timeout(what.clone()),
        _ => SensorError::io(what.clone(), e),
    })?;
    text.trim()
        .parse::<f64>()
        .map_err(|e| SensorError::parse(what, e))
}

/// Sensing element resistance from the voltage across the load resistor.
fn divider_resistance(volts: f64) -> Result<f64, SensorError> {
    if !(0.0..GAS_SUPPLY_V).contains(&volts) {
        return Err(SensorError::parse(
            "gas divider voltage",
            format!("{volts:.3} V outside [0, {GAS_SUPPLY_V}) V"),
        ));
    }
    Ok(volts * GAS_LOAD_OHMS / (GAS_SUPPLY_V - volts))
}

/// Parse `temp=48.3'C` as printed by `vcgencmd measure_temp`.
fn parse_vcgencmd_temp(output: &str) -> Result<f64, SensorError> {
    let value = output
        .trim()
        .strip_prefix("temp=")
        .and_then(|s| s.split('\'').next())
        .ok_or_else(|| SensorError::parse("vcgencmd output", output.trim()))?;
    value
        .parse::<f64>()
        .map_err(|e| SensorError::parse("vcgencmd output", e))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    /// Write `contents` to a fresh file under the system temp dir.
    fn sysfs_file(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("enviro-iio-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn parse_vcgencmd_valid() {
        assert_eq!(parse_vcgencmd_temp("temp=48.3'C\n").unwrap(), 48.3);
    }

    #[test]
    fn parse_vcgencmd_garbage() {
        assert!(parse_vcgencmd_temp("").is_err());
        assert!(parse_vcgencmd_temp("VCHI initialization failed").is_err());
        assert!(parse_vcgencmd_temp("temp=hot'C").is_err());
    }

    #[test]
    fn divider_resistance_midpoint() {
        // Half the supply across the load means the element equals the load.
        let r = divider_resistance(GAS_SUPPLY_V / 2.0).unwrap();
        assert!((r - GAS_LOAD_OHMS).abs() < 1e-6, "got {r}");
    }

    #[test]
    fn divider_resistance_rejects_supply_voltage() {
        assert!(divider_resistance(GAS_SUPPLY_V).is_err());
        assert!(divider_resistance(-0.1).is_err());
    }

    #[test]
    fn read_channel_applies_scale() {
        let path = sysfs_file("in_temp_input", "23456\n");
        let ch = IioChannel {
            path,
            scale: 0.001,
        };
        let v = read_channel(&ch).unwrap();
        assert!((v - 23.456).abs() < 1e-9, "got {v}");
    }

    #[test]
    fn read_channel_missing_file_is_io_error() {
        let ch = IioChannel {
            path: PathBuf::from("/nonexistent/in_temp_input"),
            scale: 1.0,
        };
        assert!(matches!(read_channel(&ch), Err(SensorError::Io { .. })));
    }

    #[test]
    fn read_channel_bad_contents_is_parse_error() {
        let path = sysfs_file("in_illuminance_input", "n/a\n");
        let ch = IioChannel { path, scale: 1.0 };
        assert!(matches!(read_channel(&ch), Err(SensorError::Parse { .. })));
    }

    #[test]
    fn board_reads_configured_channels() {
        let mut channels = IioConfig::default();
        channels.temperature = IioChannel {
            path: sysfs_file("t", "21500"),
            scale: 0.001,
        };
        channels.pressure = IioChannel {
            path: sysfs_file("p", "101.325"),
            scale: 10.0,
        };
        channels.humidity = IioChannel {
            path: sysfs_file("h", "45000"),
            scale: 0.001,
        };
        channels.lux = IioChannel {
            path: sysfs_file("l", "88.5"),
            scale: 1.0,
        };

        let mut board = IioBoard::new(channels);
        let c = board.climate().unwrap();
        assert!((c.temperature - 21.5).abs() < 1e-9);
        assert!((c.pressure - 1013.25).abs() < 1e-9);
        assert!((c.humidity - 45.0).abs() < 1e-9);
        assert_eq!(board.lux().unwrap(), 88.5);
    }
}
