//! Sensor driver contracts and the reader that turns raw driver values into
//! a [`Reading`].

use crate::error::SensorError;
use crate::reading::{compensate_temperature, now_timestamp, round1, Reading};

// ---------------------------------------------------------------------------
// Driver contracts
// ---------------------------------------------------------------------------

/// Raw BME280 values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Climate {
    /// °C, uncompensated.
    pub temperature: f64,
    /// hPa
    pub pressure: f64,
    /// %RH
    pub humidity: f64,
}

/// Gas sensor resistances in ohms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gas {
    pub oxidising: f64,
    pub reducing: f64,
    pub nh3: f64,
}

/// Mass concentrations in µg/m³.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Particulates {
    pub pm1: u16,
    pub pm25: u16,
    pub pm10: u16,
}

/// The board's climate, gas and light sensors plus the CPU temperature used
/// to compensate the climate sensor.
pub trait Board: Send {
    fn cpu_temperature(&mut self) -> Result<f64, SensorError>;
    fn climate(&mut self) -> Result<Climate, SensorError>;
    fn gas(&mut self) -> Result<Gas, SensorError>;
    fn lux(&mut self) -> Result<f64, SensorError>;
}

pub trait ParticulateSensor: Send {
    fn read(&mut self) -> Result<Particulates, SensorError>;
    fn reset(&mut self) -> Result<(), SensorError>;
}

impl<B: Board + ?Sized> Board for Box<B> {
    fn cpu_temperature(&mut self) -> Result<f64, SensorError> {
        (**self).cpu_temperature()
    }
    fn climate(&mut self) -> Result<Climate, SensorError> {
        (**self).climate()
    }
    fn gas(&mut self) -> Result<Gas, SensorError> {
        (**self).gas()
    }
    fn lux(&mut self) -> Result<f64, SensorError> {
        (**self).lux()
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

pub struct SensorReader<B> {
    board: B,
    particulate: Option<Box<dyn ParticulateSensor>>,
    comp_factor: f64,
}

impl<B: Board> SensorReader<B> {
    pub fn new(board: B, comp_factor: f64) -> Self {
        Self {
            board,
            particulate: None,
            comp_factor,
        }
    }

    #[cfg_attr(not(feature = "hw"), allow(dead_code))]
    pub fn with_particulate(mut self, sensor: Box<dyn ParticulateSensor>) -> Self {
        self.particulate = Some(sensor);
        self
    }

    /// Take one snapshot of every channel.
    pub fn read(&mut self) -> Result<Reading, SensorError> {
        let cpu = self.board.cpu_temperature()?;
        let climate = self.board.climate()?;
        let gas = self.board.gas()?;
        let lux = self.board.lux()?;

        let pm = match self.particulate.as_mut() {
            Some(sensor) => Some(read_particulates(&mut **sensor)?),
            None => None,
        };

        let temperature = compensate_temperature(climate.temperature, cpu, self.comp_factor);

        Ok(Reading {
            timestamp: now_timestamp(),
            temperature: round1(temperature),
            pressure: round1(climate.pressure),
            humidity: round1(climate.humidity),
            oxidised: round1(gas.oxidising / 1000.0),
            reduced: round1(gas.reducing / 1000.0),
            nh3: round1(gas.nh3 / 1000.0),
            lux: round1(lux),
            pm1: pm.map(|p| f64::from(p.pm1)),
            pm25: pm.map(|p| f64::from(p.pm25)),
            pm10: pm.map(|p| f64::from(p.pm10)),
        })
    }
}

/// A read timeout gets one reset and retry; anything else, or a second
/// failure, is returned.
fn read_particulates(sensor: &mut dyn ParticulateSensor) -> Result<Particulates, SensorError> {
    match sensor.read() {
        Err(e) if e.is_timeout() => {
            tracing::warn!("particulate read timed out, resetting sensor: {e}");
            sensor.reset()?;
            sensor.read()
        }
        other => other,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
