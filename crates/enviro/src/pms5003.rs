//! PMS5003 particulate sensor: frame decoding plus, with the `hw` feature, the
//! UART/GPIO device on the Raspberry Pi.
//!
//! The sensor streams 32-byte frames at 9600 baud:
//!
//! ```text
//!   0x42 0x4D | len (u16, = 28) | 13 × u16 data | checksum (u16)
//! ```
//!
//! All words are big-endian.  The checksum is the sum of the first 30 bytes.

use std::collections::VecDeque;

use crate::error::SensorError;
use crate::sensor::Particulates;

const START_1: u8 = 0x42;
const START_2: u8 = 0x4D;
const FRAME_LEN: usize = 32;
/// Value of the length field: data words plus checksum, in bytes.
const PAYLOAD_LEN: u16 = 28;

/// One decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub data: [u16; 13],
}

impl Frame {
    /// PM1.0 / PM2.5 / PM10 in µg/m³, standard particle (CF=1) values.
    pub fn particulates(&self) -> Particulates {
        Particulates {
            pm1: self.data[0],
            pm25: self.data[1],
            pm10: self.data[2],
        }
    }
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// Frame decoder.  Resynchronises on the start bytes, so it can be fed
/// straight from the serial port.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Bytes received but not yet decoded; kept across frames.
    backlog: VecDeque<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(FRAME_LEN),
            backlog: VecDeque::with_capacity(FRAME_LEN),
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.backlog.clear();
    }

    /// Queue `bytes` and decode until the first complete frame.  Bytes after
    /// that frame stay queued for the next call, so `feed(&[])` picks up
    /// where the last one stopped.
    pub fn feed(&mut self, bytes: &[u8]) -> Option<Result<Frame, SensorError>> {
        self.backlog.extend(bytes);
        while let Some(byte) = self.backlog.pop_front() {
            if let Some(result) = self.push(byte) {
                return Some(result);
            }
        }
        None
    }

    /// Feed one byte.  Returns a result once a full frame has been seen.
    pub fn push(&mut self, byte: u8) -> Option<Result<Frame, SensorError>> {
        match self.buf.len() {
            0 => {
                if byte == START_1 {
                    self.buf.push(byte);
                }
                return None;
            }
            1 => {
                if byte == START_2 {
                    self.buf.push(byte);
                } else {
                    self.buf.clear();
                    if byte == START_1 {
                        self.buf.push(byte);
                    }
                }
                return None;
            }
            _ => self.buf.push(byte),
        }

        if self.buf.len() == 4 && word(&self.buf, 2) != PAYLOAD_LEN {
            // false start inside the data stream
            self.buf.clear();
            return None;
        }

        if self.buf.len() < FRAME_LEN {
            return None;
        }

        let expected = word(&self.buf, 30);
        let actual = self.buf[..30]
            .iter()
            .fold(0u16, |acc, &b| acc.wrapping_add(u16::from(b)));

        let result = if expected == actual {
            let mut data = [0u16; 13];
            for (i, slot) in data.iter_mut().enumerate() {
                *slot = word(&self.buf, 4 + 2 * i);
            }
            Ok(Frame { data })
        } else {
            Err(SensorError::Checksum { expected, actual })
        };
        self.buf.clear();
        Some(result)
    }
}

fn word(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

// ---------------------------------------------------------------------------
// Device (Raspberry Pi UART + reset/enable GPIO)
// ---------------------------------------------------------------------------

#[cfg(feature = "hw")]
pub use device::Pms5003;

#[cfg(feature = "hw")]
mod device {
    use std::thread;
    use std::time::{Duration, Instant};

    use rppal::gpio::{Gpio, OutputPin};
    use rppal::uart::{Parity, Queue, Uart};

    use super::FrameDecoder;
    use crate::error::SensorError;
    use crate::sensor::{ParticulateSensor, Particulates};

    const BAUD: u32 = 9600;
    /// How long to wait for a complete frame before giving up.
    const READ_TIMEOUT: Duration = Duration::from_secs(5);
    /// Reset pulse width.
    const RESET_PULSE: Duration = Duration::from_millis(100);

    pub struct Pms5003 {
        uart: Uart,
        reset: OutputPin,
        // Held high for as long as the sensor is in use.
        _enable: OutputPin,
        decoder: FrameDecoder,
    }

    impl Pms5003 {
        pub fn open(device: &str, reset_pin: u8, enable_pin: u8) -> anyhow::Result<Self> {
            let mut uart = Uart::with_path(device, BAUD, Parity::None, 8, 1)?;
            uart.set_read_mode(0, Duration::from_millis(200))?;

            let gpio = Gpio::new()?;
            let enable = gpio.get(enable_pin)?.into_output_high();
            let reset = gpio.get(reset_pin)?.into_output_high();

            tracing::info!(device, reset_pin, enable_pin, "pms5003 initialised");

            Ok(Self {
                uart,
                reset,
                _enable: enable,
                decoder: FrameDecoder::new(),
            })
        }
    }

    fn uart_err(e: rppal::uart::Error) -> SensorError {
        SensorError::Unavailable(format!("pms5003 uart: {e}"))
    }

    impl ParticulateSensor for Pms5003 {
        fn read(&mut self) -> Result<Particulates, SensorError> {
            let deadline = Instant::now() + READ_TIMEOUT;
            let mut chunk = [0u8; 32];

            // a frame may already be waiting from the previous read
            if let Some(frame) = self.decoder.feed(&[]) {
                return frame.map(|f| f.particulates());
            }
            while Instant::now() < deadline {
                let n = self.uart.read(&mut chunk).map_err(uart_err)?;
                if let Some(frame) = self.decoder.feed(&chunk[..n]) {
                    return frame.map(|f| f.particulates());
                }
            }

            Err(SensorError::Timeout(format!(
                "no pms5003 frame within {}s",
                READ_TIMEOUT.as_secs()
            )))
        }

        fn reset(&mut self) -> Result<(), SensorError> {
            self.reset.set_low();
            thread::sleep(RESET_PULSE);
            self.reset.set_high();
            self.uart.flush(Queue::Input).map_err(uart_err)?;
            self.decoder.clear();
            Ok(())
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
