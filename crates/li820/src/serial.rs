//! Serial line transport for the analyzer

use std::io::{self, Read};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::source::{ByteSource, Instrument, SourceError};

pub const DEFAULT_DEVICE: &str = "/dev/ttyS4";
pub const DEFAULT_BAUD_RATE: u32 = 9600;
/// How long a single `read` waits before polling again. Not a frame timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Serial line settings. The LI-820 talks 9600 8N1 without flow control.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialConfig {
    pub device: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
    pub read_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

pub struct SerialInstrument {
    config: SerialConfig,
}

impl SerialInstrument {
    pub fn new(config: SerialConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

impl Instrument for SerialInstrument {
    type Source = SerialSource;

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.config.device, self.config.baud_rate)
    }

    fn open(&self) -> Result<SerialSource, SourceError> {
        let config = &self.config;
        let port = serialport::new(&config.device, config.baud_rate)
            .data_bits(config.data_bits)
            .stop_bits(config.stop_bits)
            .parity(config.parity)
            .flow_control(config.flow_control)
            .timeout(config.read_timeout)
            .open()
            .map_err(|e| SourceError::Open {
                address: config.device.clone(),
                source: e.into(),
            })?;

        log::info!("Opened serial port {}", self.describe());
        Ok(SerialSource {
            port: Some(port),
            device: config.device.clone(),
        })
    }
}

/// An open serial port. Reads block until a byte arrives; read timeouts just
/// poll again.
pub struct SerialSource {
    port: Option<Box<dyn SerialPort>>,
    device: String,
}

impl ByteSource for SerialSource {
    fn read_byte(&mut self) -> Result<u8, SourceError> {
        let port = self.port.as_mut().ok_or(SourceError::Closed)?;
        let mut byte = [0u8; 1];
        loop {
            match port.read(&mut byte) {
                Ok(1) => return Ok(byte[0]),
                Ok(_) => {
                    // Hang-up: the device went away underneath us
                    return Err(SourceError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("{} returned end of file", self.device),
                    )));
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::TimedOut
                            | io::ErrorKind::WouldBlock
                            | io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn close(&mut self) -> Result<(), SourceError> {
        if self.port.take().is_some() {
            log::debug!("Closed serial port {}", self.device);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_9600_8n1() {
        let config = SerialConfig::default();
        assert_eq!(config.device, "/dev/ttyS4");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.data_bits, DataBits::Eight);
        assert_eq!(config.stop_bits, StopBits::One);
        assert_eq!(config.parity, Parity::None);
    }

    #[test]
    fn missing_device_fails_to_open() {
        let instrument = SerialInstrument::new(SerialConfig {
            device: "/dev/li820-does-not-exist".into(),
            ..SerialConfig::default()
        });
        match instrument.open() {
            Err(SourceError::Open { address, .. }) => {
                assert_eq!(address, "/dev/li820-does-not-exist");
            }
            Err(other) => panic!("expected open error, got {other}"),
            Ok(_) => panic!("opened a device that does not exist"),
        }
    }
}
