use std::io::Read;
use std::time::Duration;

use log::warn;
use serialport::{ClearBuffer, SerialPort};

use super::{Transport, TransportError};

/// The AMC2500 talks at a fixed 9600 baud.
pub const BAUD_RATE: u32 = 9600;

/// Real serial port to an attached controller.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(port_name: &str) -> Result<Self, TransportError> {
        let port = serialport::new(port_name, BAUD_RATE)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| TransportError::Disconnected(format!("failed to open {port_name}: {e}")))?;
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let data = format!("{line}\n");
        self.port.write_all(data.as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| TransportError::Disconnected(e.to_string()))?;

        // Byte-at-a-time is fine at 9600 baud, and keeps bytes_waiting()
        // accurate (a BufReader would hide buffered input from the port).
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.port.read(&mut byte) {
                Ok(0) => {
                    return Err(TransportError::Disconnected("port closed".into()));
                }
                Ok(_) => {
                    if byte[0] == b'\n' {
                        let text = String::from_utf8_lossy(&line).trim().to_string();
                        return Ok(text);
                    }
                    line.push(byte[0]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(TransportError::Timeout(timeout));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn bytes_waiting(&mut self) -> usize {
        self.port.bytes_to_read().unwrap_or(0) as usize
    }

    fn discard_waiting(&mut self) {
        let waiting = self.bytes_waiting();
        if waiting > 0 {
            warn!("discarding {waiting} unread bytes from controller");
        }
        let _ = self.port.clear(ClearBuffer::Input);
    }
}
