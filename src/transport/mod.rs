use std::time::Duration;

mod serial;
mod sim;

pub use serial::SerialTransport;
pub use sim::{MOVEABLE_HEIGHT, MOVEABLE_WIDTH, SimTransport};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no response from controller within {0:?}")]
    Timeout(Duration),
    #[error("serial connection lost: {0}")]
    Disconnected(String),
    #[error("serial I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Line-oriented duplex channel to the controller.
///
/// The transport is exclusively owned by one `Controller` for the session
/// lifetime; there is no sharing or pooling.
pub trait Transport: Send {
    /// Send one command line (newline appended by the transport).
    fn write_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Block for the next newline-terminated response line, trimmed.
    fn read_line(&mut self, timeout: Duration) -> Result<String, TransportError>;

    /// Bytes received but not yet consumed.
    fn bytes_waiting(&mut self) -> usize;

    /// Drop any unread input.
    fn discard_waiting(&mut self);
}

/// Enumerate serial ports an engraver might be attached to.
pub fn list_ports() -> Vec<String> {
    let mut ports = Vec::new();

    if let Ok(system_ports) = serialport::available_ports() {
        for p in system_ports {
            ports.push(p.port_name);
        }
    }

    // Fallback: scan /dev
    if ports.is_empty() {
        for pattern in &["ttyUSB", "ttyACM"] {
            if let Ok(entries) = std::fs::read_dir("/dev") {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name.starts_with(pattern) {
                        ports.push(format!("/dev/{name}"));
                    }
                }
            }
        }
    }

    ports.sort();
    ports
}
