//! Line-oriented access to the sensor.
//!
//! The reader only needs three things from a device: how many bytes are
//! waiting, the next line, and a way to drop stale input. [`LineSource`] is
//! that seam; [`SerialLink`] implements it over a real port and
//! [`ScriptedLink`] over an in-memory script for headless runs and tests.

use crate::config::LinkConfig;
use crate::error::ConnectionError;
use parking_lot::Mutex;
use serialport::{ClearBuffer, SerialPort};
use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;

/// A connected, line-oriented byte source.
pub trait LineSource: Send + 'static {
    /// Number of bytes ready to read without blocking.
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Reads one line without its terminator. A read timeout yields whatever
    /// partial text arrived, possibly empty.
    fn read_line(&mut self) -> io::Result<String>;

    /// Discards any input received so far.
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Opens a [`LineSource`] for the configured device.
pub trait LinkOpener: Send + Sync + 'static {
    fn open(&self, config: &LinkConfig) -> Result<Box<dyn LineSource>, ConnectionError>;
}

/// Production opener backed by the `serialport` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

impl LinkOpener for SerialOpener {
    fn open(&self, config: &LinkConfig) -> Result<Box<dyn LineSource>, ConnectionError> {
        log::info!(
            "Opening serial port: {} at {} baud",
            config.device,
            config.baud_rate
        );

        let port = serialport::new(&config.device, config.baud_rate)
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .open()
            .map_err(|e| ConnectionError::Open {
                device: config.device.clone(),
                reason: e.to_string(),
            })?;

        Ok(Box::new(SerialLink::new(port)))
    }
}

pub struct SerialLink {
    port: Box<dyn SerialPort>,
    // Bytes read from the port past the last returned line.
    pending: Vec<u8>,
}

impl SerialLink {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self {
            port,
            pending: Vec::new(),
        }
    }

    fn take_line(&mut self, end: usize) -> String {
        let rest = self.pending.split_off(end + 1);
        let mut line = std::mem::replace(&mut self.pending, rest);
        line.pop();
        String::from_utf8_lossy(&line).into_owned()
    }
}

impl LineSource for SerialLink {
    fn bytes_available(&mut self) -> io::Result<usize> {
        let waiting = self.port.bytes_to_read().map_err(io::Error::from)?;
        Ok(waiting as usize + self.pending.len())
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut chunk = [0u8; 64];
        loop {
            if let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
                return Ok(self.take_line(end));
            }
            match self.port.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "serial port closed",
                    ))
                }
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    let partial = std::mem::take(&mut self.pending);
                    return Ok(String::from_utf8_lossy(&partial).into_owned());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        self.port
            .clear(ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

/// Names of the serial ports present on this machine.
pub fn available_ports() -> Result<Vec<String>, ConnectionError> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

#[derive(Debug, Clone, PartialEq)]
enum Step {
    Line(String),
    Fault(String),
}

#[derive(Debug, Default)]
struct Script {
    steps: VecDeque<Step>,
    open_failure: Option<String>,
    opened: usize,
    cleared: usize,
}

/// In-memory device. Lines pushed before or after opening are delivered in
/// order; a pushed fault makes the next read fail. Once the script runs dry
/// the link reports no bytes waiting.
#[derive(Debug, Clone, Default)]
pub struct ScriptedOpener {
    script: Arc<Mutex<Script>>,
}

impl ScriptedOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let opener = Self::new();
        for line in lines {
            opener.push_line(line);
        }
        opener
    }

    pub fn push_line<S: Into<String>>(&self, line: S) {
        self.script.lock().steps.push_back(Step::Line(line.into()));
    }

    pub fn push_fault<S: Into<String>>(&self, message: S) {
        self.script
            .lock()
            .steps
            .push_back(Step::Fault(message.into()));
    }

    /// Makes the next `open` fail with `reason`.
    pub fn fail_next_open<S: Into<String>>(&self, reason: S) {
        self.script.lock().open_failure = Some(reason.into());
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().steps.len()
    }

    pub fn open_count(&self) -> usize {
        self.script.lock().opened
    }

    pub fn clear_count(&self) -> usize {
        self.script.lock().cleared
    }
}

impl LinkOpener for ScriptedOpener {
    fn open(&self, config: &LinkConfig) -> Result<Box<dyn LineSource>, ConnectionError> {
        let mut script = self.script.lock();
        if let Some(reason) = script.open_failure.take() {
            return Err(ConnectionError::Open {
                device: config.device.clone(),
                reason,
            });
        }
        script.opened += 1;
        Ok(Box::new(ScriptedLink {
            script: Arc::clone(&self.script),
        }))
    }
}

pub struct ScriptedLink {
    script: Arc<Mutex<Script>>,
}

impl LineSource for ScriptedLink {
    fn bytes_available(&mut self) -> io::Result<usize> {
        let script = self.script.lock();
        Ok(match script.steps.front() {
            Some(Step::Line(line)) => line.len() + 1,
            Some(Step::Fault(_)) => 1,
            None => 0,
        })
    }

    fn read_line(&mut self) -> io::Result<String> {
        match self.script.lock().steps.pop_front() {
            Some(Step::Line(line)) => Ok(line),
            Some(Step::Fault(message)) => Err(io::Error::new(io::ErrorKind::BrokenPipe, message)),
            None => Ok(String::new()),
        }
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.script.lock().cleared += 1;
        Ok(())
    }
}
