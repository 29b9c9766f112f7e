//! Sensor connection lifecycle and the background reader.
//!
//! [`PpgDevice`] owns the link, the sample buffer and the reader thread.
//! The reader is the only writer to the buffer and the only thread that
//! invokes data observers. Shutdown is cooperative: the loop checks its run
//! state once per iteration, and [`PpgDevice::stop_reading`] waits at most
//! `join_timeout` before abandoning a reader stuck inside a blocking read.

use crate::buffer::SampleBuffer;
use crate::config::LinkConfig;
use crate::error::ConnectionError;
use crate::link::{LineSource, LinkOpener, SerialOpener};
use crate::monitor::{ConnectionEvent, ConnectionMonitor, ConnectionState};
use crate::observer::{ObserverList, SubscriptionId};
use crate::runtime::SampleSource;
use crate::sample::{parse_line, Sample};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    NotRunning,
    Running,
    Stopping,
}

impl ReaderState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ReaderState::Running,
            2 => ReaderState::Stopping,
            _ => ReaderState::NotRunning,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ReaderState::NotRunning => 0,
            ReaderState::Running => 1,
            ReaderState::Stopping => 2,
        }
    }
}

struct Shared {
    link: Mutex<Option<Box<dyn LineSource>>>,
    state: AtomicU8,
    // Bumped on every start and halt; a reader only acts while it matches.
    generation: AtomicU64,
    // Held by a reader while it checks its generation and publishes, so once
    // `halt_reader` has bumped the generation and taken this lock no stale
    // sample or fault can land.
    publish: Mutex<()>,
    buffer: SampleBuffer,
    monitor: ConnectionMonitor,
    data: ObserverList<Sample>,
}

impl Shared {
    fn reader_state(&self) -> ReaderState {
        ReaderState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_reader_state(&self, state: ReaderState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
            && self.reader_state() == ReaderState::Running
    }

    fn handle_line(&self, generation: u64, line: &str, started_at: &mut Option<Instant>) {
        let _publish = self.publish.lock();
        if !self.is_current(generation) {
            log::debug!("Discarding line read by stale reader (run {})", generation);
            return;
        }
        let Some(value) = parse_line(line) else {
            log::debug!("Ignoring malformed sample line: {:?}", line);
            return;
        };

        let now = Instant::now();
        let start = *started_at.get_or_insert(now);
        let sample = Sample::new(now.duration_since(start).as_secs_f64(), value);

        self.buffer.push(sample);
        self.data.notify(&sample);
    }

    fn fault(&self, generation: u64, err: io::Error) {
        let _publish = self.publish.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        log::error!("Serial read error: {}", err);
        self.set_reader_state(ReaderState::NotRunning);
        // A faulted port is of no further use; release it now.
        if let Some(mut guard) = self.link.try_lock() {
            guard.take();
        }
        self.monitor
            .update(false, false, format!("Connection lost: {}", err));
    }
}

fn read_loop(shared: Arc<Shared>, generation: u64, poll_interval: Duration) {
    let mut started_at: Option<Instant> = None;

    while shared.is_current(generation) && shared.monitor.is_connected() {
        let next = {
            let mut guard = shared.link.lock();
            let Some(link) = guard.as_mut() else {
                break;
            };
            match link.bytes_available() {
                Ok(0) => None,
                Ok(_) => Some(link.read_line()),
                Err(e) => Some(Err(e)),
            }
        };

        match next {
            None => thread::sleep(poll_interval),
            Some(Ok(line)) => shared.handle_line(generation, &line, &mut started_at),
            Some(Err(e)) => {
                shared.fault(generation, e);
                break;
            }
        }
    }

    if shared.generation.load(Ordering::SeqCst) == generation {
        shared.set_reader_state(ReaderState::NotRunning);
    }
    log::debug!("Exiting reader loop (run {})", generation);
}

struct ReaderTask {
    handle: JoinHandle<()>,
    // Disconnects when the reader thread exits.
    done: Receiver<()>,
}

/// Bounded stream of samples for a single consumer.
///
/// Fed from the reader thread with `try_send`, so a slow consumer loses
/// stream copies (logged) but never stalls acquisition. Dropping the stream
/// unsubscribes it.
pub struct SampleStream {
    rx: Receiver<Sample>,
    subscription: SubscriptionId,
    shared: Arc<Shared>,
}

impl SampleStream {
    pub fn recv(&self) -> Option<Sample> {
        self.rx.recv().ok()
    }

    pub fn try_recv(&self) -> Option<Sample> {
        self.rx.try_recv().ok()
    }

    /// Drains whatever is queued right now.
    pub fn drain(&self) -> Vec<Sample> {
        self.rx.try_iter().collect()
    }
}

impl SampleSource for SampleStream {
    fn recv_timeout(&self, timeout: Duration) -> Result<Sample, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

impl Drop for SampleStream {
    fn drop(&mut self) {
        self.shared.data.unsubscribe(self.subscription);
    }
}

pub struct PpgDevice {
    config: LinkConfig,
    opener: Arc<dyn LinkOpener>,
    shared: Arc<Shared>,
    reader: Option<ReaderTask>,
}

impl PpgDevice {
    /// A device on a real serial port.
    pub fn new(config: LinkConfig) -> Self {
        Self::with_opener(config, SerialOpener)
    }

    pub fn with_opener<O: LinkOpener>(config: LinkConfig, opener: O) -> Self {
        let shared = Arc::new(Shared {
            link: Mutex::new(None),
            state: AtomicU8::new(ReaderState::NotRunning.as_u8()),
            generation: AtomicU64::new(0),
            publish: Mutex::new(()),
            buffer: SampleBuffer::new(config.buffer_capacity),
            monitor: ConnectionMonitor::new(),
            data: ObserverList::new(),
        });
        Self {
            config,
            opener: Arc::new(opener),
            shared,
            reader: None,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Opens the configured device, closing any existing connection first.
    ///
    /// On failure the device is left disconnected and observers receive a
    /// `Disconnected: …` event; nothing retries on its own.
    pub fn connect(&mut self, start_reading: bool) -> Result<(), ConnectionError> {
        if self.shared.link.lock().is_some() || self.reader.is_some() {
            self.halt_reader();
            self.close_link();
        }

        let opened = self.opener.open(&self.config).and_then(|mut link| {
            if !self.config.settle().is_zero() {
                thread::sleep(self.config.settle());
            }
            link.clear_input()?;
            Ok(link)
        });

        match opened {
            Ok(link) => {
                *self.shared.link.lock() = Some(link);
                log::info!("Connected to {}", self.config.device);

                let message = if start_reading {
                    "Connected & Reading"
                } else {
                    "Connected"
                };
                self.shared.monitor.update(true, false, message);

                if start_reading {
                    self.start_reading()?;
                }
                Ok(())
            }
            Err(e) => {
                log::error!("Error connecting to {}: {}", self.config.device, e);
                self.shared.set_reader_state(ReaderState::NotRunning);
                self.shared
                    .monitor
                    .update(false, false, format!("Disconnected: {}", e));
                Err(e)
            }
        }
    }

    /// Starts the background reader. Starting while already running is a
    /// no-op.
    pub fn start_reading(&mut self) -> Result<(), ConnectionError> {
        if !self.shared.monitor.is_connected() || self.shared.link.lock().is_none() {
            log::warn!("Cannot start reading - not connected");
            self.shared
                .monitor
                .update(false, false, ConnectionError::NotConnected.to_string());
            return Err(ConnectionError::NotConnected);
        }
        if self.shared.reader_state() == ReaderState::Running {
            return Ok(());
        }
        // Reap a reader that ended on its own (e.g. after a fault).
        self.halt_reader();

        self.shared.buffer.clear();
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.set_reader_state(ReaderState::Running);
        self.shared.monitor.update(true, true, "Connected & Reading");

        let (done_tx, done_rx) = mpsc::channel::<()>();
        let shared = Arc::clone(&self.shared);
        let poll_interval = self.config.poll_interval();
        let spawned = thread::Builder::new()
            .name("ppg-reader".into())
            .spawn(move || {
                let _done = done_tx;
                read_loop(shared, generation, poll_interval);
            });

        match spawned {
            Ok(handle) => {
                self.reader = Some(ReaderTask {
                    handle,
                    done: done_rx,
                });
                log::info!("Started reader thread (run {})", generation);
                Ok(())
            }
            Err(e) => {
                self.shared.set_reader_state(ReaderState::NotRunning);
                self.shared.monitor.update(true, false, "Connected");
                Err(e.into())
            }
        }
    }

    /// Stops the reader, keeping the connection open.
    pub fn stop_reading(&mut self) {
        let was_running = self.shared.reader_state() == ReaderState::Running;
        self.halt_reader();
        if was_running {
            log::info!("Stopped reader thread");
            if self.shared.monitor.is_connected() {
                self.shared.monitor.update(true, false, "Connected");
            }
        }
    }

    /// Stops reading and closes the device. Safe to call repeatedly.
    pub fn cleanup(&mut self) {
        self.stop_reading();
        let was_connected = self.shared.monitor.is_connected();
        let had_link = self.close_link();
        if was_connected || had_link {
            self.shared.monitor.update(false, false, "Disconnected");
            log::info!("Serial connection closed");
        }
    }

    fn halt_reader(&mut self) {
        if self.shared.reader_state() == ReaderState::Running {
            self.shared.set_reader_state(ReaderState::Stopping);
        }
        // Orphan any reader that is still running so it cannot act again.
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        // Wait out a publish already past its generation check.
        if self.shared.publish.try_lock_for(self.config.join_timeout()).is_none() {
            log::warn!("Reader is stuck delivering a sample; continuing without it");
        }

        if let Some(task) = self.reader.take() {
            let timeout = self.config.join_timeout();
            match task.done.recv_timeout(timeout) {
                Err(RecvTimeoutError::Timeout) => {
                    log::warn!(
                        "Reader thread did not stop within {:?}; abandoning it",
                        timeout
                    );
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if task.handle.join().is_err() {
                        log::error!("Reader thread panicked");
                    }
                }
            }
        }
        self.shared.set_reader_state(ReaderState::NotRunning);
    }

    /// Returns true if a link was open.
    fn close_link(&mut self) -> bool {
        match self.shared.link.try_lock_for(self.config.join_timeout()) {
            Some(mut guard) => guard.take().is_some(),
            None => {
                log::warn!(
                    "Serial handle for {} is held by an abandoned reader; it is released at exit",
                    self.config.device
                );
                self.shared.monitor.mark_disconnected();
                true
            }
        }
    }

    pub fn subscribe_data<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Sample) + Send + Sync + 'static,
    {
        self.shared.data.subscribe(callback)
    }

    pub fn unsubscribe_data(&self, id: SubscriptionId) -> bool {
        self.shared.data.unsubscribe(id)
    }

    pub fn subscribe_connection<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ConnectionEvent) + Send + Sync + 'static,
    {
        self.shared.monitor.subscribe(callback)
    }

    pub fn unsubscribe_connection(&self, id: SubscriptionId) -> bool {
        self.shared.monitor.unsubscribe(id)
    }

    /// Opens a bounded stream of samples for one consumer.
    pub fn sample_stream(&self) -> SampleStream {
        let (tx, rx) = mpsc::sync_channel(self.config.channel_capacity.max(1));
        let tx = Mutex::new(tx);
        let subscription = self.shared.data.subscribe(move |sample: &Sample| {
            if let Err(TrySendError::Full(s)) = tx.lock().try_send(*sample) {
                log::warn!("Sample stream full; dropping sample at {:.3}s", s.timestamp);
            }
        });
        SampleStream {
            rx,
            subscription,
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn get_recent(
        &self,
        max_points: Option<usize>,
        time_range_secs: Option<f64>,
    ) -> (Vec<f64>, Vec<i64>) {
        self.shared.buffer.get_recent(max_points, time_range_secs)
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.shared.buffer
    }

    pub fn clear_data(&self) {
        self.shared.buffer.clear();
        log::debug!("Cleared sample buffer");
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.monitor.state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.monitor.is_connected()
    }

    pub fn is_reading(&self) -> bool {
        self.shared.reader_state() == ReaderState::Running
    }

    pub fn reader_state(&self) -> ReaderState {
        self.shared.reader_state()
    }
}

impl Drop for PpgDevice {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::ScriptedOpener;

    fn quick_config() -> LinkConfig {
        LinkConfig {
            settle_ms: 0,
            poll_interval_ms: 1,
            join_timeout_ms: 500,
            ..LinkConfig::default()
        }
    }

    fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn reader_state_roundtrips_through_u8() {
        for s in [
            ReaderState::NotRunning,
            ReaderState::Running,
            ReaderState::Stopping,
        ] {
            assert_eq!(ReaderState::from_u8(s.as_u8()), s);
        }
    }

    #[test]
    fn start_reading_requires_connection() {
        let mut device = PpgDevice::with_opener(quick_config(), ScriptedOpener::new());
        let err = device.start_reading().unwrap_err();
        assert!(matches!(err, ConnectionError::NotConnected));
        assert_eq!(device.connection_state().last_message, "No valid connection");
        assert_eq!(device.reader_state(), ReaderState::NotRunning);
    }

    #[test]
    fn connect_clears_stale_input() {
        let opener = ScriptedOpener::new();
        let mut device = PpgDevice::with_opener(quick_config(), opener.clone());
        device.connect(false).unwrap();
        assert_eq!(opener.clear_count(), 1);
        assert!(device.is_connected());
        assert!(!device.is_reading());
    }

    #[test]
    fn first_sample_is_time_zero() {
        let opener = ScriptedOpener::with_lines(["100", "101"]);
        let mut device = PpgDevice::with_opener(quick_config(), opener);
        device.connect(true).unwrap();

        assert!(wait_until(|| device.buffer().len() == 2));
        let (t, v) = device.get_recent(None, None);
        assert_eq!(t[0], 0.0);
        assert!(t[1] >= 0.0);
        assert_eq!(v, vec![100, 101]);
        device.cleanup();
    }

    #[test]
    fn stop_then_start_clears_buffer() {
        let opener = ScriptedOpener::with_lines(["5"]);
        let mut device = PpgDevice::with_opener(quick_config(), opener.clone());
        device.connect(true).unwrap();
        assert!(wait_until(|| device.buffer().len() == 1));

        device.stop_reading();
        assert_eq!(device.reader_state(), ReaderState::NotRunning);
        assert_eq!(device.buffer().len(), 1);

        device.start_reading().unwrap();
        assert!(device.buffer().is_empty());
        opener.push_line("6");
        assert!(wait_until(|| device.buffer().latest().map(|s| s.value) == Some(6)));
        assert_eq!(device.buffer().latest().unwrap().timestamp, 0.0);
    }

    #[test]
    fn cleanup_is_idempotent() {
        let mut device = PpgDevice::with_opener(quick_config(), ScriptedOpener::new());
        device.connect(true).unwrap();
        device.cleanup();
        device.cleanup();
        assert!(!device.is_connected());
        assert_eq!(device.connection_state().last_message, "Disconnected");
    }
}
