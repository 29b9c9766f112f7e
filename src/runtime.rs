use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::Duration;

use crate::sample::Sample;

/// Unified event type consumed by the challenge loop
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ChallengeEvent {
    Sample(Sample),
    Tick,
}

/// Source of samples for the consumer side
pub trait SampleSource {
    /// Block for up to `timeout` waiting for a sample.
    /// Returns Ok(sample) if one arrives before the timeout, or Err(Timeout) if it expires.
    fn recv_timeout(&self, timeout: Duration) -> Result<Sample, RecvTimeoutError>;
}

/// Sample source over a plain channel, for replaying recorded or synthetic data
pub struct ChannelSampleSource {
    rx: Receiver<Sample>,
}

impl ChannelSampleSource {
    pub fn new(rx: Receiver<Sample>) -> Self {
        Self { rx }
    }
}

impl SampleSource for ChannelSampleSource {
    fn recv_timeout(&self, timeout: Duration) -> Result<Sample, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }
}

/// Configurable ticker interface
pub trait Ticker: Send + Sync + 'static {
    fn interval(&self) -> Duration;
}

/// Fixed interval ticker
#[derive(Clone, Copy, Debug)]
pub struct FixedTicker {
    interval: Duration,
}

impl FixedTicker {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Ticker for FixedTicker {
    fn interval(&self) -> Duration {
        self.interval
    }
}

/// Runner that advances the consumer one sample/tick at a time
pub struct Runner<S: SampleSource, T: Ticker> {
    source: S,
    ticker: T,
}

impl<S: SampleSource, T: Ticker> Runner<S, T> {
    pub fn new(source: S, ticker: T) -> Self {
        Self { source, ticker }
    }

    /// Blocks up to tick interval and returns the next sample, or Tick on timeout
    pub fn step(&self) -> ChallengeEvent {
        match self.source.recv_timeout(self.ticker.interval()) {
            Ok(sample) => ChallengeEvent::Sample(sample),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                ChallengeEvent::Tick
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn step_returns_tick_on_timeout() {
        let (_tx, rx) = mpsc::channel();
        let source = ChannelSampleSource::new(rx);
        let ticker = FixedTicker::new(Duration::from_millis(1));
        let runner = Runner::new(source, ticker);

        assert_eq!(runner.step(), ChallengeEvent::Tick);
    }

    #[test]
    fn step_passes_through_samples() {
        let (tx, rx) = mpsc::channel();
        tx.send(Sample::new(0.5, 300)).unwrap();
        let source = ChannelSampleSource::new(rx);
        let ticker = FixedTicker::new(Duration::from_millis(10));
        let runner = Runner::new(source, ticker);

        assert_eq!(runner.step(), ChallengeEvent::Sample(Sample::new(0.5, 300)));
    }

    #[test]
    fn disconnected_source_ticks() {
        let (tx, rx) = mpsc::channel::<Sample>();
        drop(tx);
        let runner = Runner::new(
            ChannelSampleSource::new(rx),
            FixedTicker::new(Duration::from_millis(1)),
        );
        assert_eq!(runner.step(), ChallengeEvent::Tick);
    }
}
