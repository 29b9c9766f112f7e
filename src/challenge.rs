//! The biofeedback challenge.
//!
//! A run goes Idle → Calibrating → Challenge → Complete. Calibration ignores
//! the first `ignore_window` seconds while sensor contact settles, then
//! averages every value up to `calibration_duration` into a baseline. During
//! the challenge the target ramps linearly from the baseline to
//! `baseline + ramp_delta`, reached exactly at `max_duration`, and each sample
//! is credited `sample_dt` seconds in or below target.
//!
//! All times are seconds since the run's first sample. The machine is driven
//! by a single consumer and holds no locks.

use crate::observer::{ObserverList, SubscriptionId};
use crate::session::ChallengeSession;
use crate::util::mean;
use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    #[default]
    Idle,
    Calibrating,
    Challenge,
    Complete,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChallengeConfig {
    pub ignore_window: f64,
    pub calibration_duration: f64,
    pub ramp_delta: f64,
    pub max_duration: f64,
    /// Nominal sampling interval credited per scored sample.
    pub sample_dt: f64,
    /// Baseline used when no calibration values were collected: the middle
    /// of a 10-bit ADC range.
    pub fallback_baseline: f64,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            ignore_window: 3.0,
            calibration_duration: 10.0,
            ramp_delta: 50.0,
            max_duration: 40.0,
            sample_dt: 0.1,
            fallback_baseline: 500.0,
        }
    }
}

impl ChallengeConfig {
    /// Target at `elapsed` for a ramp starting at `challenge_start`.
    pub fn target(&self, baseline: f64, challenge_start: f64, elapsed: f64) -> f64 {
        let span = self.max_duration - challenge_start;
        let position = if span > 0.0 {
            ((elapsed - challenge_start) / span).clamp(0.0, 1.0)
        } else {
            1.0
        };
        baseline + self.ramp_delta * position
    }
}

/// Point-in-time view of a run, handed to observers and the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChallengeSnapshot {
    pub phase: Phase,
    pub elapsed: f64,
    pub current_value: Option<f64>,
    pub baseline: Option<f64>,
    pub target: Option<f64>,
    pub score: u64,
    pub time_in_target: f64,
    pub time_below_target: f64,
    pub max_consecutive_target: f64,
    pub current_consecutive_target: f64,
    pub challenge_start_time: Option<f64>,
    pub max_duration: f64,
    pub calibration_samples: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeResults {
    pub score: u64,
    pub time_in_target: f64,
    pub time_below_target: f64,
    pub percent_in_target: f64,
    pub max_consecutive_target: f64,
    pub baseline: f64,
}

/// Delivered to state observers once per phase transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseChange {
    pub phase: Phase,
    pub snapshot: ChallengeSnapshot,
}

#[derive(Debug, Default)]
pub struct ChallengeStateMachine {
    config: ChallengeConfig,
    session: ChallengeSession,
    observers: ObserverList<PhaseChange>,
}

impl ChallengeStateMachine {
    pub fn new(config: ChallengeConfig) -> Self {
        Self {
            config,
            session: ChallengeSession::default(),
            observers: ObserverList::new(),
        }
    }

    pub fn config(&self) -> &ChallengeConfig {
        &self.config
    }

    pub fn session(&self) -> &ChallengeSession {
        &self.session
    }

    pub fn phase(&self) -> Phase {
        self.session.phase
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&PhaseChange) + Send + Sync + 'static,
    {
        self.observers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Begins a new run in the calibration phase. The clock starts at the
    /// next sample.
    pub fn start_game(&mut self) {
        self.session = ChallengeSession::calibrating();
        log::info!("Challenge started - calibrating");
        self.notify();
    }

    /// Returns to idle from any phase, discarding the run.
    pub fn reset_game(&mut self) {
        self.session = ChallengeSession::default();
        log::info!("Challenge reset to idle");
        self.notify();
    }

    /// Feeds one sample. Returns `None` while idle, otherwise the snapshot
    /// after the sample was applied. Once complete, further samples change
    /// nothing.
    pub fn process_data_point(
        &mut self,
        time_value: f64,
        signal_value: f64,
    ) -> Option<ChallengeSnapshot> {
        match self.session.phase {
            Phase::Idle => return None,
            Phase::Complete => return Some(self.get_game_state()),
            Phase::Calibrating | Phase::Challenge => {}
        }

        let start = *self.session.start_time.get_or_insert(time_value);
        let elapsed = time_value - start;
        self.session.elapsed = elapsed;
        self.session.current_value = Some(signal_value);

        match self.session.phase {
            Phase::Calibrating => self.calibrate(elapsed, signal_value),
            Phase::Challenge => self.score(elapsed, signal_value),
            Phase::Idle | Phase::Complete => {}
        }

        Some(self.get_game_state())
    }

    fn calibrate(&mut self, elapsed: f64, signal_value: f64) {
        if elapsed >= self.config.calibration_duration {
            let baseline = match mean(&self.session.calibration) {
                Some(b) => b,
                None => {
                    log::warn!(
                        "No calibration values collected, using default baseline {}",
                        self.config.fallback_baseline
                    );
                    self.config.fallback_baseline
                }
            };
            log::info!(
                "Calibration complete: baseline {:.1} from {} values",
                baseline,
                self.session.calibration.len()
            );
            self.session.baseline = Some(baseline);
            self.session.challenge_start_time = Some(elapsed);
            self.session.phase = Phase::Challenge;
            self.notify();
        } else if elapsed >= self.config.ignore_window {
            self.session.calibration.push(signal_value);
        }
    }

    fn score(&mut self, elapsed: f64, signal_value: f64) {
        let dt = self.config.sample_dt;
        let target = self.target_at(elapsed).unwrap_or(f64::INFINITY);
        let s = &mut self.session;

        if signal_value >= target {
            s.score += 1;
            s.time_in_target += dt;
            s.current_consecutive_target += dt;
            s.max_consecutive_target = s.max_consecutive_target.max(s.current_consecutive_target);
        } else {
            s.time_below_target += dt;
            s.current_consecutive_target = 0.0;
        }

        if elapsed >= self.config.max_duration {
            s.max_consecutive_target = s.max_consecutive_target.max(s.current_consecutive_target);
            s.phase = Phase::Complete;
            log::info!(
                "Challenge complete: score {}, {:.1}s in target, best streak {:.1}s",
                s.score,
                s.time_in_target,
                s.max_consecutive_target
            );
            self.notify();
        }
    }

    /// Target at `elapsed`, or `None` before a baseline exists.
    pub fn target_at(&self, elapsed: f64) -> Option<f64> {
        let baseline = self.session.baseline?;
        let start = self
            .session
            .challenge_start_time
            .unwrap_or(self.config.calibration_duration);
        Some(self.config.target(baseline, start, elapsed))
    }

    pub fn get_game_state(&self) -> ChallengeSnapshot {
        let s = &self.session;
        ChallengeSnapshot {
            phase: s.phase,
            elapsed: s.elapsed,
            current_value: s.current_value,
            baseline: s.baseline,
            target: self.target_at(s.elapsed),
            score: s.score,
            time_in_target: s.time_in_target,
            time_below_target: s.time_below_target,
            max_consecutive_target: s.max_consecutive_target,
            current_consecutive_target: s.current_consecutive_target,
            challenge_start_time: s.challenge_start_time,
            max_duration: self.config.max_duration,
            calibration_samples: s.calibration.len(),
        }
    }

    /// Final scores, available only once the run is complete.
    pub fn get_final_results(&self) -> Option<ChallengeResults> {
        if self.session.phase != Phase::Complete {
            return None;
        }
        let s = &self.session;
        let scored = s.time_in_target + s.time_below_target;
        let percent_in_target = if scored > 0.0 {
            100.0 * s.time_in_target / scored
        } else {
            0.0
        };
        Some(ChallengeResults {
            score: s.score,
            time_in_target: s.time_in_target,
            time_below_target: s.time_below_target,
            percent_in_target,
            max_consecutive_target: s.max_consecutive_target,
            baseline: s.baseline.unwrap_or(self.config.fallback_baseline),
        })
    }

    fn notify(&self) {
        let change = PhaseChange {
            phase: self.session.phase,
            snapshot: self.get_game_state(),
        };
        self.observers.notify(&change);
    }
}
