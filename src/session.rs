use crate::challenge::Phase;

/// Mutable state of one challenge run. Owned by the state machine; replaced
/// wholesale on `start_game` and `reset_game`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChallengeSession {
    pub phase: Phase,
    // Latched from the first sample's own timestamp, never the wall clock.
    pub start_time: Option<f64>,
    pub elapsed: f64,
    pub current_value: Option<f64>,
    pub baseline: Option<f64>,
    pub challenge_start_time: Option<f64>,
    pub calibration: Vec<f64>,
    // Results
    pub score: u64,
    pub time_in_target: f64,
    pub time_below_target: f64,
    pub max_consecutive_target: f64,
    pub current_consecutive_target: f64,
}

impl ChallengeSession {
    pub fn calibrating() -> Self {
        Self {
            phase: Phase::Calibrating,
            ..Self::default()
        }
    }
}
