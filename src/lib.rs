// Library surface for the binary and for headless/integration tests.
pub mod app_dirs;
pub mod buffer;
pub mod challenge;
pub mod config;
pub mod device;
pub mod error;
pub mod history;
pub mod link;
pub mod monitor;
pub mod observer;
pub mod runtime;
pub mod sample;
pub mod session;
pub mod util;

pub use challenge::{
    ChallengeConfig, ChallengeResults, ChallengeSnapshot, ChallengeStateMachine, Phase,
};
pub use device::PpgDevice;
pub use sample::Sample;
