//! Learning and decision core of a reflex-style avoidance game ("flap or wait").
//!
//! Per tick: [state_encoder] → [heuristic] (may short-circuit) → [agent] → environment step →
//! [reward] → agent learning → [calibrator] (on collision only).
//! The [session::TrainingSession] owns everything shared between agents of one training run.

pub mod agent;
pub mod calibrator;
pub mod config;
pub mod heuristic;
pub mod learner;
pub mod multi_agent;
pub mod persistence;
pub mod reward;
pub mod session;
pub mod snapshot;
pub mod state_encoder;

#[cfg(test)]
#[ctor::ctor]
fn init() {
    let _ = env_logger::builder()
        .format_timestamp_secs()
        .filter_level(log::LevelFilter::Debug)
        .parse_default_env()
        .try_init();
}
