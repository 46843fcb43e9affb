#![allow(dead_code)]

use std::path::Path;

use lazy_static::lazy_static;

use flappy_ql::config::{FlappyConfig, NeuralParameter, StoragePaths, TrainingParameter};
use flappy_ql::test::flappy_test_environment::FlappyTestEnvironment;

pub const SEED: u64 = 1234;

#[rustfmt::skip]
lazy_static! {
    static ref BASE_CONFIG: FlappyConfig = FlappyConfig {
        training: TrainingParameter {
            stats_every_generations: 5,
            save_every_generations: 5,
            max_ticks_per_episode: 3_000,
            seed: Some(SEED),
            ..TrainingParameter::default()
        },
        neural: NeuralParameter {
            batch_size: 16,
            replay_capacity: 2_000,
            target_sync_interval: 50,
            hidden_layers: vec![32, 32, 16],
            ..NeuralParameter::default()
        },
        ..FlappyConfig::default()
    };
}

/// Test configuration storing everything below `data_dir`
pub fn config(data_dir: &Path) -> FlappyConfig {
    FlappyConfig {
        storage: StoragePaths {
            data_dir: data_dir.to_path_buf(),
        },
        ..BASE_CONFIG.clone()
    }
}

pub fn environment(
    config: &FlappyConfig,
    seed: u64,
) -> FlappyTestEnvironment {
    FlappyTestEnvironment::new(&config.geometry, &config.gap, seed)
}
