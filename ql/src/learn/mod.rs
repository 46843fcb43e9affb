pub mod exploration;
pub mod replay_buffer;
