use std::io;

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("failed to spawn timer thread: {0}")]
    Spawn(#[from] io::Error),

    #[error("one-shot timer was already started")]
    AlreadyStarted,

    #[error("invalid timer service config: {0}")]
    InvalidConfig(#[from] ConfigError),
}
