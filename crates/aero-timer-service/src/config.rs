use std::time::Duration;

use thiserror::Error;

/// Default tick length; deadlines are tracked at 50ms granularity.
pub const DEFAULT_TICK: Duration = Duration::from_millis(50);

/// Requests further out than this are clamped.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

const ENV_TICK_US: &str = "AERO_TIMER_TICK_US";
const ENV_MAX_DELAY_MS: &str = "AERO_TIMER_MAX_DELAY_MS";
const ENV_EAGER_REARM: &str = "AERO_TIMER_EAGER_REARM";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimerServiceConfig {
    /// Length of one [`Tick`](crate::Tick).
    pub tick: Duration,
    pub max_delay: Duration,
    /// Rearm the one-shot timer as soon as the earliest request is cancelled, instead of letting
    /// the stale timer fire and rearming from there.
    pub eager_rearm_on_cancel: bool,
}

impl Default for TimerServiceConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            max_delay: DEFAULT_MAX_DELAY,
            eager_rearm_on_cancel: false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for env var {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("tick length must be non-zero")]
    ZeroTick,
}

impl TimerServiceConfig {
    /// Reads overrides from `AERO_TIMER_TICK_US`, `AERO_TIMER_MAX_DELAY_MS` and
    /// `AERO_TIMER_EAGER_REARM`; unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&'static str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(us) = parse_env(&lookup, ENV_TICK_US, |s| s.parse::<u64>().ok())? {
            cfg.tick = Duration::from_micros(us);
        }
        if let Some(ms) = parse_env(&lookup, ENV_MAX_DELAY_MS, |s| s.parse::<u64>().ok())? {
            cfg.max_delay = Duration::from_millis(ms);
        }
        if let Some(eager) = parse_env(&lookup, ENV_EAGER_REARM, parse_bool)? {
            cfg.eager_rearm_on_cancel = eager;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick.is_zero() {
            return Err(ConfigError::ZeroTick);
        }
        Ok(())
    }
}

fn parse_env<L, T>(
    lookup: &L,
    var: &'static str,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Option<T>, ConfigError>
where
    L: Fn(&'static str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    match parse(raw.trim()) {
        Some(value) => Ok(Some(value)),
        None => Err(ConfigError::InvalidEnv { var, value: raw }),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
