use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_VISIBILITY_SECS: u64 = 30;
pub const DEFAULT_MAX_RETRIES: u32 = 5;

fn default_visibility() -> u64 {
    DEFAULT_VISIBILITY_SECS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Settings read from `LEASEMQ_`-prefixed environment variables.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,

    /// Lease duration in seconds.
    #[serde(default = "default_visibility")]
    pub visibility: u64,

    /// Initial invisibility of new messages in seconds.
    #[serde(default)]
    pub delay: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("LEASEMQ_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("leasemq.db")
    }

    pub fn visibility(&self) -> Duration {
        Duration::from_secs(self.visibility)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            visibility: DEFAULT_VISIBILITY_SECS,
            delay: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}
