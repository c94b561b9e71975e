use std::time::Duration;

use serde::Deserialize;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub lock_duration_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
    pub stalled_interval_ms: Option<u64>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("SLUICE_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path.as_deref().unwrap_or("sluice.db")
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or("127.0.0.1")
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(3000)
    }

    /// How long a reserved job stays owned by a worker before it counts as stalled.
    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms.unwrap_or(30_000))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(500))
    }

    pub fn stalled_interval(&self) -> Duration {
        Duration::from_millis(self.stalled_interval_ms.unwrap_or(30_000))
    }
}
