//! Configuration for the ATDome engine.

use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{ATDomeError, ATDomeResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomeConfig {
    /// Address of the dome controller.
    pub host: String,
    pub port: u16,
    /// Time limit for opening the connection and reading the banner (sec).
    pub connection_timeout: f64,
    /// Time limit for each reply from the controller (sec).
    pub read_timeout: f64,
    /// Delay between status requests (sec).
    pub status_interval: f64,
    /// Every Nth status request is a full status.
    pub short_per_full: usize,
    /// Azimuth "in position" tolerance (deg).
    pub az_tolerance: f64,
}

impl Default for DomeConfig {
    fn default() -> Self {
        DomeConfig {
            host: "127.0.0.1".to_owned(),
            port: 17310,
            connection_timeout: 10.0,
            read_timeout: 10.0,
            status_interval: 0.2,
            short_per_full: 5,
            az_tolerance: 0.2,
        }
    }
}

impl DomeConfig {
    pub fn from_toml_str(text: &str) -> ATDomeResult<DomeConfig> {
        let config: DomeConfig =
            toml::from_str(text).map_err(|err| ATDomeError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ATDomeResult<DomeConfig> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            ATDomeError::Config(format!("Cannot read {}: {err}", path.display()))
        })?;
        DomeConfig::from_toml_str(&text)
    }

    pub fn validate(&self) -> ATDomeResult<()> {
        if self.host.trim().is_empty() {
            return Err(ATDomeError::Config("host must not be empty".to_owned()));
        }
        for (name, value) in [
            ("connection_timeout", self.connection_timeout),
            ("read_timeout", self.read_timeout),
            ("status_interval", self.status_interval),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ATDomeError::Config(format!(
                    "{name}={value}; must be positive"
                )));
            }
        }
        if self.short_per_full == 0 {
            return Err(ATDomeError::Config(
                "short_per_full must be at least 1".to_owned(),
            ));
        }
        if !self.az_tolerance.is_finite() || self.az_tolerance < 0.0 {
            return Err(ATDomeError::Config(format!(
                "az_tolerance={}; must be non-negative",
                self.az_tolerance
            )));
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connection_timeout)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.read_timeout)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs_f64(self.status_interval)
    }
}
