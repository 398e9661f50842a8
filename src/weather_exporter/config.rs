// weather_exporter - Prometheus metrics exporter for OpenWeatherMap
//
// Copyright 2024 Nick Pillitteri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

use reqwest::Url;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

pub const ENV_API_KEY: &str = "OPENWEATHER_API_KEY";

/// Upper bound for the per-target retry budget and the delay between retries.
const MAX_RETRY_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read config file {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("unable to parse config file {}: {source}", .path.display())]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("invalid value {value:?} for environment variable {name}")]
    Env { name: &'static str, value: String },
    #[error("OPENWEATHER_API_KEY is required")]
    MissingApiKey,
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Exporter settings, built from defaults, an optional TOML file, and the environment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub weather: WeatherConfig,
    pub cities: Vec<CityConfig>,
    pub scraping: ScrapingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub metrics_path: String,
    pub health_path: String,
    pub ready_path: String,
    pub request_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 8080,
            metrics_path: "/metrics".to_owned(),
            health_path: "/health".to_owned(),
            ready_path: "/ready".to_owned(),
            request_timeout_secs: 30,
            shutdown_timeout_secs: 30,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout_millis: u64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        WeatherConfig {
            api_key: String::new(),
            base_url: "https://api.openweathermap.org/data/2.5".to_owned(),
            timeout_millis: 10_000,
        }
    }
}

impl WeatherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis)
    }

    /// Parsed base URL, only valid to call after `Config::validate()` succeeds.
    pub fn url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.base_url).map_err(|e| ConfigError::Invalid {
            field: "weather.base_url",
            reason: e.to_string(),
        })?;

        if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                field: "weather.base_url",
                reason: format!("{} is not an HTTP URL", url),
            });
        }

        Ok(url)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CityConfig {
    pub name: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub coordinates: Coordinates,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScrapingConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_secs: u64,
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        ScrapingConfig {
            interval_secs: 300,
            timeout_secs: 30,
            retry_attempts: 3,
            retry_delay_secs: 10,
        }
    }
}

impl ScrapingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    Stderr,
}

impl FromStr for LogOutput {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Allowed values are 'trace', 'debug', 'info', 'warn', and 'error' (case insensitive)
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_owned(),
            format: LogFormat::Json,
            output: LogOutput::Stdout,
        }
    }
}

impl LoggingConfig {
    pub fn max_level(&self) -> Result<Level, ConfigError> {
        Level::from_str(&self.level).map_err(|_| ConfigError::Invalid {
            field: "logging.level",
            reason: format!("unknown level {:?}", self.level),
        })
    }
}

/// Cities polled when none are configured.
pub fn default_cities() -> Vec<CityConfig> {
    vec![
        CityConfig {
            name: "London".to_owned(),
            country: "GB".to_owned(),
            coordinates: Coordinates {
                lat: 51.5074,
                lon: -0.1278,
            },
        },
        CityConfig {
            name: "New York".to_owned(),
            country: "US".to_owned(),
            coordinates: Coordinates {
                lat: 40.7128,
                lon: -74.0060,
            },
        },
        CityConfig {
            name: "Tokyo".to_owned(),
            country: "JP".to_owned(),
            coordinates: Coordinates {
                lat: 35.6762,
                lon: 139.6503,
            },
        },
    ]
}

impl Config {
    /// Load configuration from `path` (if it exists) and the process environment.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with(path, |name| std::env::var(name).ok())
    }

    /// Load configuration from `path` (if it exists) with environment variables
    /// looked up by `env`, then validate it.
    pub fn load_with<F>(path: &Path, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_env(env)?;
        if cfg.cities.is_empty() {
            cfg.cities = default_cities();
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => Self::from_toml(path, &contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(message = "config file not found, using defaults", path = %path.display());
                Ok(Self::default())
            }
            Err(e) => Err(ConfigError::Read {
                path: path.to_owned(),
                source: e,
            }),
        }
    }

    fn from_toml(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })
    }

    fn apply_env<F>(&mut self, env: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_from(&env, "SERVER_PORT", &mut self.server.port)?;
        override_from(&env, "METRICS_PATH", &mut self.server.metrics_path)?;
        override_from(&env, "HEALTH_PATH", &mut self.server.health_path)?;
        override_from(&env, "READY_PATH", &mut self.server.ready_path)?;
        override_from(&env, "REQUEST_TIMEOUT_SECS", &mut self.server.request_timeout_secs)?;
        override_from(&env, "SHUTDOWN_TIMEOUT_SECS", &mut self.server.shutdown_timeout_secs)?;
        override_from(&env, ENV_API_KEY, &mut self.weather.api_key)?;
        override_from(&env, "WEATHER_BASE_URL", &mut self.weather.base_url)?;
        override_from(&env, "WEATHER_TIMEOUT_MILLIS", &mut self.weather.timeout_millis)?;
        override_from(&env, "SCRAPING_INTERVAL_SECS", &mut self.scraping.interval_secs)?;
        override_from(&env, "SCRAPING_TIMEOUT_SECS", &mut self.scraping.timeout_secs)?;
        override_from(&env, "RETRY_ATTEMPTS", &mut self.scraping.retry_attempts)?;
        override_from(&env, "RETRY_DELAY_SECS", &mut self.scraping.retry_delay_secs)?;
        override_from(&env, "LOG_LEVEL", &mut self.logging.level)?;
        override_from(&env, "LOG_FORMAT", &mut self.logging.format)?;
        override_from(&env, "LOG_OUTPUT", &mut self.logging.output)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.weather.api_key.trim().is_empty() {
            return Err(ConfigError::MissingApiKey);
        }

        self.weather.url()?;
        self.logging.max_level()?;

        for (field, value) in [
            ("scraping.interval_secs", self.scraping.interval_secs),
            ("weather.timeout_millis", self.weather.timeout_millis),
            ("server.request_timeout_secs", self.server.request_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_owned(),
                });
            }
        }

        for (field, value) in [
            ("scraping.timeout_secs", self.scraping.timeout_secs),
            ("scraping.retry_delay_secs", self.scraping.retry_delay_secs),
        ] {
            if value > MAX_RETRY_SECS {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{} is more than the maximum of {} seconds", value, MAX_RETRY_SECS),
                });
            }
        }

        for (field, path) in [
            ("server.metrics_path", &self.server.metrics_path),
            ("server.health_path", &self.server.health_path),
            ("server.ready_path", &self.server.ready_path),
        ] {
            if !path.starts_with('/') {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{:?} must start with '/'", path),
                });
            }
        }

        let paths = [&self.server.metrics_path, &self.server.health_path, &self.server.ready_path];
        if paths.iter().enumerate().any(|(i, p)| paths[..i].contains(p)) {
            return Err(ConfigError::Invalid {
                field: "server",
                reason: "metrics, health, and ready paths must be different".to_owned(),
            });
        }

        if let Some(city) = self.cities.iter().find(|c| c.name.trim().is_empty()) {
            return Err(ConfigError::Invalid {
                field: "cities",
                reason: format!("city with country {:?} has an empty name", city.country),
            });
        }

        Ok(())
    }
}

fn override_from<F, T>(env: &F, name: &'static str, field: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = env(name) {
        *field = value.parse().map_err(|_| ConfigError::Env { name, value })?;
    }

    Ok(())
}
