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

//! Prometheus metrics exporter for OpenWeatherMap
//!
//! ## Features
//!
//! `weather_exporter` periodically fetches current weather conditions for a list of cities using
//! the [OpenWeatherMap] current weather API and emits them as Prometheus metrics. All cities are
//! fetched concurrently and a failure for one city never prevents the others from being updated.
//! The following metrics are emitted, labeled with `city`, `country`, and `provider`.
//!
//! * `weather_temperature_celsius` - Temperature, in degrees celsius.
//! * `weather_humidity_percent` - Relative humidity (0-100).
//! * `weather_pressure_hpa` - Atmospheric pressure, in hectopascals.
//! * `weather_wind_speed_mps` - Wind speed, in meters per second.
//! * `weather_wind_direction_degrees` - Wind direction, in degrees.
//! * `weather_visibility_km` - Visibility, in kilometers.
//! * `weather_cloud_cover_percent` - Cloud cover (0-100).
//! * `weather_last_update_timestamp` - UNIX timestamp of the last successful update.
//!
//! Requests to the provider are tracked, labeled with `provider` (and `outcome`, which is
//! either `success` or `error`, for the counter).
//!
//! * `weather_api_requests_total` - Total number of requests made to the provider.
//! * `weather_api_request_duration_seconds` - Histogram of request durations.
//!
//! Values are kept after a city stops being fetched successfully. Use
//! `weather_last_update_timestamp` or `weather_api_requests_total{outcome="error"}` to
//! alert on stale data.
//!
//! [OpenWeatherMap]: https://openweathermap.org/current
//!
//! ## Build
//!
//! `weather_exporter` is a Rust program and must be built from source using a [Rust toolchain](https://rustup.rs/).
//!
//! ```text
//! git clone git@github.com:56quarters/weather_exporter.git && cd weather_exporter
//! cargo build --release
//! ```
//!
//! ## Usage
//!
//! ### Configuration
//!
//! An OpenWeatherMap API key is required and must be set in the config file or with the
//! `OPENWEATHER_API_KEY` environment variable. Everything else has a default. By default
//! the config file `weather_exporter.toml` in the current directory is used if it exists,
//! a different file can be picked with `--config`. Environment variables take precedence
//! over values from the file.
//!
//! ```toml
//! [server]
//! port = 8080                  # SERVER_PORT
//!
//! [weather]
//! api_key = "..."              # OPENWEATHER_API_KEY
//! timeout_millis = 10000       # WEATHER_TIMEOUT_MILLIS
//!
//! [[cities]]
//! name = "Boston"
//! country = "US"
//! coordinates = { lat = 42.3601, lon = -71.0589 }
//!
//! [scraping]
//! interval_secs = 300          # SCRAPING_INTERVAL_SECS
//! timeout_secs = 30            # SCRAPING_TIMEOUT_SECS
//! retry_attempts = 3           # RETRY_ATTEMPTS
//! retry_delay_secs = 10        # RETRY_DELAY_SECS
//!
//! [logging]
//! level = "info"               # LOG_LEVEL
//! format = "json"              # LOG_FORMAT, "json" or "text"
//! output = "stdout"            # LOG_OUTPUT, "stdout" or "stderr"
//! ```
//!
//! When no cities are configured, London, New York, and Tokyo are used.
//!
//! ### Run
//!
//! ```text
//! OPENWEATHER_API_KEY=... ./weather_exporter --config /etc/weather_exporter.toml
//! ```
//!
//! Current conditions for any city can be fetched on demand (without affecting metrics)
//! from `/weather/{city}`, for example `curl http://localhost:8080/weather/Boston`.
//!
//! ### Prometheus
//!
//! Prometheus metrics are exposed on port `8080` at `/metrics`. Once `weather_exporter`
//! is running, configure scrapes of it by your Prometheus server. Add the host running
//! `weather_exporter` as a target under the Prometheus `scrape_configs` section as described by
//! the example below.
//!
//! ```yaml
//! # Sample config for Prometheus.
//!
//! global:
//!   scrape_interval:     15s
//!   evaluation_interval: 15s
//!   external_labels:
//!     monitor: 'my_prom'
//!
//! scrape_configs:
//! - job_name: weather_exporter
//!   static_configs:
//!   - targets: ['example:8080']
//! ```
//!

pub mod client;
pub mod config;
pub mod http;
pub mod metrics;
pub mod scheduler;
