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

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Condition reported when the provider doesn't include any weather descriptions.
pub const UNKNOWN_CONDITION: &str = "Unknown";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("unexpected status {status} from provider: {}", .body.as_deref().unwrap_or("<no body>"))]
    Provider { status: StatusCode, body: Option<String> },
    #[error("unable to decode provider response: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("invalid provider URL {0}")]
    InvalidUrl(Url),
}

impl ClientError {
    /// Return true if the same request might succeed if it were made again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Provider { status, .. } => status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS,
            Self::Decode(_) | Self::InvalidUrl(_) => false,
        }
    }
}

/// Current conditions for a single location, normalized from a provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub city: String,
    pub country: String,
    /// Degrees celsius
    pub temperature: f64,
    /// Relative humidity (0-100)
    pub humidity: f64,
    /// Hectopascals
    pub pressure: f64,
    /// Meters per second
    pub wind_speed: f64,
    /// Degrees (0-360)
    pub wind_direction: f64,
    /// Kilometers
    pub visibility: f64,
    /// Percent (0-100)
    pub cloud_cover: f64,
    /// When the observation was processed by this client, not when the provider measured it.
    pub timestamp: DateTime<Utc>,
    pub condition: String,
}

/// Source of current weather conditions.
///
/// Implementations make a single request per call and do not retry, callers
/// are expected to handle retries if they want them.
#[async_trait]
pub trait WeatherProvider: fmt::Debug + Send + Sync {
    /// Name of the provider, used as the `provider` label for metrics.
    fn name(&self) -> &str;

    async fn fetch_by_name(&self, name: &str) -> Result<Observation, ClientError>;

    async fn fetch_by_coordinates(&self, lat: f64, lon: f64) -> Result<Observation, ClientError>;
}

#[derive(Debug)]
pub struct OpenWeatherClient {
    client: Client,
    weather_url: Url,
    api_key: String,
}

impl OpenWeatherClient {
    pub const PROVIDER: &'static str = "openweathermap";
    const USER_AGENT: &'static str = "Weather Prometheus Exporter (https://github.com/56quarters/weather_exporter)";
    const JSON_RESPONSE: &'static str = "application/json";
    const UNITS: &'static str = "metric";

    /// Create a new client that makes requests relative to `base_url`.
    ///
    /// Any timeout for requests should be configured on the provided `Client`.
    pub fn new(client: Client, base_url: Url, api_key: &str) -> Result<Self, ClientError> {
        let weather_url = Self::weather_url(base_url)?;
        Ok(OpenWeatherClient {
            client,
            weather_url,
            api_key: api_key.to_owned(),
        })
    }

    fn weather_url(base_url: Url) -> Result<Url, ClientError> {
        let mut url = base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| ClientError::InvalidUrl(base_url))?;
            segments.pop_if_empty().push("weather");
        }

        Ok(url)
    }

    async fn make_request(&self, query: &[(&str, &str)]) -> Result<Observation, ClientError> {
        let res = self
            .client
            .get(self.weather_url.clone())
            .query(query)
            .query(&[("appid", self.api_key.as_str()), ("units", Self::UNITS)])
            .header(USER_AGENT, Self::USER_AGENT)
            .header(ACCEPT, Self::JSON_RESPONSE)
            .send()
            .await
            .map_err(ClientError::Transport)?;

        let res = Self::check_status(res).await?;
        let body = res.bytes().await.map_err(ClientError::Transport)?;
        let parsed = serde_json::from_slice::<CurrentWeather>(&body).map_err(ClientError::Decode)?;
        Ok(parsed.into_observation(Utc::now()))
    }

    async fn check_status(res: Response) -> Result<Response, ClientError> {
        let status = res.status();
        if status.is_success() {
            return Ok(res);
        }

        // The body is only for diagnostics, failing to read it doesn't change the outcome.
        let body = res.text().await.ok().filter(|b| !b.is_empty());
        Err(ClientError::Provider { status, body })
    }
}

#[async_trait]
impl WeatherProvider for OpenWeatherClient {
    fn name(&self) -> &str {
        Self::PROVIDER
    }

    async fn fetch_by_name(&self, name: &str) -> Result<Observation, ClientError> {
        tracing::debug!(message = "making current weather request", city = %name, url = %self.weather_url);
        self.make_request(&[("q", name)]).await
    }

    async fn fetch_by_coordinates(&self, lat: f64, lon: f64) -> Result<Observation, ClientError> {
        tracing::debug!(message = "making current weather request", lat = lat, lon = lon, url = %self.weather_url);
        let lat = lat.to_string();
        let lon = lon.to_string();
        self.make_request(&[("lat", lat.as_str()), ("lon", lon.as_str())]).await
    }
}

/// Subset of the OpenWeatherMap "current weather" response that we care about.
#[derive(Deserialize, Debug)]
struct CurrentWeather {
    name: String,
    sys: Sys,
    main: Main,
    #[serde(default)]
    wind: Wind,
    /// Meters. Omitted by the API for some locations.
    #[serde(default)]
    visibility: i64,
    #[serde(default)]
    clouds: Clouds,
    #[serde(default)]
    weather: Vec<Condition>,
}

#[derive(Deserialize, Debug)]
struct Sys {
    #[serde(default)]
    country: String,
}

#[derive(Deserialize, Debug)]
struct Main {
    temp: f64,
    humidity: f64,
    pressure: f64,
}

#[derive(Deserialize, Debug, Default)]
struct Wind {
    #[serde(default)]
    speed: f64,
    #[serde(default)]
    deg: f64,
}

#[derive(Deserialize, Debug, Default)]
struct Clouds {
    #[serde(default)]
    all: f64,
}

#[derive(Deserialize, Debug)]
struct Condition {
    main: String,
}

impl CurrentWeather {
    fn into_observation(self, timestamp: DateTime<Utc>) -> Observation {
        let condition = self
            .weather
            .into_iter()
            .next()
            .map(|c| c.main)
            .unwrap_or_else(|| UNKNOWN_CONDITION.to_owned());

        Observation {
            city: self.name,
            country: self.sys.country,
            temperature: self.main.temp,
            humidity: self.main.humidity,
            pressure: self.main.pressure,
            wind_speed: self.wind.speed,
            wind_direction: self.wind.deg,
            visibility: self.visibility as f64 / 1000.0,
            cloud_cover: self.clouds.all,
            timestamp,
            condition,
        }
    }
}
