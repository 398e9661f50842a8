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

use crate::client::Observation;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Same bucket boundaries as the default buckets of the official Prometheus clients.
const REQUEST_DURATION_BUCKETS: [f64; 11] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

type GaugeF64 = Gauge<f64, AtomicU64>;

/// Labels for every gauge set from an `Observation`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SeriesLabels {
    pub city: String,
    pub country: String,
    pub provider: String,
}

impl SeriesLabels {
    pub fn new(obs: &Observation, provider: &str) -> Self {
        SeriesLabels {
            city: obs.city.clone(),
            country: obs.country.clone(),
            provider: provider.to_owned(),
        }
    }
}

/// Result of a single attempt to fetch weather for a target.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EncodeLabelValue for Outcome {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), fmt::Error> {
        EncodeLabelValue::encode(&self.as_str(), encoder)
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestLabels {
    provider: String,
    outcome: Outcome,
}

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ProviderLabels {
    provider: String,
}

/// Values most recently published for a single label set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub wind_speed: f64,
    pub wind_direction: f64,
    pub visibility: f64,
    pub cloud_cover: f64,
    /// UNIX timestamp, in seconds.
    pub last_update: f64,
}

impl From<&Observation> for Reading {
    fn from(obs: &Observation) -> Self {
        Reading {
            temperature: obs.temperature,
            humidity: obs.humidity,
            pressure: obs.pressure,
            wind_speed: obs.wind_speed,
            wind_direction: obs.wind_direction,
            visibility: obs.visibility,
            cloud_cover: obs.cloud_cover,
            last_update: obs.timestamp.timestamp() as f64,
        }
    }
}

/// Holder for metrics that are set from `Observation`s and provider requests.
///
/// All metrics are created and registered upon call to `WeatherMetrics::new()`. Gauges
/// share the prefix "weather_" and have `city`, `country`, and `provider` labels.
///
/// Series are never removed. If a city can no longer be fetched, its gauges keep the
/// last published values and `weather_last_update_timestamp` stops advancing. Consumers
/// are expected to detect staleness from the timestamp (or the error counter) instead
/// of relying on the series going away.
#[derive(Debug)]
pub struct WeatherMetrics {
    registry: Registry,
    // Held for writing while a label set is updated and for reading while the registry
    // is encoded so a scrape never sees values from two different observations.
    latest: RwLock<HashMap<SeriesLabels, Reading>>,
    temperature: Family<SeriesLabels, GaugeF64>,
    humidity: Family<SeriesLabels, GaugeF64>,
    pressure: Family<SeriesLabels, GaugeF64>,
    wind_speed: Family<SeriesLabels, GaugeF64>,
    wind_direction: Family<SeriesLabels, GaugeF64>,
    visibility: Family<SeriesLabels, GaugeF64>,
    cloud_cover: Family<SeriesLabels, GaugeF64>,
    last_update: Family<SeriesLabels, GaugeF64>,
    requests: Family<RequestLabels, Counter>,
    request_duration: Family<ProviderLabels, Histogram>,
}

impl WeatherMetrics {
    /// Create a new `WeatherMetrics` and register each metric with the provided `Registry`.
    pub fn new(mut registry: Registry) -> Self {
        let temperature = Family::<SeriesLabels, GaugeF64>::default();
        let humidity = Family::<SeriesLabels, GaugeF64>::default();
        let pressure = Family::<SeriesLabels, GaugeF64>::default();
        let wind_speed = Family::<SeriesLabels, GaugeF64>::default();
        let wind_direction = Family::<SeriesLabels, GaugeF64>::default();
        let visibility = Family::<SeriesLabels, GaugeF64>::default();
        let cloud_cover = Family::<SeriesLabels, GaugeF64>::default();
        let last_update = Family::<SeriesLabels, GaugeF64>::default();
        let requests = Family::<RequestLabels, Counter>::default();
        let request_duration = Family::<ProviderLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(REQUEST_DURATION_BUCKETS.iter().copied())
        });

        registry.register(
            "weather_temperature_celsius",
            "Current temperature in Celsius",
            temperature.clone(),
        );
        registry.register(
            "weather_humidity_percent",
            "Current humidity percentage",
            humidity.clone(),
        );
        registry.register(
            "weather_pressure_hpa",
            "Current atmospheric pressure in hPa",
            pressure.clone(),
        );
        registry.register(
            "weather_wind_speed_mps",
            "Current wind speed in meters per second",
            wind_speed.clone(),
        );
        registry.register(
            "weather_wind_direction_degrees",
            "Current wind direction in degrees",
            wind_direction.clone(),
        );
        registry.register(
            "weather_visibility_km",
            "Current visibility in kilometers",
            visibility.clone(),
        );
        registry.register(
            "weather_cloud_cover_percent",
            "Current cloud cover percentage",
            cloud_cover.clone(),
        );
        registry.register(
            "weather_last_update_timestamp",
            "Timestamp of last successful weather data update",
            last_update.clone(),
        );
        registry.register(
            "weather_api_requests",
            "Total number of API requests to weather providers",
            requests.clone(),
        );
        registry.register(
            "weather_api_request_duration_seconds",
            "Duration of weather API requests",
            request_duration.clone(),
        );

        Self {
            registry,
            latest: RwLock::new(HashMap::new()),
            temperature,
            humidity,
            pressure,
            wind_speed,
            wind_direction,
            visibility,
            cloud_cover,
            last_update,
            requests,
            request_duration,
        }
    }

    /// Set every gauge for the label set of this observation, replacing any previous values.
    pub fn publish(&self, obs: &Observation, provider: &str) {
        let labels = SeriesLabels::new(obs, provider);
        let reading = Reading::from(obs);

        let mut latest = self.latest.write().unwrap_or_else(PoisonError::into_inner);
        self.temperature.get_or_create(&labels).set(reading.temperature);
        self.humidity.get_or_create(&labels).set(reading.humidity);
        self.pressure.get_or_create(&labels).set(reading.pressure);
        self.wind_speed.get_or_create(&labels).set(reading.wind_speed);
        self.wind_direction.get_or_create(&labels).set(reading.wind_direction);
        self.visibility.get_or_create(&labels).set(reading.visibility);
        self.cloud_cover.get_or_create(&labels).set(reading.cloud_cover);
        self.last_update.get_or_create(&labels).set(reading.last_update);
        latest.insert(labels, reading);
    }

    /// Count a request to the provider and observe how long it took, whatever the outcome.
    pub fn record_request(&self, provider: &str, outcome: Outcome, elapsed: Duration) {
        self.requests
            .get_or_create(&RequestLabels {
                provider: provider.to_owned(),
                outcome,
            })
            .inc();
        self.request_duration
            .get_or_create(&ProviderLabels {
                provider: provider.to_owned(),
            })
            .observe(elapsed.as_secs_f64());
    }

    /// Values most recently published for a label set, if any have been.
    pub fn latest(&self, labels: &SeriesLabels) -> Option<Reading> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(labels)
            .copied()
    }

    /// Encode all metrics in the OpenMetrics text format.
    pub fn render(&self) -> Result<String, fmt::Error> {
        let _latest = self.latest.read().unwrap_or_else(PoisonError::into_inner);
        let mut buf = String::new();
        encode(&mut buf, &self.registry)?;
        Ok(buf)
    }

    #[cfg(test)]
    pub(crate) fn requests_total(&self, provider: &str, outcome: Outcome) -> u64 {
        self.requests
            .get_or_create(&RequestLabels {
                provider: provider.to_owned(),
                outcome,
            })
            .get()
    }
}

impl Default for WeatherMetrics {
    fn default() -> Self {
        Self::new(Registry::default())
    }
}

/// Find the value of the first sample in `text` whose name and labels start with `series`.
#[cfg(test)]
pub(crate) fn sample_value(text: &str, series: &str) -> Option<f64> {
    text.lines()
        .filter(|l| l.starts_with(series))
        .find_map(|l| l.rsplit(' ').next())
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::{sample_value, Outcome, Reading, SeriesLabels, WeatherMetrics};
    use crate::client::Observation;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    const PROVIDER: &str = "openweathermap";

    fn observation(city: &str, country: &str, value: f64) -> Observation {
        Observation {
            city: city.to_owned(),
            country: country.to_owned(),
            temperature: value,
            humidity: value,
            pressure: value,
            wind_speed: value,
            wind_direction: value,
            visibility: value,
            cloud_cover: value,
            timestamp: Utc.timestamp_opt(value as i64, 0).unwrap(),
            condition: "Clear".to_owned(),
        }
    }

    fn labels(city: &str, country: &str) -> SeriesLabels {
        SeriesLabels {
            city: city.to_owned(),
            country: country.to_owned(),
            provider: PROVIDER.to_owned(),
        }
    }

    #[test]
    fn test_publish_sets_all_gauges() {
        let metrics = WeatherMetrics::default();
        let obs = Observation {
            temperature: 15.2,
            humidity: 70.0,
            pressure: 1012.0,
            wind_speed: 3.1,
            wind_direction: 210.0,
            visibility: 8.0,
            cloud_cover: 40.0,
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            ..observation("London", "GB", 0.0)
        };

        metrics.publish(&obs, PROVIDER);
        let reading = metrics.latest(&labels("London", "GB")).unwrap();

        assert_eq!(15.2, reading.temperature);
        assert_eq!(8.0, reading.visibility);
        assert_eq!(1_700_000_000.0, reading.last_update);

        let london = r#"{city="London",country="GB",provider="openweathermap"}"#;
        let text = metrics.render().unwrap();
        for (name, expected) in [
            ("weather_temperature_celsius", 15.2),
            ("weather_humidity_percent", 70.0),
            ("weather_pressure_hpa", 1012.0),
            ("weather_wind_speed_mps", 3.1),
            ("weather_wind_direction_degrees", 210.0),
            ("weather_visibility_km", 8.0),
            ("weather_cloud_cover_percent", 40.0),
            ("weather_last_update_timestamp", 1_700_000_000.0),
        ] {
            let series = format!("{}{}", name, london);
            assert_eq!(Some(expected), sample_value(&text, &series), "series {}", series);
        }
    }

    #[test]
    fn test_publish_is_idempotent() {
        let metrics = WeatherMetrics::default();
        let obs = observation("Tokyo", "JP", 21.0);

        metrics.publish(&obs, PROVIDER);
        let first = metrics.render().unwrap();
        metrics.publish(&obs, PROVIDER);
        let second = metrics.render().unwrap();

        assert_eq!(first, second);
        assert_eq!(Some(Reading::from(&obs)), metrics.latest(&labels("Tokyo", "JP")));
    }

    #[test]
    fn test_publish_replaces_previous_values() {
        let metrics = WeatherMetrics::default();
        metrics.publish(&observation("Tokyo", "JP", 21.0), PROVIDER);
        metrics.publish(&observation("Tokyo", "JP", 23.0), PROVIDER);

        assert_eq!(23.0, metrics.latest(&labels("Tokyo", "JP")).unwrap().temperature);
    }

    #[test]
    fn test_latest_unknown_label_set() {
        let metrics = WeatherMetrics::default();
        metrics.publish(&observation("Tokyo", "JP", 21.0), PROVIDER);

        assert_eq!(None, metrics.latest(&labels("London", "GB")));
        assert!(!metrics.render().unwrap().contains(r#"city="London""#));
    }

    #[test]
    fn test_record_request_counts_every_outcome() {
        let metrics = WeatherMetrics::default();
        metrics.record_request(PROVIDER, Outcome::Success, Duration::from_millis(120));
        metrics.record_request(PROVIDER, Outcome::Error, Duration::from_millis(30));
        metrics.record_request(PROVIDER, Outcome::Error, Duration::from_millis(50));

        assert_eq!(1, metrics.requests_total(PROVIDER, Outcome::Success));
        assert_eq!(2, metrics.requests_total(PROVIDER, Outcome::Error));

        let text = metrics.render().unwrap();
        assert_eq!(
            Some(2.0),
            sample_value(
                &text,
                r#"weather_api_requests_total{provider="openweathermap",outcome="error"}"#
            )
        );
        assert_eq!(
            Some(3.0),
            sample_value(
                &text,
                r#"weather_api_request_duration_seconds_count{provider="openweathermap"}"#
            )
        );
    }

    #[test]
    fn test_render_never_observes_torn_label_set() {
        let metrics = WeatherMetrics::default();
        metrics.publish(&observation("London", "GB", 0.0), PROVIDER);

        let names = [
            "weather_temperature_celsius",
            "weather_humidity_percent",
            "weather_pressure_hpa",
            "weather_wind_speed_mps",
            "weather_wind_direction_degrees",
            "weather_visibility_km",
            "weather_cloud_cover_percent",
            "weather_last_update_timestamp",
        ];
        let london = r#"{city="London",country="GB",provider="openweathermap"}"#;

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 1..500 {
                    metrics.publish(&observation("London", "GB", i as f64), PROVIDER);
                }
            });
            s.spawn(|| {
                for i in 1..500 {
                    metrics.publish(&observation("Paris", "FR", i as f64), PROVIDER);
                }
            });

            for _ in 0..200 {
                let text = metrics.render().unwrap();
                let values: Vec<f64> = names
                    .iter()
                    .map(|n| sample_value(&text, &format!("{}{}", n, london)).unwrap())
                    .collect();

                assert!(values.iter().all(|v| *v == values[0]), "torn values {:?}", values);
            }
        });
    }
}
