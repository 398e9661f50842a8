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

use crate::client::WeatherProvider;
use crate::config::ServerConfig;
use crate::metrics::WeatherMetrics;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

const OPENMETRICS_TEXT: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";
const WEATHER_PATH: &str = "/weather/:city";

/// State shared by every HTTP handler.
#[derive(Debug)]
pub struct RequestContext {
    metrics: Arc<WeatherMetrics>,
    provider: Arc<dyn WeatherProvider>,
    request_timeout: Duration,
}

impl RequestContext {
    pub fn new(metrics: Arc<WeatherMetrics>, provider: Arc<dyn WeatherProvider>, request_timeout: Duration) -> Self {
        Self {
            metrics,
            provider,
            request_timeout,
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusBody {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Build routes for metrics, health, readiness, and on-demand weather queries.
pub fn router(context: Arc<RequestContext>, cfg: &ServerConfig) -> Router {
    Router::new()
        .route(&cfg.metrics_path, get(text_metrics))
        .route(&cfg.health_path, get(health))
        .route(&cfg.ready_path, get(ready))
        .route(WEATHER_PATH, get(current_weather))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

/// Render every metric in the OpenMetrics text format.
pub async fn text_metrics(State(context): State<Arc<RequestContext>>) -> Response {
    match context.metrics.render() {
        Ok(buf) => {
            tracing::debug!(message = "encoded prometheus metrics to text format", num_bytes = buf.len());
            ([(CONTENT_TYPE, OPENMETRICS_TEXT)], buf).into_response()
        }
        Err(e) => {
            tracing::error!(message = "error encoding metrics", error = %e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn health() -> Json<impl Serialize> {
    Json(StatusBody { status: "ok" })
}

pub async fn ready() -> Json<impl Serialize> {
    Json(StatusBody { status: "ready" })
}

/// Fetch current weather for a city directly from the provider. Doesn't update any metrics.
pub async fn current_weather(State(context): State<Arc<RequestContext>>, Path(city): Path<String>) -> Response {
    let res = tokio::time::timeout(context.request_timeout, context.provider.fetch_by_name(&city)).await;

    let error = match res {
        Ok(Ok(obs)) => return Json(obs).into_response(),
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("timed out after {}ms", context.request_timeout.as_millis()),
    };

    tracing::warn!(message = "failed to fetch weather on demand", city = %city, error = %error);
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody { error })).into_response()
}

#[cfg(test)]
mod tests {
    use super::{current_weather, health, ready, router, text_metrics, RequestContext};
    use crate::client::{ClientError, Observation, WeatherProvider};
    use crate::config::ServerConfig;
    use crate::metrics::WeatherMetrics;
    use async_trait::async_trait;
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use chrono::Utc;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    /// Provider that knows the weather for exactly one city.
    #[derive(Debug)]
    struct OneCityProvider {
        city: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl WeatherProvider for OneCityProvider {
        fn name(&self) -> &str {
            "one_city"
        }

        async fn fetch_by_name(&self, name: &str) -> Result<Observation, ClientError> {
            tokio::time::sleep(self.delay).await;
            if name != self.city {
                return Err(ClientError::Provider {
                    status: StatusCode::NOT_FOUND,
                    body: Some(r#"{"cod":"404","message":"city not found"}"#.to_owned()),
                });
            }

            Ok(Observation {
                city: name.to_owned(),
                country: "US".to_owned(),
                temperature: 22.0,
                humidity: 40.0,
                pressure: 1015.0,
                wind_speed: 2.5,
                wind_direction: 90.0,
                visibility: 10.0,
                cloud_cover: 0.0,
                timestamp: Utc::now(),
                condition: "Clear".to_owned(),
            })
        }

        async fn fetch_by_coordinates(&self, _lat: f64, _lon: f64) -> Result<Observation, ClientError> {
            self.fetch_by_name(self.city).await
        }
    }

    fn context(metrics: Arc<WeatherMetrics>, delay: Duration) -> Arc<RequestContext> {
        let provider = Arc::new(OneCityProvider { city: "New York", delay });
        Arc::new(RequestContext::new(metrics, provider, Duration::from_millis(500)))
    }

    async fn body_json(res: Response) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(res.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_text_metrics() {
        let metrics = Arc::new(WeatherMetrics::default());
        let ctx = context(metrics.clone(), Duration::ZERO);
        let obs = ctx.provider.fetch_by_name("New York").await.unwrap();
        metrics.publish(&obs, "one_city");

        let res = text_metrics(State(ctx)).await;
        assert_eq!(StatusCode::OK, res.status());

        let content_type = res.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.starts_with("application/openmetrics-text"));

        let bytes = hyper::body::to_bytes(res.into_body()).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains(r#"weather_temperature_celsius{city="New York",country="US",provider="one_city"}"#));
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let res = health().await.into_response();
        assert_eq!(StatusCode::OK, res.status());
        assert_eq!(serde_json::json!({"status": "ok"}), body_json(res).await);

        let res = ready().await.into_response();
        assert_eq!(StatusCode::OK, res.status());
        assert_eq!(serde_json::json!({"status": "ready"}), body_json(res).await);
    }

    #[tokio::test]
    async fn test_current_weather_success_does_not_publish() {
        let metrics = Arc::new(WeatherMetrics::default());
        let res = current_weather(
            State(context(metrics.clone(), Duration::ZERO)),
            Path("New York".to_owned()),
        )
        .await;

        assert_eq!(StatusCode::OK, res.status());
        let body = body_json(res).await;
        assert_eq!("New York", body["city"]);
        assert_eq!(22.0, body["temperature"]);
        assert_eq!("Clear", body["condition"]);

        let text = metrics.render().unwrap();
        assert!(!text.contains("New York"));
    }

    #[tokio::test]
    async fn test_current_weather_error() {
        let metrics = Arc::new(WeatherMetrics::default());
        let res = current_weather(State(context(metrics, Duration::ZERO)), Path("Atlantis".to_owned())).await;

        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, res.status());
        let body = body_json(res).await;
        assert!(body["error"].as_str().unwrap().contains("404"));
    }

    #[tokio::test]
    async fn test_current_weather_timeout() {
        let metrics = Arc::new(WeatherMetrics::default());
        let res = current_weather(
            State(context(metrics, Duration::from_secs(5))),
            Path("New York".to_owned()),
        )
        .await;

        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, res.status());
        let body = body_json(res).await;
        assert!(body["error"].as_str().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_router_paths() {
        let cfg = ServerConfig {
            metrics_path: "/custom/metrics".to_owned(),
            ..ServerConfig::default()
        };
        let app = router(context(Arc::new(WeatherMetrics::default()), Duration::ZERO), &cfg);
        let server = axum::Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(app.into_make_service());
        let addr = server.local_addr();
        tokio::spawn(server);

        let client = reqwest::Client::new();
        let get = |path: &str| client.get(format!("http://{}{}", addr, path)).send();

        assert_eq!(StatusCode::OK, get("/custom/metrics").await.unwrap().status());
        assert_eq!(StatusCode::NOT_FOUND, get("/metrics").await.unwrap().status());
        assert_eq!(StatusCode::OK, get("/health").await.unwrap().status());
        assert_eq!(StatusCode::OK, get("/ready").await.unwrap().status());

        let res = get("/weather/New%20York").await.unwrap();
        assert_eq!(StatusCode::OK, res.status());
        let obs: Observation = res.json().await.unwrap();
        assert_eq!("New York", obs.city);
    }
}
