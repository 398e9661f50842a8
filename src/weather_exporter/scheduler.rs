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

use crate::client::{ClientError, Observation, WeatherProvider};
use crate::config::{CityConfig, ScrapingConfig};
use crate::metrics::{Outcome, WeatherMetrics};
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, Level};

/// A city to fetch weather for on every collection cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
}

impl Target {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Target { name: name.into() }
    }
}

impl From<&CityConfig> for Target {
    fn from(city: &CityConfig) -> Self {
        Target::new(city.name.clone())
    }
}

/// How failed requests for a single target are retried within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one fails.
    pub attempts: u32,
    /// Time to wait between attempts.
    pub delay: Duration,
    /// No retry is started if it would begin after this much time has passed since
    /// the first attempt started.
    pub budget: Duration,
}

impl RetryPolicy {
    /// Make a single attempt per target, never retry.
    pub fn none() -> Self {
        RetryPolicy {
            attempts: 0,
            delay: Duration::ZERO,
            budget: Duration::ZERO,
        }
    }

    fn should_retry(&self, err: &ClientError, retries: u32, elapsed: Duration) -> bool {
        retries < self.attempts && err.is_retryable() && elapsed.saturating_add(self.delay) < self.budget
    }
}

impl From<&ScrapingConfig> for RetryPolicy {
    fn from(cfg: &ScrapingConfig) -> Self {
        RetryPolicy {
            attempts: cfg.retry_attempts,
            delay: cfg.retry_delay(),
            budget: cfg.timeout(),
        }
    }
}

/// Number of targets that were and weren't fetched during a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub succeeded: usize,
    pub failed: usize,
}

/// Periodically fetch weather for every target and publish the results as metrics.
///
/// Each cycle fetches all targets concurrently and completes once every target has
/// either succeeded or failed. A failure for one target is logged and counted but
/// never affects any other target.
#[derive(Debug)]
pub struct Scheduler {
    provider: Arc<dyn WeatherProvider>,
    metrics: Arc<WeatherMetrics>,
    targets: Vec<Target>,
    interval: Duration,
    retry: RetryPolicy,
}

impl Scheduler {
    pub fn new(
        provider: Arc<dyn WeatherProvider>,
        metrics: Arc<WeatherMetrics>,
        targets: Vec<Target>,
        interval: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Scheduler {
            provider,
            metrics,
            targets,
            interval,
            retry,
        }
    }

    /// Run a cycle immediately and then once per interval until `shutdown` becomes `true`
    /// or its sender is dropped.
    ///
    /// A tick that fires while the previous cycle is still running is skipped. When
    /// shutdown is requested, this method returns without waiting for a running cycle,
    /// which is left to finish in the background.
    ///
    /// # Panics
    ///
    /// If the interval is zero.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<JoinHandle<CycleSummary>> = None;

        tracing::info!(
            message = "weather polling started",
            provider = %self.provider.name(),
            targets = self.targets.len(),
            interval_secs = self.interval.as_secs(),
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }

                    continue;
                }
                _ = interval.tick() => {}
            }

            if let Some(handle) = &in_flight {
                if !handle.is_finished() {
                    tracing::warn!(
                        message = "previous collection cycle still running, skipping",
                        interval_secs = self.interval.as_secs(),
                    );
                    continue;
                }
            }

            let scheduler = Arc::clone(&self);
            in_flight = Some(tokio::spawn(async move { scheduler.run_cycle().await }));
        }

        tracing::info!(message = "weather polling stopped");
    }

    /// Fetch and publish weather for every target, returning once all of them are done.
    pub async fn run_cycle(self: &Arc<Self>) -> CycleSummary {
        let start = Instant::now();
        let handles: Vec<JoinHandle<Outcome>> = self
            .targets
            .iter()
            .cloned()
            .map(|target| {
                let scheduler = Arc::clone(self);
                let span = tracing::span!(Level::DEBUG, "weather_collect", city = %target.name);
                tokio::spawn(async move { scheduler.collect(&target).await }.instrument(span))
            })
            .collect();

        let mut summary = CycleSummary::default();
        for handle in handles {
            match handle.await {
                Ok(Outcome::Success) => summary.succeeded += 1,
                Ok(Outcome::Error) => summary.failed += 1,
                Err(e) => {
                    tracing::error!(message = "collection task did not complete", error = %e);
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            message = "collection cycle complete",
            succeeded = summary.succeeded,
            failed = summary.failed,
            elapsed_millis = start.elapsed().as_millis() as u64,
        );

        summary
    }

    async fn collect(&self, target: &Target) -> Outcome {
        let provider = self.provider.name();
        let started = Instant::now();

        // A panicking provider still has to count as exactly one failed request.
        let (res, elapsed) = match AssertUnwindSafe(self.fetch(target)).catch_unwind().await {
            Ok(fetched) => fetched,
            Err(panic) => {
                self.metrics.record_request(provider, Outcome::Error, started.elapsed());
                tracing::error!(
                    message = "weather request panicked",
                    city = %target.name,
                    error = %panic_message(panic.as_ref()),
                );
                return Outcome::Error;
            }
        };

        match res {
            Ok(obs) => {
                self.metrics.publish(&obs, provider);
                self.metrics.record_request(provider, Outcome::Success, elapsed);
                tracing::debug!(
                    message = "fetched current weather",
                    city = %obs.city,
                    country = %obs.country,
                    condition = %obs.condition,
                );
                Outcome::Success
            }
            Err(e) => {
                self.metrics.record_request(provider, Outcome::Error, elapsed);
                tracing::error!(message = "failed to fetch current weather", city = %target.name, error = %e);
                Outcome::Error
            }
        }
    }

    /// Fetch weather for the target, retrying per the retry policy. The returned duration
    /// is the time spent making requests and excludes any delay between attempts.
    async fn fetch(&self, target: &Target) -> (Result<Observation, ClientError>, Duration) {
        let started = Instant::now();
        let mut requesting = Duration::ZERO;
        let mut retries = 0;

        loop {
            let attempt = Instant::now();
            let res = self.provider.fetch_by_name(&target.name).await;
            requesting += attempt.elapsed();

            match res {
                Err(e) if self.retry.should_retry(&e, retries, started.elapsed()) => {
                    retries += 1;
                    tracing::warn!(
                        message = "retrying failed weather request",
                        city = %target.name,
                        retry = retries,
                        error = %e,
                    );
                    tokio::time::sleep(self.retry.delay).await;
                }
                res => return (res, requesting),
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
