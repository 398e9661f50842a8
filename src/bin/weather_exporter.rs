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

use clap::Parser;
use reqwest::Client;
use std::error::Error;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use weather_exporter::client::{OpenWeatherClient, WeatherProvider};
use weather_exporter::config::{Config, LogFormat, LogOutput, LoggingConfig};
use weather_exporter::http::RequestContext;
use weather_exporter::metrics::WeatherMetrics;
use weather_exporter::scheduler::{RetryPolicy, Scheduler, Target};

const DEFAULT_CONFIG_PATH: &str = "weather_exporter.toml";

#[derive(Debug, Parser)]
#[clap(name = "weather_exporter", version = clap::crate_version!())]
struct WeatherExporterApplication {
    /// Path to a TOML config file. The file doesn't need to exist, every setting except
    /// the API key has a default and all of them can be set with environment variables.
    #[clap(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let opts = WeatherExporterApplication::parse();
    let cfg = Config::load(&opts.config).unwrap_or_else(|e| {
        // Logging is configured by the file we just failed to load so use a basic stderr logger.
        let subscriber = tracing_subscriber::fmt().with_writer(io::stderr).finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(message = "unable to load configuration", path = %opts.config.display(), error = %e);
        });

        process::exit(1)
    });

    init_logging(&cfg.logging)?;

    let http_client = Client::builder()
        .timeout(cfg.weather.timeout())
        .build()
        .unwrap_or_else(|e| {
            tracing::error!(message = "unable to initialize HTTP client", error = %e);
            process::exit(1)
        });

    let client = OpenWeatherClient::new(http_client, cfg.weather.url()?, &cfg.weather.api_key).unwrap_or_else(|e| {
        tracing::error!(message = "unable to initialize weather client", error = %e);
        process::exit(1)
    });

    let provider: Arc<dyn WeatherProvider> = Arc::new(client);
    let metrics = Arc::new(WeatherMetrics::default());
    let targets: Vec<Target> = cfg.cities.iter().map(Target::from).collect();
    tracing::info!(
        message = "configuration loaded",
        path = %opts.config.display(),
        cities = ?targets.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Arc::new(Scheduler::new(
        provider.clone(),
        metrics.clone(),
        targets,
        cfg.scraping.interval(),
        RetryPolicy::from(&cfg.scraping),
    ));
    tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let context = Arc::new(RequestContext::new(metrics, provider, cfg.server.request_timeout()));
    let app = weather_exporter::http::router(context, &cfg.server);
    let bind = SocketAddr::from(([0, 0, 0, 0], cfg.server.port));
    let server = axum::Server::try_bind(&bind)
        .unwrap_or_else(|e| {
            tracing::error!(message = "error binding to address", address = %bind, error = %e);
            process::exit(1)
        })
        .serve(app.into_make_service());

    let address = server.local_addr();
    let mut draining = shutdown_rx.clone();
    let server = server.with_graceful_shutdown(async move {
        let _ = draining.changed().await;
    });

    tokio::spawn(async move {
        // Wait for either SIGTERM or SIGINT to shutdown
        tokio::select! {
            _ = sigterm() => {}
            _ = sigint() => {}
        }

        tracing::info!(message = "shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    // In-flight requests get a bounded amount of time to finish once shutdown starts
    let shutdown_timeout = cfg.server.shutdown_timeout();
    let mut expiring = shutdown_rx;
    let deadline = async move {
        let _ = expiring.changed().await;
        tokio::time::sleep(shutdown_timeout).await;
    };

    tracing::info!(message = "server started", address = %address);

    tokio::select! {
        res = server => res?,
        _ = deadline => {
            tracing::warn!(
                message = "requests still in flight after shutdown timeout",
                timeout_secs = shutdown_timeout.as_secs(),
            );
        }
    }

    tracing::info!("server shutdown");
    Ok(())
}

fn init_logging(cfg: &LoggingConfig) -> Result<(), Box<dyn Error + Send + Sync>> {
    let writer = match cfg.output {
        LogOutput::Stdout => BoxMakeWriter::new(io::stdout),
        LogOutput::Stderr => BoxMakeWriter::new(io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_max_level(cfg.max_level()?)
        .with_writer(writer);

    match cfg.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
    }

    Ok(())
}

/// Return after the first SIGTERM signal received by this process
async fn sigterm() -> io::Result<()> {
    unix::signal(SignalKind::terminate())?.recv().await;
    Ok(())
}

/// Return after the first SIGINT signal received by this process
async fn sigint() -> io::Result<()> {
    unix::signal(SignalKind::interrupt())?.recv().await;
    Ok(())
}
