use std::error::Error;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use actix_web::{middleware, rt, web, App, HttpServer};
use git_version::git_version;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use eventrelay_lib::config::RelayConfig;
use eventrelay_lib::kafka::{KafkaSender, KafkaSource, KafkaTelemetryExporter};
use eventrelay_lib::stream::StreamConsumerLoop;
use eventrelay_lib::telemetry::{BufferedTelemetrySink, DisabledTelemetry, Telemetry, TelemetrySink};
use eventrelay_lib::util::Metrics;

use crate::handler::ConsoleRelay;
use crate::util::serve_metrics;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_VERSION: &str = git_version!(fallback = "unknown");

mod handler;
mod util;

fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    // a missing .env file is fine, the environment may be set up already
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("eventrelay v{} ({}) initializing!", VERSION, GIT_VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("RelayPool")
        .build()?;
    let result = runtime.block_on(async_main());

    if result.is_ok() {
        info!("Relay main loop exited gracefully, giving the last tasks 30 seconds to finish cleaning up");
        runtime.shutdown_timeout(Duration::from_secs(30));
        info!("Shutdown complete!");
        return Ok(());
    }

    result
}

async fn async_main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = RelayConfig::from_env()?;
    let settings = config.kafka_settings()?;
    let metrics = Arc::new(Metrics::new(&config.consumer_group));

    let sink: Arc<dyn TelemetrySink> = match &config.telemetry_topic {
        Some(topic) => {
            info!("Exporting telemetry to '{}'", topic);
            let exporter = KafkaTelemetryExporter::new(
                KafkaSender::new(&settings)?,
                topic.as_str(),
                config.telemetry_key.as_str(),
            );
            Arc::new(BufferedTelemetrySink::new(exporter, config.telemetry_buffer).with_metrics(metrics.clone()))
        }
        None => {
            info!("No telemetry topic configured, traces only go to the log");
            Arc::new(DisabledTelemetry)
        }
    };

    let handler = match &config.forward_topic {
        Some(topic) => {
            info!("Forwarding messages to '{}'", topic);
            ConsoleRelay::forwarding(KafkaSender::new(&settings)?, topic.as_str())
        }
        None => ConsoleRelay::default(),
    };
    let source = KafkaSource::new(settings, config.source_options());
    let consumer = StreamConsumerLoop::new(Telemetry::new(sink), metrics.clone(), config.consumer_options());

    let shutdown = CancellationToken::new();
    let server_shutdown = shutdown.clone();
    let bind = config.metrics_bind.clone();
    // start webserver on different thread
    thread::spawn(move || {
        let sys = rt::System::new();

        let server = HttpServer::new(move || {
            App::new()
                .app_data(metrics.clone())
                .wrap(middleware::Logger::default())
                .route("/metrics", web::get().to(serve_metrics))
        })
        .bind(&bind);

        let server = match server {
            Ok(server) => server,
            Err(e) => {
                error!("Unable to serve metrics on {}: {}", bind, e);
                return;
            }
        };

        // this is just metrics, doesn't need to be able to handle much at all
        if let Err(e) = sys.block_on(server.workers(1).run()) {
            error!("Metrics server failed: {}", e);
        }

        // actix stops on SIGTERM with its own signal handlers, take the relay down along with it
        server_shutdown.cancel();
    });

    consumer
        .start(
            &config.stream_name,
            &config.consumer_group,
            Arc::new(source),
            Arc::new(handler),
        )
        .await?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
            info!("Received Ctrl+C, stopping the relay...");
        }
        _ = shutdown.cancelled() => info!("Metrics server stopped, stopping the relay..."),
    }

    consumer.stop().await;

    Ok(())
}
