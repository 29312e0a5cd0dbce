mod cli;
mod codec;
mod config;
mod error;
mod frame;
mod geo;
mod id_alloc;
mod ingest;
mod link;
mod mqtt;
mod relay;
mod session;

use crate::cli::{Args, Command};
use crate::config::Config;
use crate::id_alloc::HttpIdAllocator;
use crate::ingest::Ingestor;
use crate::link::{spawn_link_thread, SerialLink};
use crate::mqtt::MqttRelay;
use crate::session::{PgSessionStore, SessionService};
use anyhow::{Context, Result};
use clap::Parser;

/// Console logs always; spans also go to the OTLP collector when
/// `LAUNCH_OTLP_ENDPOINT` is set.
fn init_tracing(config: &Config) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,launch_sidecar=info".into());
    let otel_layer = match config.otlp_endpoint.as_deref().map(otlp_traces_url) {
        Some(url) if !url.is_empty() => {
            Some(tracing_opentelemetry::layer().with_tracer(otlp_tracer(url)?))
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true),
        )
        .with(otel_layer)
        .try_init()?;
    Ok(())
}

fn otlp_tracer(url: String) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as TraceConfig, Resource};

    let resource = Resource::new(vec![KeyValue::new("service.name", "launch-sidecar")]);
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().http().with_endpoint(url))
        .with_trace_config(TraceConfig::default().with_resource(resource))
        .install_batch(Tokio)?;
    Ok(tracer)
}

/// Collector base URLs get the OTLP/HTTP traces path appended.
fn otlp_traces_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    match endpoint {
        "" => String::new(),
        _ if endpoint.ends_with("/v1/traces") => endpoint.to_string(),
        _ => format!("{}/v1/traces", endpoint.trim_end_matches('/')),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        futures::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

async fn run_ingest(config: Config) -> Result<()> {
    let serial = SerialLink::new(&config.serial_port, config.baudrate);
    let link = tokio::task::spawn_blocking(move || spawn_link_thread(serial))
        .await
        .context("radio link setup task failed")?
        .with_context(|| format!("failed to open radio link on {}", config.serial_port))?;
    let (relay, relay_handle) = MqttRelay::connect(&config.mqtt_settings("ingest"))
        .await
        .context("failed to connect to the relay broker")?;

    let allocator = match config.id_api_url.as_deref() {
        Some(url) => Some(HttpIdAllocator::new(url).context("failed to build id allocator")?),
        None => {
            tracing::info!("LAUNCH_ID_API_URL not set; id requests will be dropped");
            None
        }
    };

    let ingestor = Ingestor::new(link.clone(), relay, allocator, config.ingest_settings());
    tokio::select! {
        _ = ingestor.run(shutdown_signal()) => {}
        res = relay_handle => {
            if let Err(err) = res { tracing::error!(error=%err, "relay publisher task failed"); }
        }
    }

    link.close().await;
    Ok(())
}

async fn run_track(config: Config) -> Result<()> {
    let store = PgSessionStore::connect(config.database_url()?, config.db_pool_size)
        .await
        .context("failed to connect to the session store")?;
    store
        .ensure_schema()
        .await
        .context("failed to prepare the session store schema")?;
    let subscription = mqtt::subscribe(&config.mqtt_settings("track"), &config.bus_channel)
        .await
        .context("failed to subscribe to the relay bus")?;

    let mut service = SessionService::new(config.session_settings(), store);
    session::run(&mut service, subscription, shutdown_signal()).await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::from_env()?;
    init_tracing(&config)?;

    match args.command {
        Command::Ingest => run_ingest(config).await,
        Command::Track => run_track(config).await,
    }
}
