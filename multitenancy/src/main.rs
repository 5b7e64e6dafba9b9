#[macro_use]
extern crate log;

use std::net::SocketAddr;

use kube::Client;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

mod collections;
mod dynamic_informer_controller;
mod errors;
mod manager;
#[cfg(test)]
mod mock_api;
mod model;
mod namespace_controller;
mod prometheus_exporter;
mod tenant_resource_controller;

use manager::Manager;
use prometheus_exporter::start_prometheus_metrics_server;

/// The K8s field manager name.
pub(crate) const MANAGER: &'static str = "multitenancy-controller";

#[derive(Clone)]
struct Configuration {
    metrics_addr: SocketAddr,
}

impl Configuration {
    fn from_env() -> anyhow::Result<Self> {
        let metrics_addr = env_var("METRICS_ADDR")
            .unwrap_or_else(|| "0.0.0.0:9000".to_string())
            .parse()?;
        Ok(Configuration { metrics_addr })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let configuration = Configuration::from_env()?;

    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
    opentelemetry::global::set_meter_provider(provider);
    let listener = TcpListener::bind(configuration.metrics_addr).await?;
    let metrics_server = start_prometheus_metrics_server(listener, registry);

    let client = Client::try_default().await?;
    let stop = CancellationToken::new();
    let manager = Manager::new(client, stop.child_token());
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if manager.wait_until_synced(&stop).await {
                info!("all collections synced");
            }
        });
    }

    info!("running controllers ...");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
        res = metrics_server => {
            if let Err(e) = res {
                error!("metrics server failed: {}", e);
            }
        }
    }
    stop.cancel();
    Ok(())
}
