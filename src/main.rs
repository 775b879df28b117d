use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use consular::config::{Config, Mode};
use consular::consul::ConsulClient;
use consular::http;
use consular::marathon::MarathonClient;
use consular::server;
use consular::sync::Syncer;

fn init_tracing(debug: bool) {
    // DEBUG turns on per-request logging; RUST_LOG still wins when set.
    let default_filter = if debug { "info,consular=debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {}", err);
            std::process::exit(1);
        }
    };

    init_tracing(config.debug);

    let client = http::build_client()?;
    let marathon = Arc::new(MarathonClient::new(
        &config.marathon_endpoint,
        client.clone(),
        config.default_timeout,
    ));
    let consul = Arc::new(ConsulClient::new(
        &config.consul_endpoint,
        client,
        config.default_timeout,
        config.agent_timeout,
        config.enable_fallback,
    ));
    let syncer = Arc::new(Syncer::new(
        marathon.clone(),
        consul,
        config.registration_id.clone(),
    ));

    match config.mode {
        Mode::Sync => {
            info!(purge = config.purge, "running one-shot sync");
            if let Err(err) = syncer.sync_apps(config.purge).await {
                error!(error = %err, "sync failed");
                std::process::exit(1);
            }
            info!("sync complete");
        }
        Mode::Serve => {
            if let Some(interval) = config.sync_interval {
                let syncer = syncer.clone();
                let purge = config.purge;
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    loop {
                        ticker.tick().await;
                        if let Err(err) = syncer.sync_apps(purge).await {
                            error!(error = %err, "periodic sync failed");
                        }
                    }
                });
            }

            // A failed registration is not fatal: the periodic sync keeps
            // the catalog converging even without events.
            let events_url = config.events_url();
            match marathon.register_event_callback(&events_url).await {
                Ok(true) => {}
                Ok(false) => error!(events_url = %events_url, "Marathon rejected the event callback"),
                Err(err) => error!(error = %err, "event callback registration failed"),
            }

            let addr: SocketAddr = (config.host.as_str(), config.port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| format!("cannot resolve listen address {}:{}", config.host, config.port))?;
            let (local_addr, serve) = server::bind(&addr, syncer)?;
            info!(addr = %local_addr, events_url = %events_url, "listening for Marathon events");
            serve.await?;
        }
    }

    Ok(())
}
