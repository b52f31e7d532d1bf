//! interfero-agent - per-node CPU schedule latency agent
//!
//! The agent runs on each Kubernetes node and:
//! - Watches the node object and the pods scheduled to it
//! - Periodically traces the scheduler for one time window
//! - Exposes per-container latency on a Prometheus endpoint

use anyhow::Result;

#[cfg(not(target_os = "linux"))]
fn main() -> Result<()> {
    eprintln!("Error: interfero-agent requires Linux to trace the kernel scheduler");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> Result<()> {
    use anyhow::Context;
    use clap::Parser;
    use interfero::metrics::{AgentMetrics, PrometheusExporter};
    use interfero_agent::config::{Cli, Configuration};
    use interfero_agent::daemon::Daemon;
    use interfero_agent::sched_latency::AyaSessionOpener;
    use log::{error, info};
    use std::sync::Arc;
    use tokio::signal;
    use tokio::signal::unix::{signal as unix_signal, SignalKind};
    use tokio_util::sync::CancellationToken;

    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    info!("interfero-agent {} starting...", interfero::VERSION);

    let config = Arc::new(Configuration::from_cli(&cli)?);
    let metrics = Arc::new(AgentMetrics::new(&config.node_name)?);

    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        let mut sigterm = unix_signal(SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        tokio::spawn(async move {
            tokio::select! {
                _ = signal::ctrl_c() => info!("Shutdown signal received"),
                _ = sigterm.recv() => info!("SIGTERM received"),
            }
            stop.cancel();
        });
    }

    let opener = Arc::new(AyaSessionOpener::new(&config.btf_dir, &config.probe_path));
    let daemon = Daemon::new(config.clone(), metrics.clone(), opener)
        .await
        .context("Unable to set up interfero daemon")?;

    let ready = daemon.ready();
    let exporter = PrometheusExporter::new(metrics.registry().clone(), config.addr)
        .with_health(move || ready.is_ready());
    let mut exporter_task = {
        let stop = stop.clone();
        tokio::spawn(async move { exporter.serve(async move { stop.cancelled().await }).await })
    };

    info!("Starting the interfero daemon");
    let result = tokio::select! {
        result = daemon.run(stop.clone()) => result,
        served = &mut exporter_task => {
            match served {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(anyhow::Error::new(e).context("Prometheus exporter failed")),
                Err(e) => Err(anyhow::anyhow!("Prometheus exporter panicked: {}", e)),
            }
        }
    };

    stop.cancel();
    if !exporter_task.is_finished() {
        if let Err(e) = exporter_task.await {
            error!("Prometheus exporter task failed: {}", e);
        }
    }

    info!("interfero-agent stopped");
    result
}
