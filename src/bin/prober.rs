use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use registry_prober::{
    Protocol,
    config::{Config, read_config_file},
    health::HealthMonitor,
    metrics::MetricsCollector,
    sequence::SequenceHandle,
};
use tokio::spawn;
use tracing::{debug, error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,

    /// Log a metrics snapshot every this many seconds (0 disables)
    #[arg(long, default_value_t = 60)]
    report_secs: u64,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("registry_prober", LevelFilter::TRACE),
        ("prober", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;
    config.validate()?;

    let metrics = Arc::new(MetricsCollector::new(config.sampling_ratio)?);
    let health = Arc::new(HealthMonitor::new(config.health_window, config.health_sla_ms));

    // every runner publishes its cycle results here
    let (event_tx, _) = tokio::sync::broadcast::channel(64);

    {
        let health = health.clone();
        let event_rx = event_tx.subscribe();
        spawn(async move { health.run(event_rx).await });
    }

    let runners = dispatch_runners(&config, &metrics, &event_tx)?;

    if args.report_secs > 0 {
        spawn(report_loop(
            metrics.clone(),
            health.clone(),
            runners.iter().map(|r| r.protocol).collect(),
            Duration::from_secs(args.report_secs),
        ));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    for runner in &runners {
        if let Err(e) = runner.shutdown().await {
            error!("{e:#}");
        }
    }

    Ok(())
}

fn dispatch_runners(
    config: &Config,
    metrics: &Arc<MetricsCollector>,
    event_tx: &tokio::sync::broadcast::Sender<registry_prober::ProbeEvent>,
) -> anyhow::Result<Vec<SequenceHandle>> {
    let mut runners = vec![];

    if let Some(whois) = &config.whois {
        debug!(
            "starting whois runner over {} targets every {}s",
            whois.targets.len(),
            whois.interval_secs
        );
        runners.push(SequenceHandle::spawn_whois(
            whois,
            metrics.clone(),
            event_tx.clone(),
        )?);
    }

    if let Some(epp) = &config.epp {
        debug!(
            "starting epp runner against {}:{} over {} targets every {}s",
            epp.host,
            epp.port,
            epp.targets.len(),
            epp.interval_secs
        );
        runners.push(SequenceHandle::spawn_epp(
            epp,
            metrics.clone(),
            event_tx.clone(),
        )?);
    }

    Ok(runners)
}

/// Periodically log every metric plus the liveness verdicts.
async fn report_loop(
    metrics: Arc<MetricsCollector>,
    health: Arc<HealthMonitor>,
    protocols: Vec<Protocol>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        for protocol in &protocols {
            info!(
                "{protocol}: live={}, last_cycle={:?}",
                health.is_live(*protocol),
                health.last_seen(*protocol)
            );
        }

        for snapshot in metrics.snapshot() {
            info!(
                "{}/{}/{}: count={} sampled={} mean_ms={:?}",
                snapshot.key.protocol,
                snapshot.key.action,
                snapshot.key.outcome,
                snapshot.count,
                snapshot.latency.count,
                snapshot.latency.mean_ms()
            );
        }
    }
}
