use clap::Parser;
use eyre::format_err;
use log::{error, info};
use std::process::exit;
use std::sync::Arc;
use tokio::{
    select,
    signal::unix::{SignalKind, signal},
    sync::watch,
};

use knpd::backend::{KernelBackend, Recorder, System, detect_dialect};
use knpd::{Dataplane, desired::DesiredState, reconcile};

pub mod config;

/// Kubernetes NetworkPolicy dataplane
#[derive(Parser)]
#[command(version, about, long_about = ABOUT)]
struct Cli {
    /// log filters (see https://docs.rs/env_logger/latest/env_logger/index.html#enabling-logging)
    #[arg(long, default_value = "info", env = "KNPD_LOG")]
    log: String,
    /// log style (see https://docs.rs/env_logger/latest/env_logger/index.html#disabling-colors)
    #[arg(long, default_value = "auto", env = "KNPD_LOG_STYLE")]
    log_style: String,

    /// my node name (hint: {valueFrom: {fieldRef: { fieldPath: spec.nodeName }}})
    #[arg(
        long,
        env = "NODE_NAME",
        default_value_t = default_nodename()
    )]
    node_name: String,

    /// Config file path.
    #[arg(long, short = 'c', default_value = "config.yaml")]
    config: String,

    /// Test the config and exit.
    #[arg(long)]
    test_config: bool,

    /// Log the ipset and iptables calls instead of running them.
    #[arg(long)]
    dry_run: bool,
}

const ABOUT: &str = r#"
Kubernetes NetworkPolicy dataplane

Program network policies on the node with ipset and iptables:
- sets of pods, namespaces and CIDRs, reference counted
- one chain per policy and direction, behind a jump from FORWARD
- periodic repair of what other agents change
"#;

fn default_nodename() -> String {
    gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|s| s.to_string_lossy().into_owned())
}

type Tasks = tokio::task::JoinSet<(String, eyre::Result<()>)>;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    env_logger::builder()
        .parse_filters(cli.log.as_str())
        .parse_write_style(cli.log_style.as_str())
        .format_timestamp_millis()
        .init();

    use config::*;
    let config = tokio::fs::read(&cli.config)
        .await
        .map_err(|e| format_err!("read config failed: {}: {e}", cli.config))?;
    let config: Config =
        serde_yaml::from_slice(&config).map_err(|e| format_err!("parse config failed: {e}"))?;

    let desired = match &config.desired_state {
        None => None,
        Some(path) => Some(
            DesiredState::load(path)
                .map_err(|e| format_err!("load desired state failed: {e}"))?,
        ),
    };

    if cli.test_config {
        return Ok(());
    }

    info!(
        "knpd {} ({}) starting as node {}",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT"),
        cli.node_name
    );

    let backend: Arc<dyn KernelBackend> = if cli.dry_run {
        info!("dry run: kernel calls are only logged");
        Arc::new(Recorder::dry_run())
    } else {
        let dialect = match config.dataplane.dialect {
            Some(dialect) => dialect,
            None => detect_dialect().map_err(|e| format_err!("iptables detection failed: {e}"))?,
        };
        info!("using iptables {dialect:?}");
        Arc::new(System::new(dialect, config.dataplane.lock_wait))
    };

    let dataplane = Arc::new(Dataplane::new(backend, &config.dataplane));

    let dp = dataplane.clone();
    tokio::task::spawn_blocking(move || -> eyre::Result<()> {
        dp.bootup()
            .map_err(|e| format_err!("dataplane bootup failed: {e}"))?;
        if let Some(desired) = desired {
            desired
                .apply(&dp)
                .map_err(|e| format_err!("apply desired state failed: {e}"))?;
        }
        Ok(())
    })
    .await??;

    let (stop_tx, stop_rx) = watch::channel(false);

    let mut tasks = Tasks::new();
    tasks.spawn(async move {
        let period = config.reconcile_interval();
        reconcile::run(dataplane, period, stop_rx).await;
        ("reconcile".to_string(), Ok(()))
    });

    select! {
        sig = shutdown_signal() => {
            info!("received {}, stopping", sig?);
            // no receiver left means the loop is already gone
            let _ = stop_tx.send(true);
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    error!("task wait failed: {e}");
                }
            }
            exit(0);
        }
        Some(res) = tasks.join_next() => {
            match res {
                Err(e) => error!("task wait failed: {e}"),
                Ok((name, Ok(_))) => error!("task {name} finished unexpectedly"),
                Ok((name, Err(e))) => error!("task {name} finished with error: {e}"),
            }
            exit(1);
        }
    }
}

async fn shutdown_signal() -> eyre::Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    Ok(select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}
