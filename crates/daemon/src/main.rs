//! renewd - Main entry point
//!
//! Certificate lifecycle daemon: issues, renews and publishes TLS certificates.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use renewd::{
    BundlePublisher, BundleSink, CertificateObserver, ChallengeResponder, ChallengeServer,
    EngineSettings, FileSink, FileStore, ListenerCertificate, Metrics, RenewalEngine,
    SourceRegistry,
};
use renewd_config::Config;

/// renewd - certificate lifecycle daemon
#[derive(Parser, Debug)]
#[command(name = "renewd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "RENEWD_CONFIG")]
    config: PathBuf,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long = "log-json")]
    log_json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

    if cli.test {
        return test_config(&cli.config);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run(&cli.config))
}

fn init_logging(verbose: bool, json: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Test configuration file and exit
fn test_config(path: &std::path::Path) -> Result<()> {
    info!("Testing configuration file: {}", path.display());
    let config = Config::from_file(path).context("Configuration validation failed")?;

    info!("Configuration test successful:");
    info!("  - {} source(s)", config.sources.len());
    info!("  - {} bundle sink(s)", config.output.bundles.len());

    println!(
        "renewd: configuration file {} test is successful",
        path.display()
    );
    Ok(())
}

/// Build every component and run until interrupted
async fn run(config_path: &std::path::Path) -> Result<()> {
    info!("Loading configuration from: {}", config_path.display());
    let config = Config::from_file(config_path).context("Failed to load configuration file")?;

    let settings = EngineSettings::from_config(&config)?;
    let metrics = Metrics::new().context("Failed to register metrics")?;
    let bridge = ChallengeResponder::new();

    let sources = SourceRegistry::from_config(&config, &bridge)?;
    let store = Arc::new(
        FileStore::new(&config.storage.path).context("Failed to open certificate store")?,
    );

    let listener_cert = ListenerCertificate::new(settings.our_hostname.clone());
    let sinks: Vec<Arc<dyn BundleSink>> = config
        .output
        .bundles
        .iter()
        .map(|bundle| Arc::new(FileSink::new(&bundle.path)) as Arc<dyn BundleSink>)
        .collect();
    let bundles = Arc::new(BundlePublisher::new(settings.our_hostname.clone(), sinks));

    let observers: Vec<Arc<dyn CertificateObserver>> = vec![
        Arc::new(listener_cert.clone()) as Arc<dyn CertificateObserver>,
        Arc::clone(&bundles) as Arc<dyn CertificateObserver>,
    ];

    let engine = Arc::new(RenewalEngine::new(
        settings,
        sources,
        store,
        observers,
        metrics.clone(),
    )?);

    let responder = Arc::new(ChallengeServer::new(
        bridge,
        metrics,
        config.servers.admin.external_url.clone(),
    ));
    let responder_addr = config.responder_addr()?;
    let responder_task = tokio::spawn(responder.serve(responder_addr));

    let bundle_task = tokio::spawn(Arc::clone(&bundles).run());
    let (scan_task, publish_task) = engine.spawn();

    info!("renewd started");

    tokio::select! {
        result = responder_task => {
            match result {
                Ok(Ok(())) => info!("Challenge responder stopped"),
                Ok(Err(e)) => {
                    error!(error = %e, "Challenge responder failed");
                    return Err(e).context("Challenge responder failed");
                }
                Err(e) => error!(error = %e, "Challenge responder task panicked"),
            }
        }
        () = shutdown_signal() => {}
    }

    info!("Shutting down");
    scan_task.abort();
    publish_task.abort();
    bundle_task.abort();

    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
        info!("Received SIGINT");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
