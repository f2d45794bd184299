use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use edgeguard::config::{EdgeguardConfig, LoggingConfig};
use edgeguard::gateway::Gateway;
use edgeguard::quota::QuotaBackend;
use edgeguard::rules::SignatureVerifier;
use edgeguard::sidecar::SidecarServer;

/// Edge admission control for API keys and client addresses.
#[derive(Debug, Parser)]
#[command(name = "edgeguard", version, about)]
struct Cli {
    /// Settings file (YAML, TOML or JSON); EDGEGUARD__* variables override it
    #[arg(short, long, global = true, env = "EDGEGUARD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Answer admission queries line by line on stdin/stdout
    Serve,
    /// Decide a single request and print the decision
    Check {
        /// API key presented by the client
        #[arg(long)]
        key: String,
        /// Client address
        #[arg(long)]
        ip: String,
    },
    /// Load every rule source and print what would be published
    Validate,
    /// Append or replace the signature trailer of a rule file
    Sign {
        /// File to sign in place
        file: PathBuf,
    },
    /// Check the signature trailer of a rule file
    Verify {
        /// File to check
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = EdgeguardConfig::load(cli.config.as_deref()).context("loading settings")?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Check { key, ip } => {
            let gateway = Gateway::from_config(&config)?;
            let decision = gateway.decide(&key, &ip).await;
            println!("{}", serde_json::to_string_pretty(&decision)?);
            Ok(())
        }
        Commands::Validate => {
            let gateway = Gateway::from_config(&config)?;
            println!("{}", serde_json::to_string_pretty(&gateway.rules().report())?);
            Ok(())
        }
        Commands::Sign { file } => {
            let verifier = verifier_for(&config)?;
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let sealed = verifier.seal(&text);
            std::fs::write(&file, &sealed).with_context(|| format!("writing {}", file.display()))?;
            let body = edgeguard::rules::Artifact::parse(&sealed).body();
            println!("{}", verifier.sign(body.as_bytes()));
            Ok(())
        }
        Commands::Verify { file } => {
            let verifier = verifier_for(&config)?;
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            verifier.open(&file.display().to_string(), &text, true)?;
            println!("{}: signature ok", file.display());
            Ok(())
        }
    }
}

async fn serve(config: EdgeguardConfig) -> anyhow::Result<()> {
    info!("Starting Edgeguard admission sidecar");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let gateway = Arc::new(Gateway::from_config(&config)?);
    info!(
        keys_path = %config.sources.keys_path.display(),
        blocklist_path = %config.sources.blocklist_path.display(),
        window = ?config.rate_limiting.window,
        store = ?config.storage.backend,
        "Configuration loaded"
    );

    #[cfg(unix)]
    spawn_hangup_reload(gateway.clone())?;

    let server = SidecarServer::new(gateway).with_intervals(&config.rate_limiting);
    server
        .serve_with_shutdown(tokio::io::stdin(), tokio::io::stdout(), shutdown_signal())
        .await?;

    info!("Edgeguard admission sidecar stopped");
    Ok(())
}

fn verifier_for(config: &EdgeguardConfig) -> anyhow::Result<SignatureVerifier> {
    config.validate()?;
    let Some(secret) = config.signing_secret() else {
        bail!("no signing secret configured (set EDGEGUARD__SIGNING__SECRET)");
    };
    Ok(SignatureVerifier::new(secret)?)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // Stdout carries the sidecar protocol, so logs go to stderr.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Reload rules whenever the process receives SIGHUP.
#[cfg(unix)]
fn spawn_hangup_reload(gateway: Arc<Gateway<QuotaBackend>>) -> anyhow::Result<()> {
    let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())
        .context("installing SIGHUP handler")?;

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("Received SIGHUP, reloading rules");
            let gateway = gateway.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || gateway.reload()).await {
                error!(error = %e, "Reload task failed");
            }
        }
    });
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
