use anyhow::Context;
use clap::Parser;
use mail_gateway::authentication::TrustDnsResolver;
use mail_gateway::config::{Config, LoggingConfig};
use mail_gateway::security::TlsConfig;
use mail_gateway::services::{AbuseIpDbClient, VirusTotalClient};
use mail_gateway::smtp::SmtpServer;
use mail_gateway::storage::InMemoryMailStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Parser)]
#[command(name = "mail-gateway")]
#[command(about = "Inbound SMTP gateway with authentication and content checks", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./config.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(&path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => Config::from_file(DEFAULT_CONFIG_PATH)
            .with_context(|| format!("loading configuration from {}", DEFAULT_CONFIG_PATH))?,
        None => Config::default(),
    };
    config.apply_env();
    Ok(config)
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    match logging.format.as_str() {
        "json" => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        "compact" => registry.with(tracing_subscriber::fmt::layer().compact()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;
    init_logging(&config.logging);

    info!("Starting mail-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("  SMTP listening on: {}", config.smtp.listen_addr);
    info!("  Domain: {}", config.server.domain);
    info!("  Known recipients: {}", config.directory.recipients.len());
    if config.reputation.api_key.is_empty() || config.scanner.api_key.is_empty() {
        warn!("Reputation or scanner API key is empty; those checks will fail closed");
    }
    if let Some(domain) = &config.validation.bypass_domain {
        warn!(%domain, "SPF/DKIM bypass domain is configured");
    }

    let tls_config = TlsConfig::from_smtp_config(&config.smtp)
        .context("loading STARTTLS certificate")?
        .map(Arc::new);
    if tls_config.is_none() {
        info!("No TLS material configured, STARTTLS disabled");
    }

    let service = mail_gateway::build_mail_service(
        &config,
        Arc::new(TrustDnsResolver::new()),
        Arc::new(AbuseIpDbClient::new(config.reputation.clone()).context("building reputation client")?),
        Arc::new(VirusTotalClient::new(config.scanner.clone()).context("building scanner client")?),
        Arc::new(InMemoryMailStore::new()),
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C");
                signal_token.cancel();
            }
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
    });

    let server = SmtpServer::new(&config, service, tls_config);
    server.run(shutdown).await.context("SMTP server failed")?;

    info!("mail-gateway stopped");
    Ok(())
}
