use crate::config::Config;
use crate::error::Result;
use crate::security::TlsConfig;
use crate::service::MailService;
use crate::smtp::session::{SessionSettings, SmtpSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Accept loop: one task per connection until the shutdown token fires,
/// then a bounded grace period for open sessions.
pub struct SmtpServer {
    listen_addr: String,
    settings: SessionSettings,
    service: Arc<MailService>,
    tls_config: Option<Arc<TlsConfig>>,
    shutdown_grace: Duration,
}

impl SmtpServer {
    pub fn new(
        config: &Config,
        service: Arc<MailService>,
        tls_config: Option<Arc<TlsConfig>>,
    ) -> Self {
        Self {
            listen_addr: config.smtp.listen_addr.clone(),
            settings: SessionSettings {
                hostname: config.server.hostname.clone(),
                max_message_size: config.smtp.max_message_size,
                max_recipients: config.smtp.max_recipients,
            },
            service,
            tls_config,
            shutdown_grace: Duration::from_secs(config.smtp.shutdown_grace_secs),
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!("SMTP server listening on {}", self.listen_addr);
        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        info!("New SMTP connection from {}", addr);
                        let session = SmtpSession::new(
                            self.settings.clone(),
                            self.service.clone(),
                            self.tls_config.clone(),
                        );
                        sessions.spawn(async move {
                            if let Err(e) = session.handle(socket).await {
                                error!("Session error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = finished {
                        error!("Session task failed: {}", e);
                    }
                }
            }
        }
        drop(listener);

        if sessions.is_empty() {
            return Ok(());
        }

        info!(
            open = sessions.len(),
            grace_secs = self.shutdown_grace.as_secs(),
            "Waiting for open sessions"
        );
        let drained = timeout(self.shutdown_grace, async {
            while let Some(finished) = sessions.join_next().await {
                debug!(ok = finished.is_ok(), "Session finished during shutdown");
            }
        })
        .await;

        if drained.is_err() {
            warn!(open = sessions.len(), "Grace period elapsed, aborting sessions");
            sessions.shutdown().await;
        }

        Ok(())
    }
}
