use crate::error::{GatewayError, Result};
use crate::mime::MimeParser;
use crate::models::Mail;
use crate::security::TlsConfig;
use crate::service::MailService;
use crate::smtp::commands::SmtpCommand;
use crate::utils::validate_email;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf,
};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tracing::{debug, error, info, warn};

/// Maximum line length in SMTP protocol (RFC 5321)
const MAX_LINE_LENGTH: usize = 1000;

/// Timeout for reading a command line
const COMMAND_TIMEOUT: Duration = Duration::from_secs(300); // 5 minutes

/// Timeout for reading DATA content
const DATA_TIMEOUT: Duration = Duration::from_secs(600); // 10 minutes

/// Maximum number of errors before disconnecting
const MAX_ERRORS: usize = 10;

/// Plain or TLS connection, so STARTTLS can swap the transport mid-session
enum SmtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    /// Placeholder while the handshake owns the socket
    Upgrading,
}

fn upgrading_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream is being upgraded to TLS")
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
            SmtpStream::Upgrading => Poll::Ready(Err(upgrading_error())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SmtpState {
    Fresh,
    Greeted,
    MailFrom,
    RcptTo,
    Data,
}

enum SessionResult {
    /// Restart command processing on the upgraded stream
    Continue,
    Quit,
}

/// What the DATA phase produced
enum DataOutcome {
    Complete(Vec<u8>),
    TooLarge,
    LineTooLong,
}

/// Result of reading one line with a length cap
#[derive(Debug, PartialEq)]
enum LineRead {
    Line,
    /// The line went past the cap; it was consumed but not kept
    TooLong,
    Eof,
}

/// Read up to and including the next `\n` into `buf`, keeping at most
/// `limit` bytes. Past the cap the rest of the line is drained unbuffered.
async fn read_line_bounded<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0usize;
    let mut too_long = false;

    loop {
        let (done, used) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(match (consumed, too_long) {
                    (0, _) => LineRead::Eof,
                    (_, true) => LineRead::TooLong,
                    (_, false) => LineRead::Line,
                });
            }
            let (done, used) = match available.iter().position(|&b| b == b'\n') {
                Some(pos) => (true, pos + 1),
                None => (false, available.len()),
            };
            if !too_long && buf.len() + used <= limit {
                buf.extend_from_slice(&available[..used]);
            } else {
                too_long = true;
                buf.clear();
            }
            (done, used)
        };
        reader.consume(used);
        consumed += used;

        if done {
            return Ok(if too_long { LineRead::TooLong } else { LineRead::Line });
        }
    }
}

/// Per-connection limits and identity
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub hostname: String,
    pub max_message_size: usize,
    pub max_recipients: usize,
}

/// One inbound SMTP connection
///
/// Recipients are checked against the directory at `RCPT TO`. After `DATA`
/// the message is decoded once and handed to [`MailService::add_mail`] for
/// each `To` address concurrently; the reply is sent when all have finished.
pub struct SmtpSession {
    state: SmtpState,
    from: Option<String>,
    to: Vec<String>,
    settings: SessionSettings,
    service: Arc<MailService>,
    error_count: usize,
    tls_config: Option<Arc<TlsConfig>>,
    is_encrypted: bool,
    client_ip: Option<IpAddr>,
    helo_domain: Option<String>,
}

impl SmtpSession {
    pub fn new(
        settings: SessionSettings,
        service: Arc<MailService>,
        tls_config: Option<Arc<TlsConfig>>,
    ) -> Self {
        Self {
            state: SmtpState::Fresh,
            from: None,
            to: Vec::new(),
            settings,
            service,
            error_count: 0,
            tls_config,
            is_encrypted: false,
            client_ip: None,
            helo_domain: None,
        }
    }

    pub async fn handle(mut self, stream: TcpStream) -> Result<()> {
        if let Ok(peer_addr) = stream.peer_addr() {
            self.client_ip = Some(peer_addr.ip());
            debug!(client = %peer_addr, "Session started");
        }

        let mut smtp_stream = SmtpStream::Plain(stream);
        smtp_stream
            .write_all(
                format!("220 {} ESMTP Service Ready\r\n", self.settings.hostname).as_bytes(),
            )
            .await?;

        loop {
            match self.process_commands(&mut smtp_stream).await? {
                SessionResult::Continue => continue,
                SessionResult::Quit => break,
            }
        }

        Ok(())
    }

    async fn process_commands(&mut self, stream: &mut SmtpStream) -> Result<SessionResult> {
        // Reborrow so the stream is reachable again after STARTTLS drops the reader
        let mut buf_reader = BufReader::new(&mut *stream);
        let mut line = Vec::new();

        loop {
            if self.error_count >= MAX_ERRORS {
                warn!(client = ?self.client_ip, errors = self.error_count, "Too many errors, disconnecting");
                buf_reader
                    .write_all(b"421 Too many errors, closing connection\r\n")
                    .await?;
                return Ok(SessionResult::Quit);
            }

            line.clear();
            let read = match timeout(
                COMMAND_TIMEOUT,
                read_line_bounded(&mut buf_reader, &mut line, MAX_LINE_LENGTH),
            )
            .await
            {
                Ok(Ok(read)) => read,
                Ok(Err(e)) => {
                    error!(error = %e, "IO error reading command");
                    return Err(e.into());
                }
                Err(_) => {
                    warn!(client = ?self.client_ip, "Command timeout, disconnecting");
                    buf_reader
                        .write_all(b"421 Timeout, closing connection\r\n")
                        .await?;
                    return Ok(SessionResult::Quit);
                }
            };

            match read {
                LineRead::Eof => {
                    debug!("Client disconnected");
                    return Ok(SessionResult::Quit);
                }
                LineRead::TooLong => {
                    warn!(max = MAX_LINE_LENGTH, "Command line too long");
                    buf_reader.write_all(b"500 Line too long\r\n").await?;
                    self.error_count += 1;
                    continue;
                }
                LineRead::Line => {}
            }

            let text = String::from_utf8_lossy(&line);
            let line_trimmed = text.trim_end();
            debug!(line = %line_trimmed, "Command received");

            let cmd = match SmtpCommand::parse(line_trimmed) {
                Ok(cmd) => cmd,
                Err(e) => {
                    warn!(error = %e, "Command parse error");
                    buf_reader
                        .write_all(b"500 Syntax error, command unrecognized\r\n")
                        .await?;
                    self.error_count += 1;
                    continue;
                }
            };

            if cmd == SmtpCommand::Starttls {
                drop(buf_reader);
                if self.handle_starttls_upgrade(stream).await? {
                    info!("STARTTLS established, awaiting new greeting");
                    return Ok(SessionResult::Continue);
                }
                buf_reader = BufReader::new(&mut *stream);
                continue;
            }

            let response = match self.handle_command(cmd).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Command rejected");
                    self.error_count += 1;
                    format!("501 {}\r\n", e)
                }
            };
            buf_reader.write_all(response.as_bytes()).await?;

            if response.starts_with("221") {
                return Ok(SessionResult::Quit);
            }

            if self.state == SmtpState::Data {
                let reply = match self.receive_data(&mut buf_reader).await {
                    Ok(DataOutcome::Complete(data)) => self.deliver(data).await,
                    Ok(DataOutcome::TooLarge) => format!(
                        "552 Message too large (max {} bytes)\r\n",
                        self.settings.max_message_size
                    ),
                    Ok(DataOutcome::LineTooLong) => {
                        self.error_count += 1;
                        format!("500 5.5.2 Line too long (max {} bytes)\r\n", MAX_LINE_LENGTH)
                    }
                    Err(e) => {
                        warn!(error = %e, "DATA phase failed");
                        self.error_count += 1;
                        "451 Error receiving message\r\n".to_string()
                    }
                };
                buf_reader.write_all(reply.as_bytes()).await?;
                self.reset_transaction();
            }
        }
    }

    fn reset_transaction(&mut self) {
        self.from = None;
        self.to.clear();
        self.state = SmtpState::Greeted;
    }

    async fn handle_command(&mut self, cmd: SmtpCommand) -> Result<String> {
        match (&self.state, cmd) {
            (SmtpState::Fresh, SmtpCommand::Helo(domain)) => {
                info!(helo = %domain, "HELO");
                let response = format!("250 {} Hello {}\r\n", self.settings.hostname, domain);
                self.helo_domain = Some(domain);
                self.state = SmtpState::Greeted;
                Ok(response)
            }
            (SmtpState::Fresh, SmtpCommand::Ehlo(domain)) => {
                info!(helo = %domain, "EHLO");
                let mut response = format!("250-{} Hello {}\r\n", self.settings.hostname, domain);
                if self.tls_config.is_some() && !self.is_encrypted {
                    response.push_str("250-STARTTLS\r\n");
                }
                response.push_str(&format!("250-SIZE {}\r\n", self.settings.max_message_size));
                response.push_str("250 HELP\r\n");

                self.helo_domain = Some(domain);
                self.state = SmtpState::Greeted;
                Ok(response)
            }
            (
                SmtpState::Greeted | SmtpState::MailFrom | SmtpState::RcptTo,
                SmtpCommand::MailFrom(from),
            ) => {
                // Null reverse path is allowed for bounces
                if !from.is_empty() {
                    validate_email(&from)?;
                }

                info!(envelope_from = %from, "MAIL FROM accepted");
                self.from = Some(from);
                self.to.clear();
                self.state = SmtpState::MailFrom;
                Ok("250 OK\r\n".to_string())
            }
            (SmtpState::MailFrom | SmtpState::RcptTo, SmtpCommand::RcptTo(to)) => {
                validate_email(&to)?;

                if self.to.len() >= self.settings.max_recipients {
                    warn!(count = self.to.len(), "Recipient limit reached");
                    return Ok(format!(
                        "452 Too many recipients (max {})\r\n",
                        self.settings.max_recipients
                    ));
                }

                if !self.service.exist_user_by_mail(&to).await {
                    warn!(recipient = %to, "Rejecting unknown recipient");
                    return Ok(format!("550 5.1.1 <{}>: User unknown\r\n", to));
                }

                info!(recipient = %to, "RCPT TO accepted");
                self.to.push(to);
                self.state = SmtpState::RcptTo;
                Ok("250 OK\r\n".to_string())
            }
            (SmtpState::RcptTo, SmtpCommand::Data) => {
                debug!("DATA started");
                self.state = SmtpState::Data;
                Ok("354 Start mail input; end with <CRLF>.<CRLF>\r\n".to_string())
            }
            (_, SmtpCommand::Rset) => {
                debug!("RSET");
                self.from = None;
                self.to.clear();
                if self.state != SmtpState::Fresh {
                    self.state = SmtpState::Greeted;
                }
                Ok("250 OK\r\n".to_string())
            }
            (_, SmtpCommand::Noop) => Ok("250 OK\r\n".to_string()),
            (_, SmtpCommand::Quit) => {
                debug!("QUIT");
                Ok(format!("221 {} closing connection\r\n", self.settings.hostname))
            }
            (_, SmtpCommand::Unknown(cmd)) => {
                warn!(command = %cmd, "Unknown command");
                Ok("502 Command not implemented\r\n".to_string())
            }
            _ => {
                warn!("Invalid command sequence");
                Ok("503 Bad sequence of commands\r\n".to_string())
            }
        }
    }

    /// Read the message up to the lone `.<CRLF>` line, undoing dot-stuffing.
    ///
    /// An oversized message, or one with an over-long line, is read to the
    /// end and discarded so the connection stays in sync.
    async fn receive_data<S>(&mut self, buf_reader: &mut BufReader<S>) -> Result<DataOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut data = Vec::new();
        let mut line = Vec::new();
        let mut too_large = false;
        let mut line_too_long = false;

        loop {
            line.clear();
            let read = match timeout(
                DATA_TIMEOUT,
                read_line_bounded(buf_reader, &mut line, MAX_LINE_LENGTH),
            )
            .await
            {
                Ok(Ok(read)) => read,
                Ok(Err(e)) => {
                    error!(error = %e, "IO error during DATA");
                    return Err(e.into());
                }
                Err(_) => {
                    warn!("DATA timeout");
                    return Err(GatewayError::SmtpProtocol("Timeout during DATA".to_string()));
                }
            };

            match read {
                LineRead::Eof => {
                    return Err(GatewayError::SmtpProtocol(
                        "Connection closed during DATA".to_string(),
                    ));
                }
                LineRead::TooLong => {
                    if !line_too_long {
                        warn!(
                            max = MAX_LINE_LENGTH,
                            "DATA line too long, discarding the rest of DATA"
                        );
                    }
                    line_too_long = true;
                    data.clear();
                    continue;
                }
                LineRead::Line => {}
            }

            // A bare-LF dot line is message content, not the terminator
            if line == b".\r\n" {
                debug!(size = data.len(), "End of DATA");
                break;
            }

            if too_large || line_too_long {
                continue;
            }
            if data.len() + line.len() > self.settings.max_message_size {
                warn!(
                    max = self.settings.max_message_size,
                    "Message too large, discarding the rest of DATA"
                );
                too_large = true;
                data.clear();
                continue;
            }

            if line.starts_with(b"..") {
                data.extend_from_slice(&line[1..]);
            } else {
                data.extend_from_slice(&line);
            }
        }

        if line_too_long {
            return Ok(DataOutcome::LineTooLong);
        }
        if too_large {
            return Ok(DataOutcome::TooLarge);
        }
        if data.is_empty() {
            return Err(GatewayError::SmtpProtocol("Empty message".to_string()));
        }
        Ok(DataOutcome::Complete(data))
    }

    /// Decode the message and run one delivery per `To` address.
    async fn deliver(&self, data: Vec<u8>) -> String {
        let message = match MimeParser::parse(&data) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Rejecting undecodable message");
                return format!("554 5.6.0 Message rejected: {}\r\n", single_line(&e.to_string()));
            }
        };
        if message.first_from().is_none() {
            warn!("Rejecting message without From address");
            return "554 5.6.0 Message rejected: no From address\r\n".to_string();
        }

        let sender_ip = self.client_ip.map(|ip| ip.to_string()).unwrap_or_default();
        let template = Mail::new(message, data);
        info!(
            helo = ?self.helo_domain,
            envelope_from = ?self.from,
            sender = %template.sender(),
            recipients = template.message.to.len(),
            "Message received"
        );

        let mut deliveries = JoinSet::new();
        for address in &template.message.to {
            let recipient = address.address.clone();
            let mail = template.for_recipient(&recipient, &sender_ip);
            let service = self.service.clone();
            let sender_ip = sender_ip.clone();
            deliveries.spawn(async move {
                service.add_mail(&recipient, mail, &sender_ip).await;
            });
        }

        while let Some(joined) = deliveries.join_next().await {
            if let Err(e) = joined {
                error!("Delivery task failed: {}", e);
            }
        }

        "250 OK: Message accepted\r\n".to_string()
    }

    /// Upgrade the connection in place (RFC 3207).
    ///
    /// `Ok(false)` when STARTTLS was refused and the plain session goes on.
    /// After an upgrade the client must greet again.
    async fn handle_starttls_upgrade(&mut self, stream: &mut SmtpStream) -> Result<bool> {
        let tls_config = match &self.tls_config {
            Some(config) => config.clone(),
            None => {
                stream.write_all(b"502 STARTTLS not available\r\n").await?;
                return Ok(false);
            }
        };

        if self.is_encrypted {
            stream.write_all(b"503 Already using TLS\r\n").await?;
            return Ok(false);
        }

        if self.state != SmtpState::Greeted {
            stream.write_all(b"503 Bad sequence of commands\r\n").await?;
            return Ok(false);
        }

        info!(client = ?self.client_ip, "STARTTLS handshake starting");
        stream.write_all(b"220 Ready to start TLS\r\n").await?;
        stream.flush().await?;

        let tcp_stream = match std::mem::replace(stream, SmtpStream::Upgrading) {
            SmtpStream::Plain(tcp) => tcp,
            other => {
                *stream = other;
                return Err(GatewayError::Tls("stream is not a plain connection".to_string()));
            }
        };

        let tls_stream = tls_config.acceptor().accept(tcp_stream).await.map_err(|e| {
            warn!(error = %e, "TLS handshake failed");
            GatewayError::Tls(format!("TLS handshake failed: {}", e))
        })?;

        *stream = SmtpStream::Tls(Box::new(tls_stream));
        self.is_encrypted = true;
        self.helo_domain = None;
        self.reset_transaction();
        self.state = SmtpState::Fresh;

        Ok(true)
    }
}

/// Keep a reply on one protocol line.
fn single_line(text: &str) -> String {
    text.replace(|c: char| c == '\r' || c == '\n', " ")
}
