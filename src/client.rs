//! Minimal SMTP submission client
//!
//! Drives one message through greeting, EHLO, optional STARTTLS, MAIL, RCPT,
//! DATA and QUIT. Used to exercise the server by hand and in tests.

use crate::proto::LineCodec;
use crate::session::Transport;
use crate::tls::TlsError;
use crate::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_util::codec::Framed;
use tracing::debug;

type LineStream = Framed<Transport, LineCodec>;

/// TLS connector trusting only the certificates in `ca_pem`
pub fn tls_connector(ca_pem: &[u8]) -> Result<TlsConnector> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &ca_pem[..]) {
        let cert = cert.map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
        roots
            .add(cert)
            .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
    }
    if roots.is_empty() {
        return Err(TlsError::InvalidCertificate("no CA certificate in PEM input".to_string()).into());
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Name the server certificate must be valid for
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host)
        .map(|name| name.to_owned())
        .map_err(|_| Error::InvalidConfig(format!("invalid server name: {host}")))
}

/// Sender and recipients for one message
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: String,
    pub to: Vec<String>,
}

/// SMTP submission client
pub struct Client {
    helo: String,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    read_timeout: Duration,
}

impl Client {
    pub fn new(helo: impl Into<String>) -> Self {
        Self {
            helo: helo.into(),
            tls: None,
            read_timeout: Duration::from_secs(30),
        }
    }

    /// Require STARTTLS before sending the envelope
    pub fn with_starttls(mut self, connector: TlsConnector, server_name: ServerName<'static>) -> Self {
        self.tls = Some((connector, server_name));
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Deliver one message over `io`, returning every line the server sent
    pub async fn send(&self, io: Transport, envelope: &Envelope, body: &[String]) -> Result<Vec<String>> {
        let mut replies = Vec::new();
        let mut stream = Framed::new(io, LineCodec::default());

        // 1. Wait for greeting
        self.expect(&mut stream, "220", &mut replies).await?;

        // 2. EHLO
        self.command(&mut stream, &format!("EHLO {}", self.helo), "250", &mut replies)
            .await?;

        // 3. STARTTLS, then EHLO again over the secure channel
        if let Some((connector, name)) = &self.tls {
            let offered = replies.iter().any(|l| l == "250-STARTTLS" || l == "250 STARTTLS");
            if !offered {
                return Err(Error::Protocol("server does not offer STARTTLS".to_string()));
            }
            self.command(&mut stream, "STARTTLS", "220", &mut replies).await?;

            let parts = stream.into_parts();
            let tls = connector
                .connect(name.clone(), parts.io)
                .await
                .map_err(TlsError::HandshakeFailed)?;
            debug!("TLS established with server");
            stream = Framed::new(Box::new(tls) as Transport, LineCodec::default());

            self.command(&mut stream, &format!("EHLO {}", self.helo), "250", &mut replies)
                .await?;
        }

        // 4. Envelope
        self.command(&mut stream, &format!("MAIL FROM:<{}>", envelope.from), "250", &mut replies)
            .await?;
        for rcpt in &envelope.to {
            self.command(&mut stream, &format!("RCPT TO:<{rcpt}>"), "250", &mut replies)
                .await?;
        }

        // 5. Content, dot-stuffed
        self.command(&mut stream, "DATA", "354", &mut replies).await?;
        for line in body {
            if line.starts_with('.') {
                stream.feed(format!(".{line}")).await?;
            } else {
                stream.feed(line.as_str()).await?;
            }
        }
        self.command(&mut stream, ".", "250", &mut replies).await?;

        // 6. QUIT
        stream.send("QUIT").await?;
        Ok(replies)
    }

    async fn command(
        &self,
        stream: &mut LineStream,
        line: &str,
        expected: &str,
        replies: &mut Vec<String>,
    ) -> Result<()> {
        debug!("C: {}", line);
        stream.send(line).await?;
        self.expect(stream, expected, replies).await
    }

    /// Read a possibly multi-line reply and check its code
    async fn expect(&self, stream: &mut LineStream, expected: &str, replies: &mut Vec<String>) -> Result<()> {
        loop {
            let line = tokio::time::timeout(self.read_timeout, stream.next())
                .await
                .map_err(|_| Error::Timeout(self.read_timeout))?
                .ok_or_else(|| Error::Protocol("server closed connection".to_string()))??;
            debug!("S: {}", line);

            if !line.starts_with(expected) {
                return Err(Error::Protocol(format!("expected {expected}, got: {line}")));
            }
            let last = line.as_bytes().get(3) != Some(&b'-');
            replies.push(line);
            if last {
                return Ok(());
            }
        }
    }
}
