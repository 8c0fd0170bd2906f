//! Per-connection SMTP state machine
//!
//! A session sends the greeting, then reads one line at a time. In command
//! mode each line is dispatched and its reply flushed before the next read.
//! In data mode lines are captured until a line containing only `.`, at
//! which point the message is written to the mailbox. `STARTTLS` swaps the
//! transport for an encrypted one; the plaintext transport is never touched
//! again afterwards.

use crate::config::ServerConfig;
use crate::idle::IdleTimeout;
use crate::mailbox::{ArtifactId, Mailbox};
use crate::proto::smtp::{self, Action, Context, END_OF_DATA, QUIT, Response};
use crate::proto::LineCodec;
use crate::tls::Upgrade;
use crate::transcript::Transcript;
use crate::{Error, Result};
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Byte stream a session runs over, plaintext or TLS
pub trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

pub type Transport = Box<dyn AsyncIo>;

type LineStream = Framed<Transport, LineCodec>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Command,
    /// Capturing message content after DATA
    Data,
}

/// How a session finished without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Client sent QUIT
    Quit,
    /// Client closed the stream
    Disconnected,
}

/// State for one client connection
pub struct Session<'a> {
    config: &'a ServerConfig,
    mailbox: &'a Mailbox,
    transcript: &'a mut Transcript,
    upgrader: Option<Arc<dyn Upgrade>>,
    mode: Mode,
    tls_active: bool,
    pending: Vec<String>,
    saved: Vec<ArtifactId>,
}

impl<'a> Session<'a> {
    pub fn new(config: &'a ServerConfig, mailbox: &'a Mailbox, transcript: &'a mut Transcript) -> Self {
        Self {
            config,
            mailbox,
            transcript,
            upgrader: None,
            mode: Mode::Command,
            tls_active: false,
            pending: Vec::new(),
            saved: Vec::new(),
        }
    }

    /// Offer STARTTLS, performed by `upgrader`
    pub fn with_tls(mut self, upgrader: Arc<dyn Upgrade>) -> Self {
        self.upgrader = Some(upgrader);
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn tls_active(&self) -> bool {
        self.tls_active
    }

    /// Messages written to the mailbox so far
    pub fn saved(&self) -> &[ArtifactId] {
        &self.saved
    }

    fn context(&self) -> Context<'_> {
        Context {
            hostname: &self.config.hostname,
            tls_offered: self.upgrader.is_some(),
            tls_active: self.tls_active,
        }
    }

    /// Line framing over `io`, with reads bounded by the inactivity timeout
    fn framed(&self, io: Transport) -> LineStream {
        let io: Transport = Box::new(IdleTimeout::new(io, self.config.read_timeout()));
        Framed::new(io, LineCodec::new(self.config.max_line_length))
    }

    /// Serve the connection until QUIT, end of stream, or an error.
    ///
    /// Any error is fatal to this connection only.
    pub async fn run(&mut self, io: Transport) -> Result<SessionEnd> {
        let mut stream = self.framed(io);
        self.send(&mut stream, &[Response::greeting()]).await?;

        loop {
            let Some(line) = self.read_line(&mut stream).await? else {
                self.transcript.note("end of stream").await;
                if !self.pending.is_empty() {
                    warn!(
                        "Stream closed in DATA mode, dropping {} captured lines",
                        self.pending.len()
                    );
                }
                return Ok(SessionEnd::Disconnected);
            };

            if line == QUIT {
                self.transcript.note("disconnecting from client").await;
                if !self.pending.is_empty() {
                    debug!("QUIT in DATA mode, dropping {} captured lines", self.pending.len());
                }
                return Ok(SessionEnd::Quit);
            }

            if self.mode == Mode::Data {
                if line == END_OF_DATA {
                    self.finish_message().await?;
                    self.mode = Mode::Command;
                    self.send(&mut stream, &[Response::ok()]).await?;
                } else {
                    self.pending.push(line);
                }
                continue;
            }

            let reply = smtp::dispatch(&line, &self.context());
            self.send(&mut stream, &reply.lines).await?;

            match reply.action {
                Action::None => {}
                Action::EnterData => self.mode = Mode::Data,
                Action::StartTls => stream = self.start_tls(stream).await?,
            }
        }
    }

    async fn read_line(&mut self, stream: &mut LineStream) -> Result<Option<String>> {
        match stream.next().await {
            None => Ok(None),
            Some(Err(Error::Io(e))) if e.kind() == io::ErrorKind::TimedOut => {
                Err(Error::Timeout(self.config.read_timeout()))
            }
            Some(Err(e)) => Err(e),
            Some(Ok(line)) => {
                self.transcript.received(&line).await;
                Ok(Some(line))
            }
        }
    }

    /// Write all reply lines and flush them together
    async fn send(&mut self, stream: &mut LineStream, lines: &[String]) -> Result<()> {
        let Some((last, rest)) = lines.split_last() else {
            return Ok(());
        };
        for line in rest {
            self.transcript.sent(line).await;
            stream.feed(line.as_str()).await?;
        }
        self.transcript.sent(last).await;
        stream.send(last.as_str()).await
    }

    async fn finish_message(&mut self) -> Result<()> {
        let lines = std::mem::take(&mut self.pending);
        let id = self
            .mailbox
            .persist(&lines)
            .await
            .map_err(Error::Persistence)?;
        info!("Captured message {} ({} lines)", id, lines.len());
        self.transcript
            .note(&format!("saved message {id}"))
            .await;
        self.saved.push(id);
        Ok(())
    }

    async fn start_tls(&mut self, stream: LineStream) -> Result<LineStream> {
        let upgrader = self
            .upgrader
            .clone()
            .ok_or_else(|| Error::Protocol("STARTTLS accepted without a certificate".to_string()))?;

        let parts = stream.into_parts();
        if !parts.read_buf.is_empty() {
            // Anything sent before the handshake must not be read as if it were encrypted
            warn!(
                "Discarding {} bytes pipelined after STARTTLS",
                parts.read_buf.len()
            );
        }

        self.transcript.note("initiating TLS handshake").await;
        let io = upgrader.upgrade(parts.io).await.inspect_err(|e| {
            warn!("STARTTLS failed, closing connection: {}", e);
        })?;
        self.tls_active = true;
        self.transcript.note("secure channel initialized").await;
        debug!("TLS established");

        Ok(self.framed(io))
    }
}
