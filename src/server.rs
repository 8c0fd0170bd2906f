//! Dummy SMTP Server
//!
//! Accepts connections and serves them one at a time, capturing every
//! message to the inbox directory.

use crate::config::ServerConfig;
use crate::mailbox::Mailbox;
use crate::session::{Session, SessionEnd};
use crate::tls::{DirectoryCertificateStore, TlsUpgrader, Upgrade};
use crate::transcript::Transcript;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server state
pub struct Server {
    config: ServerConfig,
    mailbox: Mailbox,
    transcript: Transcript,
    upgrader: Option<Arc<dyn Upgrade>>,
}

impl Server {
    /// Create a new server from configuration.
    ///
    /// Creates the inbox directory and opens the transcript. When a
    /// thumbprint is configured, certificates are looked up in the
    /// configured store directory.
    pub async fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let mailbox = Mailbox::open(&config.inbox_dir).await.map_err(|e| {
            Error::InvalidConfig(format!(
                "couldn't create the inbox directory {}: {e}",
                config.inbox_dir
            ))
        })?;

        let transcript = match &config.log_file {
            Some(path) => Transcript::open(path).await?,
            None => Transcript::disabled(),
        };

        let upgrader = match config.thumbprint()? {
            Some(thumbprint) => {
                let store = DirectoryCertificateStore::new(&config.cert_store);
                match store.list() {
                    Ok(found) if found.iter().any(|(t, _)| *t == thumbprint) => {
                        info!("STARTTLS enabled with certificate {}", thumbprint);
                    }
                    Ok(_) => warn!(
                        "Certificate {} not in {} yet; STARTTLS will fail until it is added",
                        thumbprint,
                        store.dir().display()
                    ),
                    Err(e) => warn!("Certificate store {}: {}", store.dir().display(), e),
                }
                Some(Arc::new(TlsUpgrader::new(Arc::new(store), thumbprint)) as Arc<dyn Upgrade>)
            }
            None => None,
        };

        Ok(Self {
            config,
            mailbox,
            transcript,
            upgrader,
        })
    }

    /// Replace the STARTTLS implementation, or disable it with `None`
    pub fn with_upgrader(mut self, upgrader: Option<Arc<dyn Upgrade>>) -> Self {
        self.upgrader = upgrader;
        self
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Bind the configured address and run the server
    pub async fn run(&mut self) -> Result<()> {
        let addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::InvalidConfig(format!("couldn't bind {addr}: {e}")))?;
        self.run_with_listener(listener).await
    }

    /// Accept connections from `listener` forever, one at a time
    pub async fn run_with_listener(&mut self, listener: TcpListener) -> Result<()> {
        info!("Dummy SMTP server listening on {}", listener.local_addr()?);
        info!("Saving messages to {}", self.mailbox.dir().display());
        self.transcript
            .note(&format!("server listening on {}", listener.local_addr()?))
            .await;

        loop {
            self.transcript.note("waiting for connections...").await;
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            self.serve(stream, addr).await;
        }
    }

    /// Serve one connection to completion. Errors end only this connection.
    pub async fn serve(&mut self, stream: TcpStream, addr: SocketAddr) {
        info!("Connection from {}", addr);
        self.transcript
            .note(&format!("connected to client: {addr}"))
            .await;

        let mut session = Session::new(&self.config, &self.mailbox, &mut self.transcript);
        if let Some(upgrader) = &self.upgrader {
            session = session.with_tls(upgrader.clone());
        }

        let result = session.run(Box::new(stream)).await;
        let saved = session.saved().len();

        match result {
            Ok(SessionEnd::Quit) => info!("Client {} quit ({} messages)", addr, saved),
            Ok(SessionEnd::Disconnected) => {
                info!("Client {} disconnected ({} messages)", addr, saved)
            }
            Err(e @ Error::Io(_)) => {
                debug!("Lost connection with {}: {}", addr, e);
                self.transcript.note("lost connection with client").await;
            }
            Err(e) => {
                warn!("Closing connection with {}: {}", addr, e);
                self.transcript.note(&format!("closing connection: {e}")).await;
            }
        }
    }
}

/// Run the server
pub async fn run_server(config: ServerConfig) -> Result<()> {
    let mut server = Server::new(config).await?;
    server.run().await
}
