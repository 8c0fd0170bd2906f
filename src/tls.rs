//! STARTTLS support: certificate lookup by thumbprint and the server-side
//! handshake that replaces a session's plaintext transport.

use crate::session::Transport;
use futures_util::future::BoxFuture;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, info};

/// Errors raised while resolving a certificate or upgrading a connection
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Malformed certificate thumbprint: {0}")]
    InvalidIdentifier(String),

    #[error("No certificate found with thumbprint {0}")]
    CertificateNotFound(Thumbprint),

    #[error("Unusable certificate: {0}")]
    InvalidCertificate(String),

    #[error("Certificate store error: {0}")]
    Store(#[source] std::io::Error),

    #[error("TLS handshake failed: {0}")]
    HandshakeFailed(#[source] std::io::Error),
}

/// SHA-256 digest of a certificate's DER encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Thumbprint([u8; 32]);

impl Thumbprint {
    /// Thumbprint of a DER-encoded certificate
    pub fn of(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }
}

impl FromStr for Thumbprint {
    type Err = TlsError;

    /// Accepts 64 hex digits in either case, optionally separated by `:` or whitespace
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s
            .chars()
            .filter(|c| *c != ':' && !c.is_whitespace())
            .collect();

        let mut bytes = [0u8; 32];
        hex::decode_to_slice(&digits, &mut bytes)
            .map_err(|_| TlsError::InvalidIdentifier(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

/// A certificate chain and its private key, ready for a TLS handshake
#[derive(Debug)]
pub struct CertificateHandle {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl CertificateHandle {
    /// Parse a PEM certificate chain and a PEM private key
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        let chain = rustls_pemfile::certs(&mut &cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
        if chain.is_empty() {
            return Err(TlsError::InvalidCertificate(
                "no certificate in PEM input".to_string(),
            ));
        }

        let key = rustls_pemfile::private_key(&mut &key_pem[..])
            .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?
            .ok_or_else(|| TlsError::InvalidCertificate("no private key found".to_string()))?;

        Ok(Self { chain, key })
    }

    /// Thumbprint of the leaf certificate
    pub fn thumbprint(&self) -> Thumbprint {
        // from_pem rejects empty chains
        Thumbprint::of(&self.chain[0])
    }
}

impl Clone for CertificateHandle {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

/// Resolves a thumbprint to a certificate the server can present
pub trait CertificateProvider: Send + Sync {
    fn resolve(&self, thumbprint: &Thumbprint) -> Result<CertificateHandle, TlsError>;
}

/// In-memory set of certificates
#[derive(Debug, Clone, Default)]
pub struct StaticCertificateProvider {
    certificates: HashMap<Thumbprint, CertificateHandle>,
}

impl StaticCertificateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a certificate, returning the thumbprint it is stored under
    pub fn insert(&mut self, handle: CertificateHandle) -> Thumbprint {
        let thumbprint = handle.thumbprint();
        self.certificates.insert(thumbprint, handle);
        thumbprint
    }
}

impl CertificateProvider for StaticCertificateProvider {
    fn resolve(&self, thumbprint: &Thumbprint) -> Result<CertificateHandle, TlsError> {
        self.certificates
            .get(thumbprint)
            .cloned()
            .ok_or(TlsError::CertificateNotFound(*thumbprint))
    }
}

/// Directory of PEM certificates.
///
/// Each `<name>.crt` or `<name>.pem` is paired with the private key in
/// `<name>.key`, or with a key in the same file when no `.key` exists.
#[derive(Debug, Clone)]
pub struct DirectoryCertificateStore {
    dir: PathBuf,
}

impl DirectoryCertificateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every certificate file in the store with its leaf thumbprint.
    /// Files that fail to parse are skipped.
    pub fn list(&self) -> Result<Vec<(Thumbprint, PathBuf)>, TlsError> {
        let mut found = Vec::new();

        for entry in std::fs::read_dir(&self.dir).map_err(TlsError::Store)? {
            let path = entry.map_err(TlsError::Store)?.path();
            let is_cert = matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("crt") | Some("pem")
            );
            if !is_cert {
                continue;
            }

            let pem = std::fs::read(&path).map_err(TlsError::Store)?;
            match rustls_pemfile::certs(&mut pem.as_slice()).next() {
                Some(Ok(leaf)) => found.push((Thumbprint::of(&leaf), path)),
                _ => debug!("Skipping {}: no certificate", path.display()),
            }
        }

        found.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(found)
    }

    fn key_path(cert_path: &Path) -> PathBuf {
        let key = cert_path.with_extension("key");
        if key.exists() {
            key
        } else {
            cert_path.to_path_buf()
        }
    }
}

impl CertificateProvider for DirectoryCertificateStore {
    fn resolve(&self, thumbprint: &Thumbprint) -> Result<CertificateHandle, TlsError> {
        let (_, cert_path) = self
            .list()?
            .into_iter()
            .find(|(t, _)| t == thumbprint)
            .ok_or(TlsError::CertificateNotFound(*thumbprint))?;

        let key_path = Self::key_path(&cert_path);
        debug!(
            "Found certificate {} in {} (key {})",
            thumbprint,
            cert_path.display(),
            key_path.display()
        );

        let cert_pem = std::fs::read(&cert_path).map_err(TlsError::Store)?;
        let key_pem = std::fs::read(&key_path).map_err(TlsError::Store)?;
        CertificateHandle::from_pem(&cert_pem, &key_pem)
    }
}

/// Upgrades a plaintext transport to TLS
pub trait Upgrade: Send + Sync {
    fn upgrade(&self, io: Transport) -> BoxFuture<'_, Result<Transport, TlsError>>;
}

/// Server-side STARTTLS handshake using the certificate with a given thumbprint.
///
/// The certificate is resolved on every upgrade so a store can be updated
/// while the server runs.
#[derive(Clone)]
pub struct TlsUpgrader {
    provider: Arc<dyn CertificateProvider>,
    thumbprint: Thumbprint,
}

impl TlsUpgrader {
    pub fn new(provider: Arc<dyn CertificateProvider>, thumbprint: Thumbprint) -> Self {
        Self {
            provider,
            thumbprint,
        }
    }

    async fn acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        let provider = self.provider.clone();
        let thumbprint = self.thumbprint;
        // Providers may read the filesystem
        let handle = tokio::task::spawn_blocking(move || provider.resolve(&thumbprint))
            .await
            .map_err(|e| TlsError::Store(std::io::Error::other(e)))??;
        info!("Found certificate with thumbprint {}", self.thumbprint);

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(handle.chain, handle.key)
            .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

impl fmt::Debug for TlsUpgrader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsUpgrader")
            .field("thumbprint", &self.thumbprint)
            .finish_non_exhaustive()
    }
}

impl Upgrade for TlsUpgrader {
    fn upgrade(&self, io: Transport) -> BoxFuture<'_, Result<Transport, TlsError>> {
        Box::pin(async move {
            let acceptor = self.acceptor().await?;
            let stream = acceptor
                .accept(io)
                .await
                .map_err(TlsError::HandshakeFailed)?;
            Ok::<_, TlsError>(Box::new(stream) as Transport)
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Self-signed certificate for `localhost` as (cert PEM, key PEM)
    pub(crate) fn localhost_pem() -> (String, String) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        (cert.serialize_pem().unwrap(), cert.serialize_private_key_pem())
    }

    #[test]
    fn test_thumbprint_parse() {
        let hex = "ab".repeat(32);
        let a: Thumbprint = hex.parse().unwrap();
        let b: Thumbprint = hex.to_uppercase().parse().unwrap();
        let spaced = hex
            .as_bytes()
            .chunks(2)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join(":");
        let c: Thumbprint = spaced.parse().unwrap();

        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a.to_string(), hex.to_uppercase());
    }

    #[test]
    fn test_thumbprint_malformed() {
        let cases = vec![
            String::new(),
            "abcd".to_string(),
            "zz".repeat(32),
            "ab".repeat(33),
        ];
        for bad in cases {
            assert!(matches!(
                bad.parse::<Thumbprint>(),
                Err(TlsError::InvalidIdentifier(_))
            ));
        }
    }

    #[test]
    fn test_static_provider() {
        let (cert, key) = localhost_pem();
        let handle = CertificateHandle::from_pem(cert.as_bytes(), key.as_bytes()).unwrap();

        let mut provider = StaticCertificateProvider::new();
        let thumbprint = provider.insert(handle);

        assert!(provider.resolve(&thumbprint).is_ok());
        let other = Thumbprint::of(b"other");
        assert!(matches!(
            provider.resolve(&other),
            Err(TlsError::CertificateNotFound(t)) if t == other
        ));
    }

    #[test]
    fn test_from_pem_without_key() {
        let (cert, _) = localhost_pem();
        assert!(matches!(
            CertificateHandle::from_pem(cert.as_bytes(), b""),
            Err(TlsError::InvalidCertificate(_))
        ));
        assert!(matches!(
            CertificateHandle::from_pem(b"", b""),
            Err(TlsError::InvalidCertificate(_))
        ));
    }

    #[test]
    fn test_directory_store() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_a, key_a) = localhost_pem();
        let (cert_b, key_b) = localhost_pem();
        std::fs::write(dir.path().join("a.crt"), &cert_a).unwrap();
        std::fs::write(dir.path().join("a.key"), &key_a).unwrap();
        // Certificate and key bundled in one file
        std::fs::write(dir.path().join("b.pem"), format!("{cert_b}{key_b}")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = DirectoryCertificateStore::new(dir.path());
        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);

        for (thumbprint, _) in &listed {
            let handle = store.resolve(thumbprint).unwrap();
            assert_eq!(&handle.thumbprint(), thumbprint);
        }

        let missing = Thumbprint::of(b"missing");
        assert!(matches!(
            store.resolve(&missing),
            Err(TlsError::CertificateNotFound(_))
        ));
    }

    #[test]
    fn test_directory_store_missing_dir() {
        let store = DirectoryCertificateStore::new("/nonexistent/dummy-smtp-certs");
        assert!(matches!(
            store.resolve(&Thumbprint::of(b"x")),
            Err(TlsError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_upgrade_handshake() {
        let (cert, key) = localhost_pem();
        let handle = CertificateHandle::from_pem(cert.as_bytes(), key.as_bytes()).unwrap();
        let mut provider = StaticCertificateProvider::new();
        let thumbprint = provider.insert(handle);
        let upgrader = TlsUpgrader::new(Arc::new(provider), thumbprint);

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let connector = crate::client::tls_connector(cert.as_bytes()).unwrap();

        let client = tokio::spawn(async move {
            let mut tls = connector
                .connect(crate::client::server_name("localhost").unwrap(), client_io)
                .await
                .unwrap();
            tls.write_all(b"ping").await.unwrap();
            tls.flush().await.unwrap();
            let mut buf = [0u8; 4];
            tls.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut secure = upgrader.upgrade(Box::new(server_io)).await.unwrap();
        let mut buf = [0u8; 4];
        secure.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        secure.write_all(b"pong").await.unwrap();
        secure.flush().await.unwrap();

        assert_eq!(&client.await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn test_upgrade_rejects_plaintext_peer() {
        let (cert, key) = localhost_pem();
        let mut provider = StaticCertificateProvider::new();
        let thumbprint =
            provider.insert(CertificateHandle::from_pem(cert.as_bytes(), key.as_bytes()).unwrap());
        let upgrader = TlsUpgrader::new(Arc::new(provider), thumbprint);

        let (mut client_io, server_io) = tokio::io::duplex(1024);
        client_io.write_all(b"EHLO not-tls\r\n").await.unwrap();

        let result = upgrader.upgrade(Box::new(server_io)).await;
        assert!(matches!(result, Err(TlsError::HandshakeFailed(_))));
    }

    /// Records the thread each lookup ran on
    struct ThreadRecorder {
        threads: std::sync::Mutex<Vec<std::thread::ThreadId>>,
    }

    impl CertificateProvider for ThreadRecorder {
        fn resolve(&self, thumbprint: &Thumbprint) -> Result<CertificateHandle, TlsError> {
            self.threads
                .lock()
                .unwrap()
                .push(std::thread::current().id());
            Err(TlsError::CertificateNotFound(*thumbprint))
        }
    }

    #[tokio::test]
    async fn test_lookup_runs_off_the_runtime_thread() {
        let recorder = Arc::new(ThreadRecorder {
            threads: std::sync::Mutex::new(Vec::new()),
        });
        let upgrader = TlsUpgrader::new(recorder.clone(), Thumbprint::of(b"any"));
        let (_client_io, server_io) = tokio::io::duplex(1024);

        let result = upgrader.upgrade(Box::new(server_io)).await;
        assert!(matches!(result, Err(TlsError::CertificateNotFound(_))));

        let threads = recorder.threads.lock().unwrap();
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], std::thread::current().id());
    }

    #[tokio::test]
    async fn test_upgrade_unknown_certificate() {
        let upgrader = TlsUpgrader::new(
            Arc::new(StaticCertificateProvider::new()),
            Thumbprint::of(b"nothing"),
        );
        let (_client_io, server_io) = tokio::io::duplex(1024);

        let result = upgrader.upgrade(Box::new(server_io)).await;
        assert!(matches!(result, Err(TlsError::CertificateNotFound(_))));
    }
}
