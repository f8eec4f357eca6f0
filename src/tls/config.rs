//! Server/client `rustls` configuration builders. Session cache and ALPN
//! list are supplied by the caller rather than hardcoded, and the session
//! store plugs in [`crate::resumption::SharedResumptionStore`] instead of
//! `ServerSessionMemoryCache` so async lookups are possible.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::resumption::SharedResumptionStore;

#[derive(Clone)]
pub struct TlsClientConfig {
    inner: Arc<ClientConfig>,
}

impl TlsClientConfig {
    /// System root certificates (via `webpki-roots`) plus the caller's
    /// ALPN preference list.
    pub fn new(alpn_protocols: Vec<Vec<u8>>) -> io::Result<Self> {
        let root_store = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::from_root_store(root_store, alpn_protocols)
    }

    /// Trusts exactly `trust_anchor` instead of the system roots -- for
    /// pinning a private CA rather than relying on the public web PKI.
    pub fn with_trust_anchor(trust_anchor: CertificateDer<'static>, alpn_protocols: Vec<Vec<u8>>) -> io::Result<Self> {
        let mut root_store = RootCertStore::empty();
        root_store
            .add(trust_anchor)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid trust anchor: {e}")))?;
        Self::from_root_store(root_store, alpn_protocols)
    }

    fn from_root_store(root_store: RootCertStore, alpn_protocols: Vec<Vec<u8>>) -> io::Result<Self> {
        let mut config = ClientConfig::builder().with_root_certificates(root_store).with_no_client_auth();
        config.resumption = config.resumption.tls12_resumption(rustls::client::Tls12Resumption::SessionIdOrTickets);
        config.alpn_protocols = alpn_protocols;
        Ok(Self { inner: Arc::new(config) })
    }

    pub fn inner(&self) -> &Arc<ClientConfig> {
        &self.inner
    }

    /// Resolves the `ServerName` the adapter hands to `ClientConnection`.
    pub fn server_name(host: &str) -> io::Result<ServerName<'static>> {
        host.to_string()
            .try_into()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid server name"))
    }
}

#[derive(Clone)]
pub struct TlsServerConfig {
    inner: Arc<ServerConfig>,
}

impl TlsServerConfig {
    /// `resumption` is the *same* [`SharedResumptionStore`] instance the
    /// caller later passes to [`crate::socket::Socket::handshake_server`]
    /// for every connection accepted against this config: rustls calls
    /// `get()`/`put()` on whatever is installed as `session_storage`, and
    /// the per-socket `Record`/`RequestSent`/`Complete` bookkeeping in
    /// `socket.rs` has to observe those exact calls, not a second store
    /// wrapping the same backend.
    pub fn from_pem_files(
        cert_path: &Path,
        key_path: &Path,
        resumption: Arc<SharedResumptionStore>,
        alpn_protocols: Vec<Vec<u8>>,
    ) -> io::Result<Self> {
        let cert_file =
            File::open(cert_path).map_err(|e| io::Error::new(e.kind(), format!("failed to open cert file: {e}")))?;
        let key_file =
            File::open(key_path).map_err(|e| io::Error::new(e.kind(), format!("failed to open key file: {e}")))?;

        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("invalid cert: {e}")))?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("invalid key: {e}")))?
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "no private key found"))?;

        Self::from_certs_and_key(certs, key, resumption, alpn_protocols)
    }

    pub fn from_certs_and_key(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        resumption: Arc<SharedResumptionStore>,
        alpn_protocols: Vec<Vec<u8>>,
    ) -> io::Result<Self> {
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("TLS config error: {e}")))?;

        config.send_tls13_tickets = 2;
        config.session_storage = resumption;
        config.alpn_protocols = alpn_protocols;

        Ok(Self { inner: Arc::new(config) })
    }

    pub fn inner(&self) -> &Arc<ServerConfig> {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_builds_with_root_store_and_alpn() {
        let config = TlsClientConfig::new(vec![b"h2".to_vec(), b"http/1.1".to_vec()]).unwrap();
        assert_eq!(config.inner().alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
    }

    #[test]
    fn server_name_rejects_invalid_host() {
        assert!(TlsClientConfig::server_name("example.com").is_ok());
        assert!(TlsClientConfig::server_name("").is_err());
    }

    #[test]
    fn trust_anchor_accepts_a_self_signed_cert() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        let config = TlsClientConfig::with_trust_anchor(cert.der().clone(), vec![]);
        assert!(config.is_ok());
    }
}
