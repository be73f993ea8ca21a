use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::info;

/// Server-side TLS material, loaded from PEM files once at server construction and
///  shared by all sessions of that server.
///
/// The protocol floor is what rustls supports: TLS 1.2 and 1.3. Encrypted private keys
///  are rejected rather than silently ignored.
#[derive(Clone, Debug)]
pub struct TlsServerOptions {
    pub cert_chain_path: PathBuf,
    pub private_key_path: PathBuf,
    /// CA pool for verifying client certificates; when set, clients must present a
    ///  certificate that chains to this pool.
    pub ca_path: Option<PathBuf>,
}

impl TlsServerOptions {
    pub fn new(cert_chain_path: impl Into<PathBuf>, private_key_path: impl Into<PathBuf>) -> TlsServerOptions {
        TlsServerOptions {
            cert_chain_path: cert_chain_path.into(),
            private_key_path: private_key_path.into(),
            ca_path: None,
        }
    }

    pub(crate) fn build_acceptor(&self) -> anyhow::Result<TlsAcceptor> {
        let certs = load_certs(&self.cert_chain_path)?;
        let key = load_private_key(&self.private_key_path)?;

        let builder = match &self.ca_path {
            Some(ca_path) => {
                info!("requiring client certificates against CA pool {:?}", ca_path);
                let roots = load_root_store(ca_path)?;
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|e| anyhow!("invalid client certificate verifier: {}", e))?;
                ServerConfig::builder().with_client_cert_verifier(verifier)
            }
            None => ServerConfig::builder().with_no_client_auth(),
        };
        let config = builder
            .with_single_cert(certs, key)
            .context("certificate chain and private key do not form a valid identity")?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Client-side TLS configuration. Peer verification is always on: the server certificate
///  must chain to the configured CA pool, and its name is checked against the connection
///  endpoint's address unless `server_name` overrides it (for certificates naming a DNS
///  name rather than an IP address).
#[derive(Clone, Debug, Default)]
pub struct TlsClientOptions {
    pub ca_path: Option<PathBuf>,
    pub server_name: Option<String>,
    /// Client certificate for servers that require mutual TLS.
    pub cert_chain_path: Option<PathBuf>,
    pub private_key_path: Option<PathBuf>,
}

impl TlsClientOptions {
    pub(crate) fn build_connector(&self) -> anyhow::Result<TlsConnector> {
        let roots = match &self.ca_path {
            Some(ca_path) => load_root_store(ca_path)?,
            None => RootCertStore::empty(),
        };
        let builder = ClientConfig::builder().with_root_certificates(roots);

        let config = match (&self.cert_chain_path, &self.private_key_path) {
            (Some(cert_path), Some(key_path)) => builder
                .with_client_auth_cert(load_certs(cert_path)?, load_private_key(key_path)?)
                .context("client certificate chain and private key do not form a valid identity")?,
            (None, None) => builder.with_no_client_auth(),
            _ => anyhow::bail!("client certificate chain and private key must be configured together"),
        };
        Ok(TlsConnector::from(Arc::new(config)))
    }
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("cannot open certificate file {:?}", path))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid PEM certificate data in {:?}", path))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {:?}", path);
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("cannot open private key file {:?}", path))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("invalid PEM key data in {:?}", path))?
        .ok_or_else(|| anyhow!("no private key found in {:?} (encrypted keys are not supported)", path))
}

fn load_root_store(path: &Path) -> anyhow::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .with_context(|| format!("invalid CA certificate in {:?}", path))?;
    }
    Ok(roots)
}
