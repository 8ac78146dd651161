// Copyright 2021-2023 The Lantern Authors
// SPDX-License-Identifier: Apache-2.0, MIT

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::errors::NetError;

/// A connected byte stream, TLS or plaintext.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// Paths to PEM-encoded TLS material.
#[cfg(feature = "tls")]
#[derive(Clone, Debug)]
pub struct TlsFiles {
    pub certificate: std::path::PathBuf,
    pub private_key: std::path::PathBuf,
    /// Extra roots trusted for outbound dials, on top of the certificate
    /// itself (committees commonly pin each other's certs).
    pub trusted_roots: Vec<std::path::PathBuf>,
}

/// How connections are secured. Production transports are TLS; the plaintext
/// variant only exists behind the `insecure-tests` build opt-in.
#[derive(Clone)]
pub enum Transport {
    #[cfg(feature = "tls")]
    Tls {
        connector: tokio_rustls::TlsConnector,
        acceptor: tokio_rustls::TlsAcceptor,
    },
    #[cfg(feature = "insecure-tests")]
    Plaintext,
}

impl Transport {
    #[cfg(feature = "tls")]
    pub fn tls(files: &TlsFiles) -> Result<Self, NetError> {
        use std::io::BufReader;
        use std::sync::Arc;
        use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
        use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};

        let io_err = |e: std::io::Error| NetError::Proto(format!("tls material: {e}"));

        let read_certs = |path: &std::path::Path| -> Result<Vec<CertificateDer<'static>>, NetError> {
            let file = std::fs::File::open(path).map_err(io_err)?;
            rustls_pemfile::certs(&mut BufReader::new(file))
                .collect::<Result<Vec<_>, _>>()
                .map_err(io_err)
        };

        let certs = read_certs(&files.certificate)?;
        let key_file = std::fs::File::open(&files.private_key).map_err(io_err)?;
        let key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut BufReader::new(key_file))
                .map_err(io_err)?
                .ok_or_else(|| NetError::Proto("no private key in pem file".into()))?;

        let mut roots = RootCertStore::empty();
        for cert in &certs {
            roots
                .add(cert.clone())
                .map_err(|e| NetError::Proto(format!("bad certificate: {e}")))?;
        }
        for path in &files.trusted_roots {
            for cert in read_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| NetError::Proto(format!("bad trusted root: {e}")))?;
            }
        }

        let client = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| NetError::Proto(format!("bad certificate/key pair: {e}")))?;

        Ok(Transport::Tls {
            connector: tokio_rustls::TlsConnector::from(Arc::new(client)),
            acceptor: tokio_rustls::TlsAcceptor::from(Arc::new(server)),
        })
    }

    /// Plaintext transport for in-process tests.
    #[cfg(feature = "insecure-tests")]
    pub fn insecure() -> Self {
        Transport::Plaintext
    }

    /// Dial `addr` and complete the client side of the handshake.
    pub async fn connect(&self, addr: &str) -> Result<BoxedIo, NetError> {
        let dial_err = |reason: String| NetError::DialFailure {
            addr: addr.to_owned(),
            reason,
        };
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| dial_err(e.to_string()))?;
        tcp.set_nodelay(true).ok();
        match self {
            #[cfg(feature = "tls")]
            Transport::Tls { connector, .. } => {
                use tokio_rustls::rustls::pki_types::ServerName;
                let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
                let name = ServerName::try_from(host.to_owned())
                    .map_err(|e| dial_err(format!("bad server name: {e}")))?;
                let stream = connector
                    .connect(name, tcp)
                    .await
                    .map_err(|e| dial_err(format!("tls handshake: {e}")))?;
                Ok(Box::new(stream))
            }
            #[cfg(feature = "insecure-tests")]
            Transport::Plaintext => Ok(Box::new(tcp)),
        }
    }

    /// Complete the server side of the handshake on an accepted socket.
    pub async fn accept(&self, tcp: TcpStream) -> Result<BoxedIo, NetError> {
        tcp.set_nodelay(true).ok();
        match self {
            #[cfg(feature = "tls")]
            Transport::Tls { acceptor, .. } => {
                let stream = acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| NetError::Proto(format!("tls accept: {e}")))?;
                Ok(Box::new(stream))
            }
            #[cfg(feature = "insecure-tests")]
            Transport::Plaintext => Ok(Box::new(tcp)),
        }
    }
}
