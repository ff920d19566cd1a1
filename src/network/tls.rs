//! TLS upgrade with trust-on-first-use
//!
//! Chain and hostname validation are switched off: whether a certificate is
//! trusted is decided by the UI from the fingerprint returned here.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_native_tls::native_tls;

use super::stream::Transport;
use crate::protocol::ClientIdentity;

/// TLS errors
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("invalid client certificate: {0}")]
    Identity(native_tls::Error),

    #[error("peer sent no certificate")]
    NoPeerCertificate,
}

pub type TlsResult<T> = Result<T, TlsError>;

/// Performs the client side of a TLS handshake over a connected socket
#[async_trait]
pub trait Handshaker: Send + Sync {
    /// Returns the encrypted transport and the peer certificate fingerprint
    async fn handshake(
        &self,
        host: &str,
        tcp: TcpStream,
        identity: Option<&ClientIdentity>,
    ) -> TlsResult<(Transport, String)>;
}

/// Handshaker backed by the platform TLS library
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeTlsHandshaker;

impl NativeTlsHandshaker {
    fn connector(identity: Option<&ClientIdentity>) -> TlsResult<tokio_native_tls::TlsConnector> {
        let mut builder = native_tls::TlsConnector::builder();
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .min_protocol_version(Some(native_tls::Protocol::Tlsv12));

        if let Some(identity) = identity {
            let identity = native_tls::Identity::from_pkcs8(&identity.cert_pem, &identity.key_pem)
                .map_err(TlsError::Identity)?;
            builder.identity(identity);
        }

        Ok(builder.build()?.into())
    }
}

#[async_trait]
impl Handshaker for NativeTlsHandshaker {
    async fn handshake(
        &self,
        host: &str,
        tcp: TcpStream,
        identity: Option<&ClientIdentity>,
    ) -> TlsResult<(Transport, String)> {
        let connector = Self::connector(identity)?;
        let tls = connector.connect(host, tcp).await?;

        let cert = tls
            .get_ref()
            .peer_certificate()?
            .ok_or(TlsError::NoPeerCertificate)?;
        let fp = fingerprint(&cert.to_der()?);

        Ok((Transport::Tls(Box::new(tls)), fp))
    }
}

/// `SHA256:` followed by the lowercase hex digest of a DER certificate
pub fn fingerprint(der: &[u8]) -> String {
    format!("SHA256:{}", hex::encode(Sha256::digest(der)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::request::{Control, FetchParams, Request, RequestContext};
    use crate::network::resolver::AsyncResolver;
    use crate::protocol::Message;
    use crate::scheme::Scheme;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    /// Self-signed certificate for CN=localhost
    const CERT_PEM: &[u8] = include_bytes!("testdata/localhost.crt");
    const KEY_PEM: &[u8] = include_bytes!("testdata/localhost.key");

    fn fixture_fingerprint() -> String {
        let cert = native_tls::Certificate::from_pem(CERT_PEM).unwrap();
        fingerprint(&cert.to_der().unwrap())
    }

    /// Accept one TLS connection, read the request line, reply and close
    async fn tls_server(reply: &'static [u8]) -> (u16, JoinHandle<Vec<u8>>) {
        let identity = native_tls::Identity::from_pkcs8(CERT_PEM, KEY_PEM).unwrap();
        let acceptor: tokio_native_tls::TlsAcceptor =
            native_tls::TlsAcceptor::new(identity).unwrap().into();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut tls = acceptor.accept(tcp).await.unwrap();
            let mut request = Vec::new();
            let mut byte = [0u8; 1];
            while !request.ends_with(b"\r\n") {
                if tls.read(&mut byte).await.unwrap() == 0 {
                    break;
                }
                request.push(byte[0]);
            }
            tls.write_all(reply).await.unwrap();
            // close_notify
            let _ = tls.shutdown().await;
            request
        });
        (port, server)
    }

    #[test]
    fn test_fingerprint_format() {
        // sha256("") is well known
        assert_eq!(
            fingerprint(b""),
            "SHA256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_fingerprint_differs_per_certificate() {
        assert_ne!(fingerprint(b"cert-a"), fingerprint(b"cert-b"));
        assert_eq!(fingerprint(b"cert-a").len(), 7 + 64);
    }

    #[test]
    fn test_garbage_identity_is_rejected() {
        let identity = ClientIdentity {
            cert_pem: b"not a certificate".to_vec(),
            key_pem: b"not a key".to_vec(),
        };
        assert!(matches!(
            NativeTlsHandshaker::connector(Some(&identity)),
            Err(TlsError::Identity(_))
        ));
    }

    #[test]
    fn test_connector_without_identity() {
        assert!(NativeTlsHandshaker::connector(None).is_ok());
    }

    #[tokio::test]
    async fn test_handshake_reports_peer_fingerprint() {
        let (port, server) = tls_server(b"20 text/gemini\r\n").await;
        let tcp = TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let (mut transport, fp) = NativeTlsHandshaker
            .handshake("localhost", tcp, None)
            .await
            .unwrap();
        assert!(transport.is_tls());
        assert_eq!(fp, fixture_fingerprint());

        transport.write_all(b"gemini://localhost/\r\n").await.unwrap();
        transport.flush().await.unwrap();
        assert_eq!(server.await.unwrap(), b"gemini://localhost/\r\n");
    }

    #[tokio::test]
    async fn test_gemini_request_over_tls() {
        // The certificate names localhost; connecting by address skips that check too
        let (port, server) = tls_server(b"20 text/gemini\r\n# Secure\n").await;
        let ctx = Arc::new(RequestContext {
            resolver: Arc::new(AsyncResolver),
            handshaker: Arc::new(NativeTlsHandshaker),
            handshake_timeout: Duration::from_secs(5),
            connect_timeout: None,
            chunk_size: 1024,
        });
        let params = FetchParams {
            scheme: Scheme::Gemini,
            host: "127.0.0.1".to_string(),
            port,
            request: b"gemini://127.0.0.1/\r\n".to_vec(),
            identity: None,
        };
        let (control, control_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events) = mpsc::channel(16);
        let task = tokio::spawn(Request::new(9, params, ctx, control_rx, events_tx).run());

        assert_eq!(
            events.recv().await,
            Some(Message::TrustCheck { id: 9, fingerprint: fixture_fingerprint() })
        );
        control.send(Control::TrustVerdict(true)).unwrap();
        assert_eq!(
            events.recv().await,
            Some(Message::ReplyHeader { id: 9, status: 20, meta: "text/gemini".to_string() })
        );
        control.send(Control::Proceed).unwrap();

        let mut body = Vec::new();
        loop {
            match events.recv().await {
                Some(Message::BodyChunk { id: 9, data }) => body.extend_from_slice(&data),
                Some(Message::EndOfStream { id: 9 }) => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(body, b"# Secure\n");

        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("request did not close")
            .unwrap();
        assert_eq!(events.recv().await, None);
        assert_eq!(server.await.unwrap(), b"gemini://127.0.0.1/\r\n");
    }
}
