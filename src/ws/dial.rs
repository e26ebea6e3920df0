//! Upstream WebSocket dialing
//!
//! Turns a cluster's [`RestConfig`] into a connected upstream socket:
//! derives the `wss` URL from the REST host, builds a rustls connector from
//! the cluster's TLS material, and performs the handshake with a timeout.
//! Some API servers reject handshakes without an `Origin`, so the upstream
//! host is always sent as the origin; a bearer token, when present, rides
//! in the `Authorization` header.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::{connect_async_tls_with_config, Connector};
use tracing::error;
use url::Url;

use super::SafeFrameConn;
use crate::contexts::RestConfig;
use crate::error::{Error, Result};

/// Opens WebSocket connections to upstream API servers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial `path`/`query` on the cluster described by `config`.
    async fn dial<'a>(
        &self,
        config: &RestConfig,
        path: &str,
        query: &str,
        token: Option<&'a str>,
    ) -> Result<SafeFrameConn>;
}

/// Production [`Dialer`] using tungstenite over rustls.
pub struct TlsDialer {
    handshake_timeout: Duration,
}

impl TlsDialer {
    /// Create a dialer with the given handshake timeout.
    pub fn new(handshake_timeout: Duration) -> Self {
        Self { handshake_timeout }
    }

    /// Dial a prebuilt WebSocket URL.
    ///
    /// Split out from [`Dialer::dial`] so the handshake logic is testable
    /// against plain `ws://` servers.
    pub(crate) async fn dial_websocket(
        &self,
        ws_url: &str,
        connector: Option<Connector>,
        origin: &str,
        token: Option<&str>,
    ) -> Result<SafeFrameConn> {
        let mut request = ws_url
            .into_client_request()
            .map_err(|e| Error::Dial(e.to_string()))?;

        let origin_value =
            HeaderValue::from_str(origin).map_err(|e| Error::Dial(format!("origin header: {e}")))?;
        request.headers_mut().insert(header::ORIGIN, origin_value);

        if let Some(token) = token {
            let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| Error::Dial(format!("authorization header: {e}")))?;
            request.headers_mut().insert(header::AUTHORIZATION, bearer);
        }

        let connect = connect_async_tls_with_config(request, None, false, connector);
        match tokio::time::timeout(self.handshake_timeout, connect).await {
            Ok(Ok((stream, _response))) => Ok(SafeFrameConn::from_upstream(stream)),
            Ok(Err(e)) => {
                error!(url = %ws_url, error = %e, "dialing upstream WebSocket");
                Err(Error::Dial(e.to_string()))
            }
            Err(_) => {
                error!(url = %ws_url, "upstream WebSocket handshake timed out");
                Err(Error::Dial("handshake timed out".into()))
            }
        }
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial<'a>(
        &self,
        config: &RestConfig,
        path: &str,
        query: &str,
        token: Option<&'a str>,
    ) -> Result<SafeFrameConn> {
        let ws_url = websocket_url(&config.host, path, query)?;
        let connector = build_tls_connector(config)?;
        self.dial_websocket(&ws_url, Some(connector), &config.host, token)
            .await
    }
}

/// Derive the upstream WebSocket URL from a REST host.
pub fn websocket_url(host: &str, path: &str, query: &str) -> Result<String> {
    let mut url = Url::parse(host)?;
    url.set_scheme("wss")
        .map_err(|_| Error::Dial(format!("cannot derive wss URL from {host}")))?;
    url.set_path(path);
    url.set_query(if query.is_empty() { None } else { Some(query) });

    Ok(url.into())
}

/// Build a rustls connector from the cluster's TLS material.
fn build_tls_connector(config: &RestConfig) -> Result<Connector> {
    let builder = if config.insecure_skip_tls_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
    } else {
        let mut roots = rustls::RootCertStore::empty();
        match &config.ca_data {
            Some(ca) => {
                for cert in rustls_pemfile::certs(&mut ca.as_slice()) {
                    let cert = cert.map_err(|e| Error::Dial(format!("invalid CA bundle: {e}")))?;
                    roots
                        .add(cert)
                        .map_err(|e| Error::Dial(format!("invalid CA certificate: {e}")))?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        rustls::ClientConfig::builder().with_root_certificates(roots)
    };

    let tls = match (&config.client_cert_data, &config.client_key_data) {
        (Some(cert_pem), Some(key_pem)) => {
            let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::Dial(format!("invalid client certificate: {e}")))?;
            let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                .map_err(|e| Error::Dial(format!("invalid client key: {e}")))?
                .ok_or_else(|| Error::Dial("no private key in client key data".into()))?;

            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::Dial(format!("client auth config: {e}")))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(Connector::Rustls(Arc::new(tls)))
}

/// Certificate verifier for clusters flagged `insecure_skip_tls_verify`.
#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
