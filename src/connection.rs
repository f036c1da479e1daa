//! Per-sequence connection establishment
//!
//! Every probe sequence opens a fresh connection and closes it at the end of
//! the cycle; connections are never pooled, so a stuck or mis-framed prior
//! exchange can never contaminate the next probe. EPP connections are
//! wrapped in TLS via rustls.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rustls::RootCertStore;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::Protocol;
use crate::config::TlsConfig;
use crate::handler::ActionHandler;

/// Open a plain TCP connection for a WHOIS exchange.
pub async fn connect_whois(host: &str, port: u16, connect_timeout: Duration) -> Result<ActionHandler> {
    let stream = tcp_connect(host, port, connect_timeout).await?;
    Ok(ActionHandler::from_stream(stream, Protocol::Whois))
}

/// Open a TLS connection for a WHOIS exchange that redirected to https.
pub async fn connect_whois_tls(
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<ActionHandler> {
    let stream = tcp_connect(host, port, connect_timeout).await?;

    let connector = tls_connector(&TlsConfig::default());
    let server_name = ServerName::try_from(host.to_string()).context("invalid redirect host")?;

    let stream = timeout(connect_timeout, connector.connect(server_name, stream))
        .await
        .context("TLS handshake timed out")?
        .context("TLS handshake failed")?;

    Ok(ActionHandler::from_stream(stream, Protocol::Whois))
}

/// Open the EPP connection, wrapped in TLS unless disabled for a test rig.
pub async fn connect_epp(
    host: &str,
    port: u16,
    tls: &TlsConfig,
    connect_timeout: Duration,
) -> Result<ActionHandler> {
    let stream = tcp_connect(host, port, connect_timeout).await?;

    if !tls.enabled {
        return Ok(ActionHandler::from_stream(stream, Protocol::Epp));
    }

    let connector = tls_connector(tls);
    let sni = tls.sni.clone().unwrap_or_else(|| host.to_string());
    let server_name = ServerName::try_from(sni).context("invalid SNI host name")?;

    let stream = timeout(connect_timeout, connector.connect(server_name, stream))
        .await
        .context("TLS handshake timed out")?
        .context("TLS handshake failed")?;

    Ok(ActionHandler::from_stream(stream, Protocol::Epp))
}

async fn tcp_connect(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream> {
    debug!(host, port, "opening connection");
    timeout(connect_timeout, TcpStream::connect((host, port)))
        .await
        .with_context(|| format!("connect to {host}:{port} timed out"))?
        .with_context(|| format!("failed to connect to {host}:{port}"))
}

fn tls_connector(tls: &TlsConfig) -> TlsConnector {
    let config = if tls.insecure_skip_verify {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DisabledVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    TlsConnector::from(Arc::new(config))
}

/// Accepts any server certificate; only for test rigs with self-signed certs.
#[derive(Debug)]
struct DisabledVerifier;

impl ServerCertVerifier for DisabledVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        let provider = rustls::crypto::CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));
        provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
