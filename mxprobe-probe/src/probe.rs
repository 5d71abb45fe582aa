//! The host-probe seam and its SMTP STARTTLS implementation.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use rustls::{
    ClientConfig, DigitallySignedStruct, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use serde::Deserialize;
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::{
    summary::HostSummary,
    validity::{ChainValidator, fingerprint},
};

/// Produces a [`HostSummary`] for one address.
///
/// Implementations must respect their configured timeout and return an
/// error-carrying summary rather than hang.
#[async_trait]
pub trait ProbeHost: Send + Sync {
    async fn probe(&self, address: IpAddr) -> HostSummary;
}

const fn default_timeout_secs() -> u64 {
    10
}

fn default_ehlo_domain() -> String {
    "example.com".to_string()
}

const fn default_port() -> u16 {
    25
}

/// Configuration for the SMTP probe.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Overall budget for one conversation, in seconds (default: 10).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Domain announced in EHLO (default: example.com).
    #[serde(default = "default_ehlo_domain")]
    pub ehlo_domain: String,

    /// SMTP port (default: 25).
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            ehlo_domain: default_ehlo_domain(),
            port: default_port(),
        }
    }
}

/// Probe setup failures, detected at startup.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to build certificate verifier: {0}")]
    Verifier(String),
}

#[derive(Debug, Error)]
enum ProbeError {
    #[error("Could not connect to remote host {address}: {source}")]
    Connect {
        address: IpAddr,
        source: std::io::Error,
    },

    #[error("read tcp {address}: {source}")]
    Read {
        address: IpAddr,
        source: std::io::Error,
    },

    #[error("write tcp {address}: {source}")]
    Write {
        address: IpAddr,
        source: std::io::Error,
    },

    #[error("Conversation error with remote host {address}: {message}")]
    Conversation { address: IpAddr, message: String },
}

impl ProbeError {
    fn conversation(address: IpAddr, message: impl Into<String>) -> Self {
        Self::Conversation {
            address,
            message: message.into(),
        }
    }
}

const STRIP_PREFIXES: [&str; 5] = [
    "Conversation error",
    "Could not connect",
    "dial tcp",
    "read tcp",
    "write tcp",
];

/// Normalises a transport error down to its trailing cause.
#[must_use]
pub fn simplify_error(message: &str) -> String {
    for prefix in STRIP_PREFIXES {
        if message.starts_with(prefix) {
            if let Some(index) = message.rfind(": ") {
                return message[index + 2..].to_string();
            }
        }
    }
    message.to_string()
}

/// One SMTP reply, possibly multi-line.
#[derive(Debug)]
struct Response {
    code: u16,
    lines: Vec<String>,
}

impl Response {
    fn text(&self) -> String {
        self.lines.join(" ")
    }
}

struct Conversation {
    address: IpAddr,
    stream: BufReader<TcpStream>,
}

impl Conversation {
    async fn read_response(&mut self) -> Result<Response, ProbeError> {
        let mut lines = Vec::new();

        loop {
            let mut line = String::new();
            let read = self
                .stream
                .read_line(&mut line)
                .await
                .map_err(|source| ProbeError::Read {
                    address: self.address,
                    source,
                })?;
            if read == 0 {
                return Err(ProbeError::conversation(
                    self.address,
                    "connection closed mid-response",
                ));
            }

            let line = line.trim_end_matches(['\r', '\n']);
            if line.len() < 3 {
                return Err(ProbeError::conversation(
                    self.address,
                    format!("malformed response line {line:?}"),
                ));
            }

            let code = line[..3]
                .parse::<u16>()
                .map_err(|_| {
                    ProbeError::conversation(
                        self.address,
                        format!("malformed response code {line:?}"),
                    )
                })?;
            let last = line.len() == 3 || line.as_bytes()[3] == b' ';
            lines.push(line.get(4..).unwrap_or_default().to_string());

            if last {
                return Ok(Response { code, lines });
            }
        }
    }

    async fn command(&mut self, verb: &str) -> Result<Response, ProbeError> {
        self.stream
            .get_mut()
            .write_all(format!("{verb}\r\n").as_bytes())
            .await
            .map_err(|source| ProbeError::Write {
                address: self.address,
                source,
            })?;
        self.read_response().await
    }

    fn into_stream(self) -> TcpStream {
        self.stream.into_inner()
    }
}

/// A certificate verifier that accepts every chain: the probe records what
/// the server presents, it does not gate the handshake on trust.
#[derive(Debug)]
struct CaptureVerifier;

impl ServerCertVerifier for CaptureVerifier {
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
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

/// The shipped [`ProbeHost`]: SMTP banner, EHLO, STARTTLS, TLS handshake.
pub struct SmtpProbe {
    config: ProbeConfig,
    timeout: Duration,
    tls: Arc<ClientConfig>,
    validator: ChainValidator,
}

impl std::fmt::Debug for SmtpProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpProbe")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SmtpProbe {
    pub fn new(config: ProbeConfig) -> Result<Self, SetupError> {
        let tls = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(CaptureVerifier))
            .with_no_client_auth();

        Ok(Self {
            timeout: Duration::from_secs(config.timeout_secs),
            config,
            tls: Arc::new(tls),
            validator: ChainValidator::new()?,
        })
    }

    async fn session(&self, address: IpAddr, summary: &mut HostSummary) -> Result<(), ProbeError> {
        let stream = TcpStream::connect(SocketAddr::new(address, self.config.port))
            .await
            .map_err(|source| ProbeError::Connect { address, source })?;
        let mut conversation = Conversation {
            address,
            stream: BufReader::new(stream),
        };

        let banner = conversation.read_response().await?;
        summary.banner = Some(banner.text());
        if banner.code != 220 {
            return Err(ProbeError::conversation(
                address,
                format!("Bad banner code {}", banner.code),
            ));
        }

        let ehlo = conversation
            .command(&format!("EHLO {}", self.config.ehlo_domain))
            .await?;
        if ehlo.code != 250 {
            return Err(ProbeError::conversation(address, "Bad return code for EHLO"));
        }

        let response = conversation.command("STARTTLS").await?;
        if response.code != 220 {
            summary.starttls = Some(false);
            return Err(ProbeError::conversation(
                address,
                "Bad return code for STARTTLS",
            ));
        }
        summary.starttls = Some(true);

        let connector = TlsConnector::from(Arc::clone(&self.tls));
        let server = ServerName::try_from(address.to_string()).map_err(|error| {
            ProbeError::conversation(address, format!("TLS handshake failed: {error}"))
        })?;
        let mut tls = connector
            .connect(server, conversation.into_stream())
            .await
            .map_err(|error| {
                ProbeError::conversation(address, format!("TLS handshake failed: {error}"))
            })?;

        {
            let (_, session) = tls.get_ref();
            if let Some(version) = session.protocol_version() {
                summary.tls_versions.insert(u16::from(version));
            }
            if let Some(suite) = session.negotiated_cipher_suite() {
                summary.tls_cipher_suites.insert(u16::from(suite.suite()));
            }
            if let Some(chain) = session.peer_certificates() {
                summary.certificates = chain.iter().map(|der| der.as_ref().to_vec()).collect();
                summary.fingerprints = summary
                    .certificates
                    .iter()
                    .map(|der| fingerprint(der))
                    .collect();
            }
        }
        summary.validity = Some(self.validator.validate(&summary.certificates, address));

        let _ = tls.write_all(b"QUIT\r\n").await;
        let _ = tls.shutdown().await;

        Ok(())
    }
}

#[async_trait]
impl ProbeHost for SmtpProbe {
    async fn probe(&self, address: IpAddr) -> HostSummary {
        let mut summary = HostSummary::new(address);

        match tokio::time::timeout(self.timeout, self.session(address, &mut summary)).await {
            Ok(Ok(())) => debug!(%address, "probe completed"),
            Ok(Err(error)) => summary.error = Some(simplify_error(&error.to_string())),
            Err(_) => summary.error = Some("i/o timeout".to_string()),
        }

        summary
    }
}
