use std::{
    collections::BTreeSet,
    net::IpAddr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Serialize, Serializer};

fn unix_seconds<S: Serializer>(at: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(
        at.duration_since(UNIX_EPOCH)
            .map_or(0, |since| since.as_secs()),
    )
}

fn hex_list<S: Serializer>(list: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(list.iter().map(hex::encode))
}

/// Chain-verification summary for one probed host.
///
/// A failed verification is data, not a probe failure: it lands in `error`
/// here while the probe itself still counts as completed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValiditySummary {
    /// The leaf certificate is outside its validity window.
    pub expired: bool,
    /// Names of the root stores that anchor a trusted chain.
    pub trusted: BTreeSet<String>,
    pub error: Option<String>,
}

/// Everything one STARTTLS probe of one address observed.
#[derive(Debug, Clone, Serialize)]
pub struct HostSummary {
    pub address: IpAddr,
    #[serde(serialize_with = "unix_seconds")]
    pub updated_at: SystemTime,
    /// Whether the server accepted the STARTTLS verb; `None` when the
    /// conversation never got that far.
    pub starttls: Option<bool>,
    pub tls_versions: BTreeSet<u16>,
    pub tls_cipher_suites: BTreeSet<u16>,
    /// DER certificates as presented, leaf first.
    #[serde(skip)]
    pub certificates: Vec<Vec<u8>>,
    /// SHA-1 digests parallel to `certificates`; the first is the leaf.
    #[serde(serialize_with = "hex_list")]
    pub fingerprints: Vec<Vec<u8>>,
    pub validity: Option<ValiditySummary>,
    pub banner: Option<String>,
    pub error: Option<String>,
}

impl HostSummary {
    #[must_use]
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            updated_at: SystemTime::now(),
            starttls: None,
            tls_versions: BTreeSet::new(),
            tls_cipher_suites: BTreeSet::new(),
            certificates: Vec::new(),
            fingerprints: Vec::new(),
            validity: None,
            banner: None,
            error: None,
        }
    }

    /// Whether a TLS handshake completed and produced a certificate chain.
    #[must_use]
    pub fn tls_handshake_completed(&self) -> bool {
        !self.certificates.is_empty()
    }

    #[must_use]
    pub fn leaf_certificate(&self) -> Option<&[u8]> {
        self.certificates.first().map(Vec::as_slice)
    }

    #[must_use]
    pub fn leaf_fingerprint(&self) -> Option<&[u8]> {
        self.fingerprints.first().map(Vec::as_slice)
    }
}
