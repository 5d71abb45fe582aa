//! Pure certificate helpers consulted by the probe and the aggregator.

use std::{collections::BTreeSet, net::IpAddr, sync::Arc};

use rustls::{
    CertificateError, RootCertStore,
    client::{WebPkiServerVerifier, danger::ServerCertVerifier, verify_server_name},
    pki_types::{CertificateDer, ServerName, UnixTime},
    server::ParsedCertificate,
};
use sha1::{Digest, Sha1};
use tracing::warn;

use crate::{probe::SetupError, summary::ValiditySummary};

/// SHA-1 digest of a DER-encoded certificate.
#[must_use]
pub fn fingerprint(der: &[u8]) -> Vec<u8> {
    Sha1::digest(der).to_vec()
}

/// Whether the leaf certificate validates for `hostname`.
///
/// Unparseable certificates and unparseable hostnames both count as a
/// mismatch.
#[must_use]
pub fn leaf_matches(leaf_der: &[u8], hostname: &str) -> bool {
    let der = CertificateDer::from(leaf_der.to_vec());
    let Ok(parsed) = ParsedCertificate::try_from(&der) else {
        return false;
    };
    let Ok(name) = ServerName::try_from(hostname.to_string()) else {
        return false;
    };
    verify_server_name(&parsed, &name).is_ok()
}

/// Chain verification against the system root store.
///
/// Built once per probe instance; verification itself is a pure function of
/// the chain and the clock.
pub struct ChainValidator {
    verifier: Arc<WebPkiServerVerifier>,
}

impl std::fmt::Debug for ChainValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainValidator").finish_non_exhaustive()
    }
}

impl ChainValidator {
    /// Loads the system root store.
    pub fn new() -> Result<Self, SetupError> {
        let mut roots = RootCertStore::empty();

        let certs = rustls_native_certs::load_native_certs();
        for cert in certs.certs {
            if let Err(error) = roots.add(cert) {
                warn!("skipping unusable root certificate: {error}");
            }
        }
        if !certs.errors.is_empty() {
            warn!(?certs.errors, "some root certificates could not be loaded");
        }

        let verifier = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|error| SetupError::Verifier(error.to_string()))?;
        Ok(Self { verifier })
    }

    /// Summarises the chain presented by `address`: leaf first, then
    /// intermediates.
    ///
    /// The peer's hostname is unknown at probe time (hosts are keyed by
    /// address), so the name check runs against the address and a
    /// name-mismatch outcome still counts as a trusted chain; hostname
    /// matching is re-checked at aggregation time via [`leaf_matches`].
    #[must_use]
    pub fn validate(&self, certificates: &[Vec<u8>], address: IpAddr) -> ValiditySummary {
        let Some((leaf, intermediates)) = certificates.split_first() else {
            return ValiditySummary {
                error: Some("no certificates presented".to_string()),
                ..ValiditySummary::default()
            };
        };

        let leaf = CertificateDer::from(leaf.clone());
        let intermediates: Vec<CertificateDer<'_>> = intermediates
            .iter()
            .map(|der| CertificateDer::from(der.clone()))
            .collect();

        let Ok(server) = ServerName::try_from(address.to_string()) else {
            return ValiditySummary {
                error: Some("unrepresentable server name".to_string()),
                ..ValiditySummary::default()
            };
        };

        let system = || BTreeSet::from(["system".to_string()]);

        match self.verifier.verify_server_cert(
            &leaf,
            &intermediates,
            &server,
            &[],
            UnixTime::now(),
        ) {
            Ok(_) => ValiditySummary {
                trusted: system(),
                ..ValiditySummary::default()
            },
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName
                | CertificateError::NotValidForNameContext { .. },
            )) => ValiditySummary {
                trusted: system(),
                ..ValiditySummary::default()
            },
            Err(rustls::Error::InvalidCertificate(
                error @ (CertificateError::Expired
                | CertificateError::ExpiredContext { .. }
                | CertificateError::NotValidYet
                | CertificateError::NotValidYetContext { .. }),
            )) => ValiditySummary {
                expired: true,
                error: Some(rustls::Error::InvalidCertificate(error).to_string()),
                ..ValiditySummary::default()
            },
            Err(error) => ValiditySummary {
                error: Some(error.to_string()),
                ..ValiditySummary::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_twenty_bytes() {
        let digest = fingerprint(b"not a real certificate");
        assert_eq!(digest.len(), 20);
        assert_eq!(digest, fingerprint(b"not a real certificate"));
    }

    #[test]
    fn garbage_leaf_never_matches() {
        assert!(!leaf_matches(b"garbage", "mail.example.test"));
    }

    #[test]
    fn empty_chain_is_an_error_not_a_panic() {
        let validator = ChainValidator::new().expect("system root store");
        let validity = validator.validate(&[], "192.0.2.1".parse().unwrap());

        assert!(!validity.expired);
        assert!(validity.trusted.is_empty());
        assert!(validity.error.is_some());
    }

    #[test]
    fn garbage_chain_reports_an_error() {
        let validator = ChainValidator::new().expect("system root store");
        let validity = validator.validate(&[b"garbage".to_vec()], "192.0.2.1".parse().unwrap());

        assert!(validity.trusted.is_empty());
        assert!(validity.error.is_some());
    }
}
