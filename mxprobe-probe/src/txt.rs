//! Aggregation of per-host probe results into one published TXT record.

use std::{collections::BTreeSet, fmt, time::UNIX_EPOCH};

use serde::{Serialize, Serializer};

use crate::{summary::HostSummary, validity::leaf_matches};

/// Maximum length of one string inside a TXT record.
pub const TXT_CHUNK_LENGTH: usize = 255;

fn hex_set<S: Serializer>(set: &BTreeSet<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(set.iter().map(hex::encode))
}

/// The combined STARTTLS posture of one MX hostname.
///
/// A pure fold over the host summaries: intersection-typed fields only claim
/// what every reachable host supports, union-typed fields collect everything
/// observed. Rendering is byte-stable for identical inputs.
#[derive(Debug, Clone, Serialize)]
pub struct TxtRecord {
    pub domain: String,
    pub starttls: bool,
    /// Unix seconds of the most recent contributing probe.
    pub updated_at: u64,
    pub tls_versions: BTreeSet<u16>,
    pub tls_ciphers: BTreeSet<u16>,
    pub trusted: BTreeSet<String>,
    #[serde(serialize_with = "hex_set")]
    pub fingerprints: BTreeSet<Vec<u8>>,
    pub cert_problems: BTreeSet<String>,
}

fn intersection<T: Ord + Clone>(
    mut sets: impl Iterator<Item = BTreeSet<T>>,
) -> BTreeSet<T> {
    let Some(mut combined) = sets.next() else {
        return BTreeSet::new();
    };
    for set in sets {
        combined = combined.intersection(&set).cloned().collect();
    }
    combined
}

impl TxtRecord {
    /// Folds the probe results of `domain`'s mail hosts into one record.
    #[must_use]
    pub fn from_hosts(domain: &str, hosts: &[HostSummary]) -> Self {
        let updated_at = hosts
            .iter()
            .filter_map(|host| host.updated_at.duration_since(UNIX_EPOCH).ok())
            .map(|since| since.as_secs())
            .max()
            .unwrap_or(0);

        let mut record = Self {
            domain: domain.to_string(),
            starttls: false,
            updated_at,
            tls_versions: BTreeSet::new(),
            tls_ciphers: BTreeSet::new(),
            trusted: BTreeSet::new(),
            fingerprints: BTreeSet::new(),
            cert_problems: BTreeSet::new(),
        };

        // A host contributes once its conversation reached the STARTTLS
        // verb. The record only claims starttls when every contributing
        // host accepted the verb and produced a certificate chain.
        let mut contributing = hosts.iter().filter(|host| host.starttls.is_some());
        record.starttls = contributing.next().is_some()
            && hosts
                .iter()
                .filter(|host| host.starttls.is_some())
                .all(|host| host.starttls == Some(true) && host.tls_handshake_completed());

        if !record.starttls {
            return record;
        }

        let tls_hosts = || hosts.iter().filter(|host| host.tls_handshake_completed());

        record.tls_versions = intersection(tls_hosts().map(|host| host.tls_versions.clone()));
        record.tls_ciphers =
            intersection(tls_hosts().map(|host| host.tls_cipher_suites.clone()));
        record.trusted = intersection(tls_hosts().map(|host| {
            host.validity
                .as_ref()
                .map(|validity| validity.trusted.clone())
                .unwrap_or_default()
        }));

        for host in tls_hosts() {
            if let Some(leaf) = host.leaf_fingerprint() {
                record.fingerprints.insert(leaf.to_vec());
            }
            if let Some(leaf) = host.leaf_certificate() {
                if !leaf_matches(leaf, domain) {
                    record.cert_problems.insert("mismatch".to_string());
                }
            }
            if host.validity.as_ref().is_some_and(|validity| validity.expired) {
                record.cert_problems.insert("expired".to_string());
            }
        }

        record
    }

    /// The rendered record split into TXT-sized chunks.
    #[must_use]
    pub fn chunks(&self) -> Vec<String> {
        mxprobe_common::strings::split_by_length(&self.to_string(), TXT_CHUNK_LENGTH)
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}

fn write_joined<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    key: &str,
    values: impl Iterator<Item = T>,
) -> fmt::Result {
    write!(f, " {key}=")?;
    for (index, value) in values.enumerate() {
        if index > 0 {
            write!(f, ",")?;
        }
        write!(f, "{value}")?;
    }
    Ok(())
}

impl fmt::Display for TxtRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.starttls {
            return write!(f, "starttls=false");
        }

        write!(f, "starttls=true updated={}", self.updated_at)?;

        if !self.tls_versions.is_empty() {
            write_joined(
                f,
                "tls-versions",
                self.tls_versions.iter().map(|version| format!("{version:04x}")),
            )?;
        }
        if !self.tls_ciphers.is_empty() {
            write_joined(
                f,
                "tls-ciphers",
                self.tls_ciphers.iter().map(|cipher| format!("{cipher:04x}")),
            )?;
        }
        if !self.fingerprints.is_empty() {
            write_joined(f, "fingerprints", self.fingerprints.iter().map(hex::encode))?;
        }
        if !self.trusted.is_empty() {
            write_joined(f, "trusted", self.trusted.iter())?;
        }
        if !self.cert_problems.is_empty() {
            write_joined(f, "certificate-problems", self.cert_problems.iter())?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use pretty_assertions::assert_eq;

    use super::*;

    fn host(starttls: Option<bool>, with_chain: bool) -> HostSummary {
        let mut host = HostSummary::new("192.0.2.1".parse().unwrap());
        host.starttls = starttls;
        if with_chain {
            host.certificates = vec![b"not a certificate".to_vec()];
            host.fingerprints = vec![vec![0xaa]];
        }
        host
    }

    #[test]
    fn starttls_is_an_and_over_contributing_hosts() {
        let check = |expected: bool, hosts: &[HostSummary]| {
            assert_eq!(
                TxtRecord::from_hosts("example.test", hosts).starttls,
                expected,
                "for {hosts:?}"
            );
        };

        // No hosts, and hosts that never reached STARTTLS.
        check(false, &[]);
        check(false, &[host(None, false)]);

        // A refusal wins.
        check(false, &[host(Some(false), false)]);
        check(false, &[host(Some(true), true), host(Some(false), false)]);

        // Acceptance requires a certificate chain too.
        check(false, &[host(Some(true), false)]);
        check(true, &[host(Some(true), true)]);

        // An unreachable host does not contribute.
        check(true, &[host(Some(true), true), host(None, false)]);
    }

    #[test]
    fn a_refusing_host_reduces_the_record_to_starttls_false() {
        let hosts = [host(Some(true), true), host(Some(false), false)];
        let record = TxtRecord::from_hosts("example.test", &hosts);

        assert_eq!(record.to_string(), "starttls=false");
    }

    #[test]
    fn aggregation_renders_the_documented_example() {
        let updated = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        let mut hosts = vec![host(Some(true), true), host(Some(true), true), host(Some(true), true)];
        for (index, entry) in hosts.iter_mut().enumerate() {
            entry.updated_at = updated;
            entry.tls_versions = BTreeSet::from([0x0303]);
            entry.tls_cipher_suites = BTreeSet::from([0xc02f]);
            // Two hosts share the leaf fingerprint `aa`, one presents `bb`.
            entry.fingerprints = vec![vec![if index == 2 { 0xbb } else { 0xaa }]];
        }

        let record = TxtRecord::from_hosts("example.test", &hosts);
        assert_eq!(
            record.to_string(),
            "starttls=true updated=1700000000 tls-versions=0303 tls-ciphers=c02f \
             fingerprints=aa,bb certificate-problems=mismatch"
        );
    }

    #[test]
    fn rendering_is_deterministic_for_identical_inputs() {
        let hosts = vec![host(Some(true), true); 3];

        let first = TxtRecord::from_hosts("example.test", &hosts).to_string();
        let second = TxtRecord::from_hosts("example.test", &hosts).to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn intersections_are_subsets_and_unions_are_supersets() {
        let mut first = host(Some(true), true);
        first.tls_versions = BTreeSet::from([0x0301, 0x0303]);
        first.tls_cipher_suites = BTreeSet::from([0xc02f, 0xc030]);

        let mut second = host(Some(true), true);
        second.tls_versions = BTreeSet::from([0x0303, 0x0304]);
        second.tls_cipher_suites = BTreeSet::from([0xc030]);
        second.fingerprints = vec![vec![0xbb]];

        let hosts = [first.clone(), second.clone()];
        let record = TxtRecord::from_hosts("example.test", &hosts);

        for host in &hosts {
            assert!(record.tls_versions.is_subset(&host.tls_versions));
            assert!(record.tls_ciphers.is_subset(&host.tls_cipher_suites));
            assert!(
                record
                    .fingerprints
                    .contains(host.leaf_fingerprint().unwrap())
            );
        }
        assert_eq!(record.tls_versions, BTreeSet::from([0x0303]));
        assert_eq!(record.tls_ciphers, BTreeSet::from([0xc030]));
    }

    #[test]
    fn expired_hosts_contribute_the_expired_problem() {
        let mut expired = host(Some(true), true);
        expired.validity = Some(crate::ValiditySummary {
            expired: true,
            ..crate::ValiditySummary::default()
        });

        let record = TxtRecord::from_hosts("example.test", &[expired]);
        assert!(record.cert_problems.contains("expired"));
        assert!(record.cert_problems.contains("mismatch"));
    }

    #[test]
    fn long_records_chunk_into_txt_sized_strings() {
        let mut record = TxtRecord::from_hosts("example.test", &[host(Some(true), true)]);
        // Enough fingerprints to push the rendering well past one chunk.
        record.fingerprints = (0_u32..32)
            .map(|seed| crate::fingerprint(&seed.to_be_bytes()))
            .collect();

        let rendered = record.to_string();
        assert!(rendered.len() > TXT_CHUNK_LENGTH);

        let chunks = record.chunks();
        assert!(chunks.iter().all(|chunk| chunk.len() <= TXT_CHUNK_LENGTH));
        assert_eq!(chunks.concat(), rendered);
    }
}
