//! The resolution seam and its hickory-resolver backends.

use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use hickory_resolver::{
    TokioAsyncResolver,
    config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts},
    error::ResolveErrorKind,
    proto::{op::ResponseCode, rr::RData},
};
use serde::Deserialize;
use tracing::warn;

use crate::answer::{DnsAnswer, DnsQuery};

/// The recursive-resolution seam the processor runs on.
///
/// Implementations must respect their configured timeout and return an
/// error-carrying answer rather than hang; there is no caller-driven
/// cancellation above this point.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, query: &DnsQuery) -> DnsAnswer;
}

/// Which backend behaviour to run behind the [`Resolve`] seam.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolverMode {
    /// DNSSEC-validating resolution; answers carry `secure`/`why_bogus`.
    Validating,
    /// Plain stub resolution over the configured upstream; never `secure`.
    Stub,
}

/// Record rendering: MX targets lowercased without the trailing dot, A/AAAA
/// as textual addresses, TLSA as `usage selector matchingtype cert-hex`.
fn render(rdata: &RData) -> Option<String> {
    match rdata {
        RData::MX(mx) => {
            let exchange = mx.exchange().to_utf8().to_lowercase();
            Some(exchange.trim_end_matches('.').to_string())
        }
        RData::A(a) => Some(a.0.to_string()),
        RData::AAAA(aaaa) => Some(aaaa.0.to_string()),
        RData::TLSA(tlsa) => Some(format!(
            "{} {} {} {}",
            u8::from(tlsa.cert_usage()),
            u8::from(tlsa.selector()),
            u8::from(tlsa.matching()),
            hex::encode(tlsa.cert_data()),
        )),
        _ => None,
    }
}

/// [`Resolve`] backend over hickory-resolver.
pub struct HickoryResolver {
    resolver: TokioAsyncResolver,
    validating: bool,
}

impl HickoryResolver {
    /// Builds a resolver.
    ///
    /// Without an `upstream` the system configuration is used; with one, all
    /// queries go to that address over UDP.
    #[must_use]
    pub fn new(mode: ResolverMode, upstream: Option<SocketAddr>, timeout: Duration) -> Self {
        let validating = mode == ResolverMode::Validating;

        let mut options = ResolverOpts::default();
        options.timeout = timeout;
        options.validate = validating;

        let config = upstream.map_or_else(ResolverConfig::default, |address| {
            let mut config = ResolverConfig::new();
            config.add_name_server(NameServerConfig::new(address, Protocol::Udp));
            config
        });

        Self {
            resolver: TokioAsyncResolver::tokio(config, options),
            validating,
        }
    }
}

#[async_trait]
impl Resolve for HickoryResolver {
    async fn resolve(&self, query: &DnsQuery) -> DnsAnswer {
        match self.resolver.lookup(query.domain.as_str(), query.rrtype).await {
            Ok(lookup) => {
                let mut answer = DnsAnswer {
                    secure: self.validating,
                    ..DnsAnswer::default()
                };
                for record in lookup.record_iter() {
                    if let Some(rendered) = record.data().and_then(render) {
                        answer.push(rendered);
                    }
                }
                answer
            }
            Err(error) => match error.kind() {
                ResolveErrorKind::NoRecordsFound { response_code, .. } => {
                    match *response_code {
                        // An empty but successful answer is legal.
                        ResponseCode::NoError => DnsAnswer {
                            secure: self.validating,
                            ..DnsAnswer::default()
                        },
                        ResponseCode::NXDomain => DnsAnswer::failed("NXDOMAIN"),
                        other => DnsAnswer::failed(other.to_string()),
                    }
                }
                ResolveErrorKind::Proto(_) if self.validating => {
                    // The validator rejected the answer; record its reasoning.
                    let text = error.to_string();
                    warn!(query = %query, "bogus answer: {text}");
                    DnsAnswer {
                        why_bogus: Some(text.clone()),
                        ..DnsAnswer::failed(text)
                    }
                }
                _ => DnsAnswer::failed(error.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use hickory_resolver::proto::rr::{Name, rdata};
    use std::str::FromStr;

    use super::*;

    #[test]
    fn mx_targets_are_lowercased_without_trailing_dot() {
        let mx = rdata::MX::new(10, Name::from_str("MX1.Example.TEST.").unwrap());
        assert_eq!(
            render(&RData::MX(mx)).as_deref(),
            Some("mx1.example.test")
        );
    }

    #[test]
    fn addresses_render_textually() {
        let a = rdata::A(std::net::Ipv4Addr::new(192, 0, 2, 1));
        assert_eq!(render(&RData::A(a)).as_deref(), Some("192.0.2.1"));

        let aaaa = rdata::AAAA(std::net::Ipv6Addr::LOCALHOST);
        assert_eq!(render(&RData::AAAA(aaaa)).as_deref(), Some("::1"));
    }

    #[test]
    fn tlsa_renders_as_quad() {
        let tlsa = rdata::TLSA::new(
            rdata::tlsa::CertUsage::DomainIssued,
            rdata::tlsa::Selector::Spki,
            rdata::tlsa::Matching::Sha256,
            vec![0xde, 0xad, 0xbe, 0xef],
        );
        assert_eq!(
            render(&RData::TLSA(tlsa)).as_deref(),
            Some("3 1 1 deadbeef")
        );
    }

    #[tokio::test]
    #[ignore = "Requires network access"]
    async fn stub_lookup_resolves_mx_records() {
        let resolver = HickoryResolver::new(ResolverMode::Stub, None, Duration::from_secs(5));
        let answer = resolver
            .resolve(&DnsQuery::new("gmail.com", crate::RecordType::MX))
            .await;

        assert!(answer.error.is_none());
        assert!(!answer.secure);
        assert!(!answer.records.is_empty());
        assert!(answer.records.iter().all(|r| !r.ends_with('.')));
    }
}
