use std::fmt;

use hickory_resolver::proto::rr::RecordType;
use serde::Serialize;

/// One recursive query: a domain and a record type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DnsQuery {
    pub domain: String,
    pub rrtype: RecordType,
}

impl DnsQuery {
    #[must_use]
    pub fn new(domain: impl Into<String>, rrtype: RecordType) -> Self {
        Self {
            domain: domain.into(),
            rrtype,
        }
    }
}

impl fmt::Display for DnsQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.domain, self.rrtype)
    }
}

/// The outcome of one query.
///
/// Errors ride alongside the records rather than replacing them: NXDOMAIN
/// and non-success rcodes surface in `error`, while an empty `records` with
/// no error is a legal empty answer. `secure` is the DNSSEC validation
/// verdict of the backend; `why_bogus` carries the validator's reasoning
/// when it rejects an answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DnsAnswer {
    pub records: Vec<String>,
    pub secure: bool,
    pub error: Option<String>,
    pub why_bogus: Option<String>,
}

impl DnsAnswer {
    pub(crate) fn push(&mut self, record: String) {
        self.records.push(record);
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}
