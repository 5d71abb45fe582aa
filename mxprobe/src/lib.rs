//! mxprobe continuously probes the SMTP-over-TLS posture of mail servers
//! discovered from a list of domains and publishes the findings to a result
//! store and, as TXT records, to an authoritative DNS zone.
//!
//! The pipeline: a domain enters the [`DomainProcessor`](domain::DomainProcessor),
//! its MX hostnames flow into the [`MxProcessor`](mx::MxProcessor), each
//! resolved address is probed through the
//! [`HostProcessor`](host::HostProcessor), and the per-host observations fold
//! into one TXT record per MX hostname.

pub mod command;
pub mod config;
pub mod domain;
pub mod host;
pub mod mx;
pub mod socket;
pub mod status;
pub mod system;

pub use config::Config;
pub use system::System;
