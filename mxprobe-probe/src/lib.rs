//! Per-host STARTTLS probing and TXT record aggregation.
//!
//! [`ProbeHost`] is the seam the host pipeline runs on; [`SmtpProbe`] is the
//! shipped implementation (TCP → banner → EHLO → STARTTLS → TLS handshake).
//! [`TxtRecord`] folds the per-host observations of one MX hostname into the
//! published record text.

pub mod probe;
pub mod summary;
pub mod txt;
pub mod validity;

pub use probe::{ProbeConfig, ProbeHost, SetupError, SmtpProbe, simplify_error};
pub use summary::{HostSummary, ValiditySummary};
pub use txt::TxtRecord;
pub use validity::{ChainValidator, fingerprint, leaf_matches};
