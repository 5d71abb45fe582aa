//! DNS resolution with in-flight query coalescing.
//!
//! [`DnsProcessor`] funnels lookups through a worker pool and guarantees that
//! concurrent identical queries share a single underlying [`Resolve`] call.
//! There is no long-term caching here: the recursive resolver behind the
//! [`Resolve`] seam owns that.

pub mod answer;
pub mod job;
pub mod processor;
pub mod resolver;

pub use answer::{DnsAnswer, DnsQuery};
pub use hickory_resolver::proto::rr::RecordType;
pub use job::{DnsJob, DnsJobGroup};
pub use processor::DnsProcessor;
pub use resolver::{HickoryResolver, Resolve, ResolverMode};
