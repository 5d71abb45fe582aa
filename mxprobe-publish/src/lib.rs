//! Where finished results go: the typed result sink and the authoritative
//! DNS publisher.

pub mod nsupdate;
pub mod sink;

pub use nsupdate::{NsUpdateConfig, NsUpdater};
pub use sink::{Finding, LogStore, ResultProcessor, ResultStore, StoreError};
