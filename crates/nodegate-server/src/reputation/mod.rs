//! Address reputation: local allow/deny lists and DNS-based classification.

pub mod dnsbl;
pub mod store;

pub use dnsbl::{DnsLookup, DnsblResolver, SystemLookup, UNKNOWN_COUNTRY};
pub use store::ReputationStore;
