//! DNS-related modules.

pub mod trusted;

pub use trusted::{DnsOverride, TrustedResolver};
