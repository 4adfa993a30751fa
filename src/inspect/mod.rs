//! Request validation: payload signatures and caller address policy.

mod address;
mod patterns;

pub use address::{parse_address, AddressPolicy, AddressVerdict};
pub use patterns::{ThreatCategory, ThreatDetector};
