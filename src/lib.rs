//! Turnstile - Request Admission Gateway
//!
//! This crate decides, for every inbound request, whether it may proceed,
//! must be rejected as malicious, or must be throttled because the caller's
//! quota is exhausted. Payload inspection and address policy run first;
//! quotas are enforced with a sliding-window log that can be shared by many
//! gateway instances.

pub mod admission;
pub mod config;
pub mod error;
pub mod inspect;
pub mod ratelimit;

pub use admission::{AdmissionPipeline, Decision, RequestDescriptor};
pub use error::{Result, TurnstileError};
