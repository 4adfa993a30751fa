//! Quota state: limiting keys, sliding-window logs, ledgers and tiers.

mod backend;
mod distributed;
mod key;
mod memory;
mod tiers;
mod window;

pub use backend::{LedgerBackend, LedgerOutcome, QuotaCheck};
pub use distributed::RedisLedger;
pub use key::{Caller, LimitScope, LimitingKey};
pub use memory::MemoryLedger;
pub use tiers::{QuotaTier, TierResolver};
pub use window::{Quota, SlidingWindowLog};
