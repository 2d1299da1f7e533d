//! `logwatchd`: a multi-tenant syslog watcher. Clients create independent
//! `LogWatch` instances, each holding its own addressable rule tree, and
//! subscribe over a TCP control connection to the lines their tree
//! matches out of the UDP syslog stream.

pub mod collector;
pub mod config;
pub mod error;
pub mod manager;
pub mod predicate;
pub mod protocol;
pub mod record;
pub mod rule_tree;
pub mod session;
pub mod worker;

/// Identifies one `LogWatch` instance. Assigned sequentially by the
/// Manager starting at zero, and never reused.
pub type LwId = u64;
